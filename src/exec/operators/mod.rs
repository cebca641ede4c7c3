// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Execution operator module exports.
//!
//! Responsibilities:
//! - Filter build, finalize scheduling and pipeline gating for runtime filter pushdown.
//! - Probe-side filter application plus the in-memory source and result sink used to
//!   feed and drain plans.

pub mod create_filter;
pub mod filter_finalize;
pub mod filter_gate;
pub mod result_sink;
pub mod use_filter;
pub mod values_source;

pub use create_filter::CreateFilterOperator;
pub use filter_finalize::{ChunkRange, plan_chunk_ranges, should_parallelize};
pub use filter_gate::{FilterBuildInput, FilterGateOperator};
pub use result_sink::{ResultSinkHandle, ResultSinkOperator};
pub use use_filter::UseFilterOperator;
pub use values_source::ValuesSourceOperator;
