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
//! Pipeline runtime module exports.
//!
//! Responsibilities:
//! - Exposes the operator contract, pipeline construction, events, scheduling and the
//!   graph executor.
//!
//! Current limitations:
//! - Pipelines are scheduled as whole task groups; there is no cooperative yielding.

pub mod builder;
pub mod dependency;
pub mod event;
pub mod executor;
pub mod operator;
pub mod pipeline;
pub mod schedule;
pub mod task_scheduler;
pub mod worker_pool;
