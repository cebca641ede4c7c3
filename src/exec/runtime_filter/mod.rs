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
//! Runtime filters pushed from a join's build side to its probe side.
//!
//! Responsibilities:
//! - Shared filter handles that build operators publish and probe operators read.
//! - Bloom and exact-set filter structures over row-encoded join keys.
//! - Builder variants (single-threaded, parallel) selected per operator instance.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilter`, `BuiltFilter`, `FilterSpec`, `FilterProbe`, `BuilderParams`,
//!   `DefaultFilterBuilderFactory`.
//! - Traits: `FilterBuilder`, `FilterBuilderFactory`.

pub mod bloom;
pub mod builder;
pub mod handle;
pub mod hash_filter;
pub mod key_encoder;

pub use builder::{BuilderParams, DefaultFilterBuilderFactory, FilterBuilder, FilterBuilderFactory};
pub use handle::{BuiltFilter, FilterProbe, FilterSpec, RuntimeFilter};
