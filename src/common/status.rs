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
//! Execution error taxonomy.
//!
//! Every failure in the filter pipeline propagates as an [`ExecError`] up to the
//! query's completion handle. Nothing is retried: the operations are deterministic.

use arrow::error::ArrowError;
use thiserror::Error;

/// Result alias used across the execution layer.
pub type ExecResult<T> = Result<T, ExecError>;

/// Error raised while building or running pipelines.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    /// A memory limit was hit. Aborts the query.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Planning or wiring bug (wrong state kind, missing sink state, ...).
    #[error("internal error: {0}")]
    Internal(String),
    /// A scheduled task failed; the owning event is failed as a whole.
    #[error("task failed: {0}")]
    TaskFailed(String),
    /// Operation that execution-only artifacts never support.
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("arrow error: {0}")]
    Arrow(String),
    /// Work skipped because the query already failed elsewhere.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ExecError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<ArrowError> for ExecError {
    fn from(err: ArrowError) -> Self {
        Self::Arrow(err.to_string())
    }
}
