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
//! Shared runtime filter handles.
//!
//! Responsibilities:
//! - One `RuntimeFilter` per planned filter id, shared by the build operator that fills
//!   it and every probe operator that reads it.
//! - Publication is one-shot and two-phase: `stage` stores the built structure,
//!   `mark_ready` flips the readiness dependency. Readers never observe a partially
//!   built filter.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilter`, `BuiltFilter`, `FilterSpec`, `FilterProbe`.

use std::fmt;
use std::sync::{Arc, OnceLock};

use arrow::array::{ArrayRef, BooleanArray};
use arrow::datatypes::DataType;

use super::bloom::BlockBloomFilter;
use super::hash_filter::ExactKeySet;
use super::key_encoder::{KeyEncoder, hash_key, rows_with_null_key};
use crate::common::app_config::FilterFlavor;
use crate::common::ids::FilterId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::predtrans_logging::debug;

/// Finished filter structure.
#[derive(Debug)]
pub enum BuiltFilter {
    Bloom { filter: BlockBloomFilter, seed: u64 },
    Exact(ExactKeySet),
}

impl BuiltFilter {
    pub fn flavor(&self) -> FilterFlavor {
        match self {
            BuiltFilter::Bloom { .. } => FilterFlavor::Bloom,
            BuiltFilter::Exact(_) => FilterFlavor::Hash,
        }
    }

    fn contains(&self, key: &[u8]) -> bool {
        match self {
            BuiltFilter::Bloom { filter, seed } => filter.test_hash(hash_key(*seed, key)),
            BuiltFilter::Exact(set) => set.contains(key),
        }
    }
}

pub struct RuntimeFilter {
    id: FilterId,
    encoder: KeyEncoder,
    built: OnceLock<BuiltFilter>,
    ready: DependencyHandle,
}

impl fmt::Debug for RuntimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFilter")
            .field("id", &self.id)
            .field("key_types", &self.encoder.key_types())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl RuntimeFilter {
    pub fn new(id: FilterId, key_types: &[DataType]) -> ExecResult<Arc<Self>> {
        Ok(Arc::new(Self {
            id,
            encoder: KeyEncoder::new(key_types)?,
            built: OnceLock::new(),
            ready: Dependency::new(format!("runtime_filter:{}", id)),
        }))
    }

    pub fn id(&self) -> FilterId {
        self.id
    }

    pub fn key_types(&self) -> &[DataType] {
        self.encoder.key_types()
    }

    pub fn encoder(&self) -> &KeyEncoder {
        &self.encoder
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    /// Flips once the filter is published.
    pub fn ready_dependency(&self) -> &DependencyHandle {
        &self.ready
    }

    pub fn flavor(&self) -> Option<FilterFlavor> {
        if !self.is_ready() {
            return None;
        }
        self.built.get().map(BuiltFilter::flavor)
    }

    /// Store the built structure. Readers keep seeing a not-ready filter until
    /// `mark_ready`.
    pub(crate) fn stage(&self, built: BuiltFilter) -> ExecResult<()> {
        self.built.set(built).map_err(|_| {
            ExecError::internal(format!("runtime filter {} published twice", self.id))
        })
    }

    pub(crate) fn mark_ready(&self) -> ExecResult<()> {
        let flavor = self.built.get().map(BuiltFilter::flavor).ok_or_else(|| {
            ExecError::internal(format!(
                "runtime filter {} marked ready before it was staged",
                self.id
            ))
        })?;
        self.ready.set_ready();
        debug!("runtime filter published: id={} flavor={}", self.id, flavor);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn publish(&self, built: BuiltFilter) -> ExecResult<()> {
        self.stage(built)?;
        self.mark_ready()
    }

    /// Membership of each probe row. Rows with a null key never match.
    pub fn probe(&self, keys: &[ArrayRef], num_rows: usize) -> ExecResult<BooleanArray> {
        let built = match self.built.get() {
            Some(built) if self.is_ready() => built,
            _ => {
                return Err(ExecError::internal(format!(
                    "runtime filter {} read before it was ready",
                    self.id
                )));
            }
        };
        let rows = self.encoder.encode(keys)?;
        let nulls = rows_with_null_key(keys, num_rows);
        let mask: Vec<bool> = (0..num_rows)
            .map(|i| !nulls[i] && built.contains(rows.row(i).as_ref()))
            .collect();
        Ok(BooleanArray::from(mask))
    }
}

/// One filter a build operator fills: the shared handle and the build-side key columns.
#[derive(Clone, Debug)]
pub struct FilterSpec {
    pub filter: Arc<RuntimeFilter>,
    pub build_columns: Vec<usize>,
}

impl FilterSpec {
    pub fn new(filter: Arc<RuntimeFilter>, build_columns: Vec<usize>) -> Self {
        Self {
            filter,
            build_columns,
        }
    }
}

/// One filter a probe operator applies: the shared handle and the probe-side key columns.
#[derive(Clone, Debug)]
pub struct FilterProbe {
    pub filter: Arc<RuntimeFilter>,
    pub probe_columns: Vec<usize>,
}
