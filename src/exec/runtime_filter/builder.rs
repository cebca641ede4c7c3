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
//! Runtime filter builders.
//!
//! Responsibilities:
//! - Folds build-side key batches into one shared filter per `FilterSpec`.
//! - Offers single-threaded and parallel variants of each flavor, chosen once per
//!   operator instance at finalize time.
//! - Stages the built structure into the shared `RuntimeFilter` handle. Readiness is
//!   flipped by the caller once every builder of an operator has staged.
//!
//! Key exported interfaces:
//! - Traits: `FilterBuilder`, `FilterBuilderFactory`.
//! - Types: `BuilderParams`, `DefaultFilterBuilderFactory`.
//!
//! Current limitations:
//! - The parallel hash flavor shards by thread id and must be merged before publish;
//!   the parallel bloom flavor writes shared atomic words and has no merge step.

use std::fmt;
use std::sync::{Arc, Mutex};

use arrow::array::ArrayRef;

use super::bloom::{AtomicBlockBloomFilter, BlockBloomFilter, directory_bytes};
use super::handle::{BuiltFilter, FilterSpec, RuntimeFilter};
use super::hash_filter::ExactKeySet;
use super::key_encoder::{hash_key, rows_with_null_key};
use crate::common::app_config::FilterFlavor;
use crate::common::ids::FilterId;
use crate::common::status::{ExecError, ExecResult};
use crate::runtime::mem_tracker::{MemReservation, MemTracker};

/// Sizing and placement inputs fixed when builders are created.
#[derive(Clone)]
pub struct BuilderParams {
    /// Number of worker threads that may push concurrently. 1 selects single-threaded builders.
    pub thread_count: usize,
    /// Rows of the merged build side, used to size bloom filters.
    pub num_rows: usize,
    pub flavor: FilterFlavor,
    pub seed: u64,
    pub bits_per_key: usize,
    pub mem_tracker: Arc<MemTracker>,
}

impl fmt::Debug for BuilderParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderParams")
            .field("thread_count", &self.thread_count)
            .field("num_rows", &self.num_rows)
            .field("flavor", &self.flavor)
            .field("seed", &self.seed)
            .field("bits_per_key", &self.bits_per_key)
            .finish()
    }
}

/// Stateful accumulator producing one shared filter.
///
/// `push_next_batch` may be called concurrently from distinct thread ids. `thread_id`
/// is the scheduler's per-thread identity: 0 for a non-worker thread, otherwise in
/// `1..=thread_count`.
pub trait FilterBuilder: Send + Sync {
    /// Shared handle this builder fills.
    fn filter(&self) -> &Arc<RuntimeFilter>;

    fn filter_id(&self) -> FilterId {
        self.filter().id()
    }

    /// Positions of the build-side key columns.
    fn built_cols(&self) -> &[usize];

    fn thread_count(&self) -> usize;

    fn push_next_batch(&self, thread_id: usize, keys: &[ArrayRef], num_rows: usize)
    -> ExecResult<()>;

    /// Whether per-thread partial state must be unified before `stage`.
    fn requires_merge(&self) -> bool {
        false
    }

    fn merge(&self) -> ExecResult<()> {
        Ok(())
    }

    /// Move the built structure into the shared filter without marking it ready.
    fn stage(&self) -> ExecResult<()>;
}

pub trait FilterBuilderFactory: Send + Sync {
    fn create(&self, spec: &FilterSpec, params: &BuilderParams)
    -> ExecResult<Box<dyn FilterBuilder>>;
}

/// Picks the configured flavor, single-threaded iff `thread_count <= 1`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFilterBuilderFactory;

impl FilterBuilderFactory for DefaultFilterBuilderFactory {
    fn create(
        &self,
        spec: &FilterSpec,
        params: &BuilderParams,
    ) -> ExecResult<Box<dyn FilterBuilder>> {
        let parallel = params.thread_count > 1;
        Ok(match (params.flavor, parallel) {
            (FilterFlavor::Bloom, false) => Box::new(SingleBloomBuilder::new(spec, params)?),
            (FilterFlavor::Bloom, true) => Box::new(ParallelBloomBuilder::new(spec, params)?),
            (FilterFlavor::Hash, false) => Box::new(SingleHashBuilder::new(spec, params)),
            (FilterFlavor::Hash, true) => Box::new(ParallelHashBuilder::new(spec, params)),
        })
    }
}

/// Call `f` with the encoded key of every row without a null key column.
fn for_each_key(
    spec: &FilterSpec,
    keys: &[ArrayRef],
    num_rows: usize,
    mut f: impl FnMut(&[u8]),
) -> ExecResult<()> {
    let rows = spec.filter.encoder().encode(keys)?;
    let nulls = rows_with_null_key(keys, num_rows);
    for (i, is_null) in nulls.into_iter().enumerate() {
        if !is_null {
            f(rows.row(i).as_ref());
        }
    }
    Ok(())
}

fn check_thread_id(spec: &FilterSpec, thread_id: usize, thread_count: usize) -> ExecResult<()> {
    if thread_id > thread_count {
        return Err(ExecError::internal(format!(
            "runtime filter {} pushed from thread {} but was sized for {} threads",
            spec.filter.id(),
            thread_id,
            thread_count
        )));
    }
    Ok(())
}

/// Charge the bloom directory before it is allocated.
fn reserve_directory(params: &BuilderParams) -> ExecResult<MemReservation> {
    let bytes = directory_bytes(params.num_rows, params.bits_per_key);
    MemReservation::try_new(bytes, &params.mem_tracker)
}

fn already_published(spec: &FilterSpec) -> ExecError {
    ExecError::internal(format!(
        "runtime filter {} builder used after publish",
        spec.filter.id()
    ))
}

struct SingleBloomBuilder {
    spec: FilterSpec,
    seed: u64,
    filter: Mutex<Option<BlockBloomFilter>>,
    _reservation: MemReservation,
}

impl SingleBloomBuilder {
    fn new(spec: &FilterSpec, params: &BuilderParams) -> ExecResult<Self> {
        let reservation = reserve_directory(params)?;
        let filter = BlockBloomFilter::with_capacity(params.num_rows, params.bits_per_key);
        Ok(Self {
            spec: spec.clone(),
            seed: params.seed,
            filter: Mutex::new(Some(filter)),
            _reservation: reservation,
        })
    }
}

impl FilterBuilder for SingleBloomBuilder {
    fn filter(&self) -> &Arc<RuntimeFilter> {
        &self.spec.filter
    }

    fn built_cols(&self) -> &[usize] {
        &self.spec.build_columns
    }

    fn thread_count(&self) -> usize {
        1
    }

    fn push_next_batch(
        &self,
        _thread_id: usize,
        keys: &[ArrayRef],
        num_rows: usize,
    ) -> ExecResult<()> {
        let mut guard = self.filter.lock().expect("bloom builder lock");
        let filter = guard.as_mut().ok_or_else(|| already_published(&self.spec))?;
        for_each_key(&self.spec, keys, num_rows, |key| {
            filter.insert_hash(hash_key(self.seed, key))
        })
    }

    fn stage(&self) -> ExecResult<()> {
        let filter = self
            .filter
            .lock()
            .expect("bloom builder lock")
            .take()
            .ok_or_else(|| already_published(&self.spec))?;
        self.spec.filter.stage(BuiltFilter::Bloom {
            filter,
            seed: self.seed,
        })
    }
}

struct ParallelBloomBuilder {
    spec: FilterSpec,
    seed: u64,
    thread_count: usize,
    filter: AtomicBlockBloomFilter,
    _reservation: MemReservation,
}

impl ParallelBloomBuilder {
    fn new(spec: &FilterSpec, params: &BuilderParams) -> ExecResult<Self> {
        let reservation = reserve_directory(params)?;
        let filter = AtomicBlockBloomFilter::with_capacity(params.num_rows, params.bits_per_key);
        Ok(Self {
            spec: spec.clone(),
            seed: params.seed,
            thread_count: params.thread_count,
            filter,
            _reservation: reservation,
        })
    }
}

impl FilterBuilder for ParallelBloomBuilder {
    fn filter(&self) -> &Arc<RuntimeFilter> {
        &self.spec.filter
    }

    fn built_cols(&self) -> &[usize] {
        &self.spec.build_columns
    }

    fn thread_count(&self) -> usize {
        self.thread_count
    }

    fn push_next_batch(
        &self,
        thread_id: usize,
        keys: &[ArrayRef],
        num_rows: usize,
    ) -> ExecResult<()> {
        check_thread_id(&self.spec, thread_id, self.thread_count)?;
        for_each_key(&self.spec, keys, num_rows, |key| {
            self.filter.insert_hash(hash_key(self.seed, key))
        })
    }

    fn stage(&self) -> ExecResult<()> {
        self.spec.filter.stage(BuiltFilter::Bloom {
            filter: self.filter.freeze(),
            seed: self.seed,
        })
    }
}

/// Exact key set plus the memory charged for its keys.
#[derive(Default)]
struct ChargedKeySet {
    keys: ExactKeySet,
    reservations: Vec<MemReservation>,
}

impl ChargedKeySet {
    fn insert_batch(
        &mut self,
        spec: &FilterSpec,
        keys: &[ArrayRef],
        num_rows: usize,
        tracker: &Arc<MemTracker>,
    ) -> ExecResult<()> {
        let before = self.keys.key_bytes();
        for_each_key(spec, keys, num_rows, |key| {
            self.keys.insert(key);
        })?;
        let added = self.keys.key_bytes() - before;
        if added > 0 {
            self.reservations
                .push(MemReservation::try_new(added, tracker)?);
        }
        Ok(())
    }
}

struct SingleHashBuilder {
    spec: FilterSpec,
    tracker: Arc<MemTracker>,
    set: Mutex<Option<ChargedKeySet>>,
}

impl SingleHashBuilder {
    fn new(spec: &FilterSpec, params: &BuilderParams) -> Self {
        Self {
            spec: spec.clone(),
            tracker: Arc::clone(&params.mem_tracker),
            set: Mutex::new(Some(ChargedKeySet::default())),
        }
    }
}

impl FilterBuilder for SingleHashBuilder {
    fn filter(&self) -> &Arc<RuntimeFilter> {
        &self.spec.filter
    }

    fn built_cols(&self) -> &[usize] {
        &self.spec.build_columns
    }

    fn thread_count(&self) -> usize {
        1
    }

    fn push_next_batch(
        &self,
        _thread_id: usize,
        keys: &[ArrayRef],
        num_rows: usize,
    ) -> ExecResult<()> {
        let mut guard = self.set.lock().expect("hash builder lock");
        let set = guard.as_mut().ok_or_else(|| already_published(&self.spec))?;
        set.insert_batch(&self.spec, keys, num_rows, &self.tracker)
    }

    fn stage(&self) -> ExecResult<()> {
        let set = self
            .set
            .lock()
            .expect("hash builder lock")
            .take()
            .ok_or_else(|| already_published(&self.spec))?;
        self.spec.filter.stage(BuiltFilter::Exact(set.keys))
    }
}

struct ParallelHashBuilder {
    spec: FilterSpec,
    tracker: Arc<MemTracker>,
    thread_count: usize,
    /// One shard per thread id, including the non-worker id 0.
    shards: Vec<Mutex<ChargedKeySet>>,
    merged: Mutex<Option<ExactKeySet>>,
}

impl ParallelHashBuilder {
    fn new(spec: &FilterSpec, params: &BuilderParams) -> Self {
        let shards = (0..=params.thread_count)
            .map(|_| Mutex::new(ChargedKeySet::default()))
            .collect();
        Self {
            spec: spec.clone(),
            tracker: Arc::clone(&params.mem_tracker),
            thread_count: params.thread_count,
            shards,
            merged: Mutex::new(None),
        }
    }
}

impl FilterBuilder for ParallelHashBuilder {
    fn filter(&self) -> &Arc<RuntimeFilter> {
        &self.spec.filter
    }

    fn built_cols(&self) -> &[usize] {
        &self.spec.build_columns
    }

    fn thread_count(&self) -> usize {
        self.thread_count
    }

    fn push_next_batch(
        &self,
        thread_id: usize,
        keys: &[ArrayRef],
        num_rows: usize,
    ) -> ExecResult<()> {
        check_thread_id(&self.spec, thread_id, self.thread_count)?;
        let mut shard = self.shards[thread_id].lock().expect("hash shard lock");
        shard.insert_batch(&self.spec, keys, num_rows, &self.tracker)
    }

    fn requires_merge(&self) -> bool {
        true
    }

    fn merge(&self) -> ExecResult<()> {
        let mut merged = self.merged.lock().expect("hash builder merge lock");
        if merged.is_some() {
            return Err(ExecError::internal(format!(
                "runtime filter {} merged twice",
                self.spec.filter.id()
            )));
        }
        let mut out = ExactKeySet::new();
        for shard in &self.shards {
            let mut shard = shard.lock().expect("hash shard lock");
            let keys = std::mem::take(&mut shard.keys);
            out.merge_from(keys);
        }
        *merged = Some(out);
        Ok(())
    }

    fn stage(&self) -> ExecResult<()> {
        let merged = self
            .merged
            .lock()
            .expect("hash builder merge lock")
            .take()
            .ok_or_else(|| {
                ExecError::internal(format!(
                    "runtime filter {} staged before merge",
                    self.spec.filter.id()
                ))
            })?;
        self.spec.filter.stage(BuiltFilter::Exact(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::{BuilderParams, DefaultFilterBuilderFactory, FilterBuilderFactory};
    use crate::exec::runtime_filter::bloom::directory_bytes;
    use crate::common::app_config::FilterFlavor;
    use crate::common::ids::FilterId;
    use crate::common::status::ExecError;
    use crate::exec::runtime_filter::handle::{FilterSpec, RuntimeFilter};
    use crate::runtime::mem_tracker::MemTracker;
    use arrow::array::{Array, ArrayRef, Int64Array};
    use arrow::datatypes::DataType;
    use std::sync::Arc;

    fn spec(id: u32) -> FilterSpec {
        let filter = RuntimeFilter::new(FilterId::new(id), &[DataType::Int64]).unwrap();
        FilterSpec::new(filter, vec![0])
    }

    fn params(flavor: FilterFlavor, thread_count: usize, limit: i64) -> BuilderParams {
        BuilderParams {
            thread_count,
            num_rows: 1000,
            flavor,
            seed: 42,
            bits_per_key: 16,
            mem_tracker: MemTracker::new_root_with_limit("test", limit),
        }
    }

    fn keys(range: std::ops::Range<i64>) -> Vec<ArrayRef> {
        vec![Arc::new(Int64Array::from_iter_values(range))]
    }

    fn probe_all(spec: &FilterSpec, range: std::ops::Range<i64>) -> Vec<bool> {
        let probe = keys(range);
        let len = probe[0].len();
        let mask = spec.filter.probe(&probe, len).unwrap();
        (0..mask.len()).map(|i| mask.value(i)).collect()
    }

    #[test]
    fn single_threaded_builders_have_no_merge_step() {
        for flavor in [FilterFlavor::Bloom, FilterFlavor::Hash] {
            let spec = spec(1);
            let builder = DefaultFilterBuilderFactory
                .create(&spec, &params(flavor, 1, -1))
                .unwrap();
            assert_eq!(builder.thread_count(), 1);
            assert!(!builder.requires_merge());
            assert_eq!(builder.built_cols(), &[0]);
            builder.push_next_batch(0, &keys(0..500), 500).unwrap();
            assert!(!spec.filter.is_ready());
            builder.stage().unwrap();
            assert!(!spec.filter.is_ready());
            builder.filter().mark_ready().unwrap();
            assert!(spec.filter.is_ready());
            assert_eq!(spec.filter.flavor(), Some(flavor));
            assert!(probe_all(&spec, 0..500).into_iter().all(|hit| hit));
            assert!(builder.stage().unwrap_err().is_internal());
        }
    }

    #[test]
    fn parallel_hash_requires_merge_before_publish() {
        let spec = spec(2);
        let builder = DefaultFilterBuilderFactory
            .create(&spec, &params(FilterFlavor::Hash, 3, -1))
            .unwrap();
        assert!(builder.requires_merge());
        std::thread::scope(|s| {
            for t in 1..=3i64 {
                let builder = &builder;
                s.spawn(move || {
                    let range = (t * 100)..(t * 100 + 100);
                    builder
                        .push_next_batch(t as usize, &keys(range), 100)
                        .unwrap();
                });
            }
        });
        assert!(builder.stage().unwrap_err().is_internal());
        builder.merge().unwrap();
        builder.stage().unwrap();
        builder.filter().mark_ready().unwrap();
        let hits = probe_all(&spec, 0..500);
        assert!(hits[..100].iter().all(|hit| !hit));
        assert!(hits[100..400].iter().all(|hit| *hit));
        assert!(hits[400..].iter().all(|hit| !hit));
    }

    #[test]
    fn parallel_bloom_shares_atomic_state() {
        let spec = spec(3);
        let builder = DefaultFilterBuilderFactory
            .create(&spec, &params(FilterFlavor::Bloom, 4, -1))
            .unwrap();
        assert!(!builder.requires_merge());
        std::thread::scope(|s| {
            for t in 1..=4i64 {
                let builder = &builder;
                s.spawn(move || {
                    builder
                        .push_next_batch(t as usize, &keys((t * 250 - 250)..(t * 250)), 250)
                        .unwrap();
                });
            }
        });
        builder.stage().unwrap();
        builder.filter().mark_ready().unwrap();
        assert!(probe_all(&spec, 0..1000).into_iter().all(|hit| hit));
    }

    #[test]
    fn out_of_range_thread_id_is_internal() {
        let spec = spec(4);
        let builder = DefaultFilterBuilderFactory
            .create(&spec, &params(FilterFlavor::Hash, 2, -1))
            .unwrap();
        assert!(
            builder
                .push_next_batch(3, &keys(0..1), 1)
                .unwrap_err()
                .is_internal()
        );
    }

    #[test]
    fn bloom_directory_is_charged_to_tracker() {
        for threads in [1, 4] {
            let spec = spec(5);
            let err = DefaultFilterBuilderFactory
                .create(&spec, &params(FilterFlavor::Bloom, threads, 16))
                .err()
                .unwrap();
            assert!(matches!(err, ExecError::ResourceExhausted(_)));
        }
    }

    #[test]
    fn bloom_directory_reservation_matches_allocation() {
        let expected = directory_bytes(1000, 16) as i64;
        for threads in [1, 4] {
            let p = params(FilterFlavor::Bloom, threads, expected);
            let builder = DefaultFilterBuilderFactory.create(&spec(6), &p).unwrap();
            assert_eq!(p.mem_tracker.current(), expected);
            drop(builder);
            assert_eq!(p.mem_tracker.current(), 0);
        }
    }
}
