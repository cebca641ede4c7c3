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
//! Filter-build operator.
//!
//! Responsibilities:
//! - Sink of the build pipeline: materializes every build-side chunk per driver and
//!   hands each driver's rows to the global state on combine.
//! - Finalize: merges the per-driver collections, creates one builder per filter and
//!   schedules the parallel finalize event that fills and publishes the filters.
//! - Source of the consuming pipeline: replays the materialized rows, unfiltered, in
//!   disjoint chunk ranges claimed lock-free by the drivers.
//!
//! Key exported interfaces:
//! - Types: `CreateFilterOperator`, `ReplayGlobalSourceState`.
//!
//! Current limitations:
//! - Replay does not preserve arrival order across drivers.
//! - Each driver claims at most one range for the lifetime of the source phase.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use arrow::datatypes::SchemaRef;

use crate::common::ids::{OperatorId, PipelineId};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkCollection};
use crate::exec::operators::filter_finalize::{
    ChunkRange, FilterFinalizeEvent, plan_chunk_ranges, should_parallelize,
};
use crate::exec::pipeline::builder::{MetaPipelineId, PipelineBuilder};
use crate::exec::pipeline::operator::{
    CombineResult, FinalizeResult, GlobalSinkState, GlobalSourceState, LocalSinkState,
    LocalSourceState, PendingEvents, PhysicalOperator, SinkResult, SourceResult, downcast_mut,
    downcast_ref,
};
use crate::exec::runtime_filter::{BuilderParams, FilterBuilderFactory, FilterSpec};
use crate::predtrans_logging::{debug, info};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

pub struct CreateFilterOperator {
    id: OperatorId,
    child: Arc<dyn PhysicalOperator>,
    specs: Vec<FilterSpec>,
    builder_factory: Arc<dyn FilterBuilderFactory>,
}

impl CreateFilterOperator {
    pub fn new(
        child: Arc<dyn PhysicalOperator>,
        specs: Vec<FilterSpec>,
        builder_factory: Arc<dyn FilterBuilderFactory>,
    ) -> ExecResult<Self> {
        let schema = child.schema();
        for spec in &specs {
            if spec.build_columns.len() != spec.filter.key_types().len() {
                return Err(ExecError::internal(format!(
                    "runtime filter {} has {} key types but {} build columns",
                    spec.filter.id(),
                    spec.filter.key_types().len(),
                    spec.build_columns.len()
                )));
            }
            for (col, expected) in spec.build_columns.iter().zip(spec.filter.key_types()) {
                let field = schema.fields().get(*col).ok_or_else(|| {
                    ExecError::internal(format!(
                        "runtime filter {} build column {} out of range",
                        spec.filter.id(),
                        col
                    ))
                })?;
                if field.data_type() != expected {
                    return Err(ExecError::internal(format!(
                        "runtime filter {} build column {} has type {:?}, expected {:?}",
                        spec.filter.id(),
                        col,
                        field.data_type(),
                        expected
                    )));
                }
            }
        }
        Ok(Self {
            id: OperatorId::next(),
            child,
            specs,
            builder_factory,
        })
    }

    pub fn specs(&self) -> &[FilterSpec] {
        &self.specs
    }

    /// Make `current` wait for the pipeline sinking into this operator, creating that
    /// pipeline the first time any consumer asks for it.
    pub(crate) fn ensure_build_pipeline(
        &self,
        this: &Arc<dyn PhysicalOperator>,
        current: PipelineId,
        meta: MetaPipelineId,
        builder: &mut PipelineBuilder,
    ) -> ExecResult<()> {
        if let Some(existing) = builder.filter_build_pipeline(self.id) {
            debug!(
                "reuse filter build pipeline: operator_id={} pipeline={} consumer={}",
                self.id, existing, current
            );
            return builder.add_dependency(current, existing);
        }
        let child_meta = builder.create_child_meta_pipeline(current, meta, Arc::clone(this))?;
        let build_pipeline = builder.base_pipeline(child_meta)?;
        builder.record_filter_build_pipeline(self.id, build_pipeline)?;
        builder.build(child_meta, Arc::clone(&self.child))
    }

    fn replay_parallel(&self, state: &RuntimeState, num_rows: usize) -> bool {
        let options = state.options();
        should_parallelize(
            num_rows,
            state.number_of_threads(),
            options.parallel_construct_threshold,
            options.verify_parallelism,
        )
    }
}

struct CreateFilterGlobalSinkState {
    mem_tracker: Arc<MemTracker>,
    pending: Mutex<Vec<ChunkCollection>>,
    data: OnceLock<Arc<ChunkCollection>>,
}

impl GlobalSinkState for CreateFilterGlobalSinkState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct CreateFilterLocalSinkState {
    collection: ChunkCollection,
}

impl LocalSinkState for CreateFilterLocalSinkState {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Range table and claim cursor of the replay phase.
pub struct ReplayGlobalSourceState {
    data: Arc<ChunkCollection>,
    ranges: Vec<ChunkRange>,
    cursor: AtomicUsize,
}

impl ReplayGlobalSourceState {
    pub fn new(data: Arc<ChunkCollection>, ranges: Vec<ChunkRange>) -> Self {
        Self {
            data,
            ranges,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn ranges(&self) -> &[ChunkRange] {
        &self.ranges
    }

    /// Claim the next unclaimed range. Every index is handed out at most once.
    pub fn claim(&self) -> Option<(usize, ChunkRange)> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.ranges.get(idx).map(|range| (idx, *range))
    }
}

impl GlobalSourceState for ReplayGlobalSourceState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn max_threads(&self) -> usize {
        self.ranges.len().max(1)
    }
}

enum ReplayLocalSourceState {
    Unclaimed,
    Claimed { range: ChunkRange, next: usize },
    Exhausted,
}

impl LocalSourceState for ReplayLocalSourceState {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl PhysicalOperator for CreateFilterOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &str {
        "CreateFilter"
    }

    fn schema(&self) -> SchemaRef {
        self.child.schema()
    }

    fn params_to_string(&self) -> String {
        self.specs
            .iter()
            .map(|spec| {
                let cols = spec
                    .build_columns
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                format!("rf{}:[{}]", spec.filter.id(), cols)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    // ---- source ----

    fn is_source(&self) -> bool {
        true
    }

    fn global_source_state(&self, state: &RuntimeState) -> ExecResult<Arc<dyn GlobalSourceState>> {
        let sink_state = state.sink_state_as::<CreateFilterGlobalSinkState>(self.id)?;
        let data = sink_state.data.get().cloned().ok_or_else(|| {
            ExecError::internal(format!(
                "operator {}#{} replayed before its build finalized",
                self.name(),
                self.id
            ))
        })?;
        let parallel = self.replay_parallel(state, data.count());
        let ranges = plan_chunk_ranges(data.chunk_count(), state.number_of_threads(), parallel);
        debug!(
            "replay source ready: operator_id={} rows={} chunks={} ranges={}",
            self.id,
            data.count(),
            data.chunk_count(),
            ranges.len()
        );
        Ok(Arc::new(ReplayGlobalSourceState::new(data, ranges)))
    }

    fn local_source_state(
        &self,
        _state: &RuntimeState,
        _gstate: &dyn GlobalSourceState,
    ) -> ExecResult<Box<dyn LocalSourceState>> {
        Ok(Box::new(ReplayLocalSourceState::Unclaimed))
    }

    fn get_data(
        &self,
        _state: &RuntimeState,
        gstate: &dyn GlobalSourceState,
        lstate: &mut dyn LocalSourceState,
    ) -> ExecResult<SourceResult> {
        let gstate =
            downcast_ref::<ReplayGlobalSourceState>(gstate.as_any(), self.name(), "source state")?;
        let lstate = downcast_mut::<ReplayLocalSourceState>(
            lstate.as_any_mut(),
            self.name(),
            "local source state",
        )?;
        loop {
            match *lstate {
                ReplayLocalSourceState::Unclaimed => {
                    *lstate = match gstate.claim() {
                        Some((_, range)) => ReplayLocalSourceState::Claimed {
                            range,
                            next: range.from,
                        },
                        None => ReplayLocalSourceState::Exhausted,
                    };
                }
                ReplayLocalSourceState::Claimed { range, next } => {
                    if next >= range.to {
                        *lstate = ReplayLocalSourceState::Exhausted;
                        continue;
                    }
                    let chunk = gstate.data.fetch_chunk(next)?;
                    *lstate = ReplayLocalSourceState::Claimed {
                        range,
                        next: next + 1,
                    };
                    return Ok(SourceResult::HaveMoreOutput(chunk));
                }
                ReplayLocalSourceState::Exhausted => return Ok(SourceResult::Finished),
            }
        }
    }

    // ---- sink ----

    fn is_sink(&self) -> bool {
        true
    }

    fn global_sink_state(&self, state: &RuntimeState) -> ExecResult<Arc<dyn GlobalSinkState>> {
        let mem_tracker = MemTracker::new_child(
            format!("{}#{}", self.name(), self.id),
            state.mem_tracker(),
        );
        Ok(Arc::new(CreateFilterGlobalSinkState {
            mem_tracker,
            pending: Mutex::new(Vec::new()),
            data: OnceLock::new(),
        }))
    }

    fn local_sink_state(
        &self,
        state: &RuntimeState,
        gstate: &dyn GlobalSinkState,
    ) -> ExecResult<Box<dyn LocalSinkState>> {
        let gstate =
            downcast_ref::<CreateFilterGlobalSinkState>(gstate.as_any(), self.name(), "sink state")?;
        let collection = ChunkCollection::new(self.schema(), state.chunk_size())
            .with_mem_tracker(Arc::clone(&gstate.mem_tracker));
        Ok(Box::new(CreateFilterLocalSinkState { collection }))
    }

    fn sink(
        &self,
        _state: &RuntimeState,
        _gstate: &dyn GlobalSinkState,
        lstate: &mut dyn LocalSinkState,
        chunk: Chunk,
    ) -> ExecResult<SinkResult> {
        let lstate = downcast_mut::<CreateFilterLocalSinkState>(
            lstate.as_any_mut(),
            self.name(),
            "local sink state",
        )?;
        if lstate.collection.is_empty() {
            debug!(
                "CreateFilter first input: operator_id={} rows={}",
                self.id,
                chunk.len()
            );
        }
        lstate.collection.append(chunk)?;
        Ok(SinkResult::NeedMoreInput)
    }

    fn combine(
        &self,
        state: &RuntimeState,
        gstate: &dyn GlobalSinkState,
        lstate: &mut dyn LocalSinkState,
    ) -> ExecResult<CombineResult> {
        let gstate =
            downcast_ref::<CreateFilterGlobalSinkState>(gstate.as_any(), self.name(), "sink state")?;
        let lstate = downcast_mut::<CreateFilterLocalSinkState>(
            lstate.as_any_mut(),
            self.name(),
            "local sink state",
        )?;
        let local = std::mem::replace(
            &mut lstate.collection,
            ChunkCollection::new(self.schema(), state.chunk_size()),
        );
        debug!(
            "CreateFilter combine: operator_id={} rows={} chunks={}",
            self.id,
            local.count(),
            local.chunk_count()
        );
        gstate
            .pending
            .lock()
            .expect("create filter pending lock")
            .push(local);
        Ok(CombineResult::Finished)
    }

    fn finalize(
        &self,
        state: &Arc<RuntimeState>,
        gstate: &Arc<dyn GlobalSinkState>,
        events: &mut PendingEvents,
    ) -> ExecResult<FinalizeResult> {
        let gstate =
            downcast_ref::<CreateFilterGlobalSinkState>(gstate.as_any(), self.name(), "sink state")?;
        let pending = std::mem::take(
            &mut *gstate.pending.lock().expect("create filter pending lock"),
        );
        let mut merged = ChunkCollection::new(self.schema(), state.chunk_size())
            .with_mem_tracker(Arc::clone(&gstate.mem_tracker));
        for mut local in pending {
            merged.combine(&mut local)?;
        }
        let data = Arc::new(merged);
        gstate.data.set(Arc::clone(&data)).map_err(|_| {
            ExecError::internal(format!(
                "operator {}#{} finalized twice",
                self.name(),
                self.id
            ))
        })?;

        let options = state.options();
        let thread_count = state.number_of_threads();
        let params = BuilderParams {
            thread_count,
            num_rows: data.count(),
            flavor: options.filter_flavor,
            seed: options.filter_seed,
            bits_per_key: options.bloom_bits_per_key,
            mem_tracker: Arc::clone(&gstate.mem_tracker),
        };
        let builders = self
            .specs
            .iter()
            .map(|spec| self.builder_factory.create(spec, &params))
            .collect::<ExecResult<Vec<_>>>()?;
        let parallel = should_parallelize(
            data.count(),
            thread_count,
            options.parallel_construct_threshold,
            options.verify_parallelism,
        );
        let ranges = plan_chunk_ranges(data.chunk_count(), thread_count, parallel);
        info!(
            "CreateFilter finalize: operator_id={} rows={} chunks={} filters={} flavor={} builder_threads={} tasks={}",
            self.id,
            data.count(),
            data.chunk_count(),
            builders.len(),
            params.flavor,
            thread_count,
            ranges.len()
        );
        events.insert(Box::new(FilterFinalizeEvent::new(
            self.name(),
            data,
            builders,
            ranges,
        )));
        Ok(FinalizeResult::Ready)
    }

    // ---- construction ----

    fn build_pipelines(
        &self,
        this: &Arc<dyn PhysicalOperator>,
        current: PipelineId,
        meta: MetaPipelineId,
        builder: &mut PipelineBuilder,
    ) -> ExecResult<()> {
        builder.set_pipeline_source(current, Arc::clone(this))?;
        self.ensure_build_pipeline(this, current, meta, builder)
    }
}
