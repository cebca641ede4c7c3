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
//! Parallel finalize of runtime filter builds.
//!
//! Responsibilities:
//! - Splits a materialized build side into disjoint contiguous chunk ranges.
//! - Schedules one task per range; each task feeds its chunks into every builder.
//! - After all tasks succeeded, merges builders that need it, stages every filter and
//!   only then marks them ready, so an operator never exposes a partial set.
//!
//! Key exported interfaces:
//! - Types: `ChunkRange`, `FilterFinalizeEvent`.
//! - Functions: `plan_chunk_ranges`, `should_parallelize`.

use std::fmt;
use std::sync::Arc;

use crate::common::status::ExecResult;
use crate::exec::chunk::ChunkCollection;
use crate::exec::pipeline::event::{EventHandler, Task};
use crate::exec::runtime_filter::FilterBuilder;
use crate::predtrans_logging::{debug, info};
use crate::runtime::runtime_state::RuntimeState;

/// Half-open range `[from, to)` of chunk indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub from: usize,
    pub to: usize,
}

impl ChunkRange {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> usize {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Whether finalize and replay of `num_rows` rows should use more than one unit of work.
pub fn should_parallelize(
    num_rows: usize,
    num_threads: usize,
    threshold: usize,
    verify_parallelism: bool,
) -> bool {
    num_threads > 1 && (verify_parallelism || num_rows >= threshold)
}

/// Disjoint cover of `[0, chunk_count)`.
///
/// One range when `parallel` is false or there is a single thread; otherwise at most
/// `num_threads` ranges of `ceil(chunk_count / num_threads)` chunks, never empty. An
/// empty input yields the single range `[0, 0)`.
pub fn plan_chunk_ranges(chunk_count: usize, num_threads: usize, parallel: bool) -> Vec<ChunkRange> {
    if chunk_count == 0 || !parallel || num_threads <= 1 {
        return vec![ChunkRange::new(0, chunk_count)];
    }
    let chunks_per_thread = chunk_count.div_ceil(num_threads).max(1);
    let mut ranges = Vec::with_capacity(num_threads);
    let mut from = 0;
    while from < chunk_count && ranges.len() < num_threads {
        let to = (from + chunks_per_thread).min(chunk_count);
        ranges.push(ChunkRange::new(from, to));
        from = to;
    }
    ranges
}

/// Task group feeding a materialized build side into the filter builders of one operator.
pub struct FilterFinalizeEvent {
    name: String,
    data: Arc<ChunkCollection>,
    builders: Arc<Vec<Box<dyn FilterBuilder>>>,
    ranges: Vec<ChunkRange>,
}

impl FilterFinalizeEvent {
    pub fn new(
        operator_name: &str,
        data: Arc<ChunkCollection>,
        builders: Vec<Box<dyn FilterBuilder>>,
        ranges: Vec<ChunkRange>,
    ) -> Self {
        Self {
            name: format!("{}FinalizeEvent", operator_name),
            data,
            builders: Arc::new(builders),
            ranges,
        }
    }

    pub fn ranges(&self) -> &[ChunkRange] {
        &self.ranges
    }
}

impl EventHandler for FilterFinalizeEvent {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, _state: &Arc<RuntimeState>) -> ExecResult<Vec<Box<dyn Task>>> {
        Ok(self
            .ranges
            .iter()
            .map(|range| {
                Box::new(FilterFinalizeTask {
                    data: Arc::clone(&self.data),
                    builders: Arc::clone(&self.builders),
                    range: *range,
                }) as Box<dyn Task>
            })
            .collect())
    }

    fn finish_event(&self, _state: &Arc<RuntimeState>) -> ExecResult<()> {
        for builder in self.builders.iter().filter(|b| b.requires_merge()) {
            builder.merge()?;
        }
        for builder in self.builders.iter() {
            builder.stage()?;
        }
        for builder in self.builders.iter() {
            builder.filter().mark_ready()?;
        }
        info!(
            "runtime filters ready: event={} filters={} rows={}",
            self.name,
            self.builders.len(),
            self.data.count()
        );
        Ok(())
    }
}

struct FilterFinalizeTask {
    data: Arc<ChunkCollection>,
    builders: Arc<Vec<Box<dyn FilterBuilder>>>,
    range: ChunkRange,
}

impl Task for FilterFinalizeTask {
    fn name(&self) -> String {
        format!("FilterFinalizeTask{}", self.range)
    }

    fn execute(self: Box<Self>, state: &RuntimeState) -> ExecResult<()> {
        let thread_id = state.scheduler().current_thread_id();
        let mut rows = 0usize;
        for idx in self.range.from..self.range.to {
            let chunk = self.data.fetch_chunk(idx)?;
            for builder in self.builders.iter() {
                let keys = chunk.key_columns(builder.built_cols())?;
                builder.push_next_batch(thread_id, &keys, chunk.len())?;
            }
            rows += chunk.len();
        }
        debug!(
            "filter finalize task done: range={} thread_id={} rows={}",
            self.range, thread_id, rows
        );
        Ok(())
    }
}
