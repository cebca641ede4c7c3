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
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::app_config::FilterFlavor;
use crate::common::config;
use crate::common::ids::OperatorId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::operator::GlobalSinkState;
use crate::exec::pipeline::task_scheduler::TaskScheduler;
use crate::predtrans_logging::debug;
use crate::runtime::mem_tracker::MemTracker;

/// Query options snapshotted when a query starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOptions {
    pub chunk_size: usize,
    /// Row count below which finalize and replay collapse to a single unit of work.
    pub parallel_construct_threshold: usize,
    pub verify_parallelism: bool,
    pub filter_flavor: FilterFlavor,
    pub filter_seed: u64,
    pub bloom_bits_per_key: usize,
    /// Negative means unlimited.
    pub query_mem_limit_bytes: i64,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            chunk_size: 2048,
            parallel_construct_threshold: 1_048_576,
            verify_parallelism: false,
            filter_flavor: FilterFlavor::Bloom,
            filter_seed: 0,
            bloom_bits_per_key: 16,
            query_mem_limit_bytes: -1,
        }
    }
}

impl ExecOptions {
    pub fn from_config() -> Self {
        Self {
            chunk_size: config::chunk_size(),
            parallel_construct_threshold: config::parallel_construct_threshold(),
            verify_parallelism: config::verify_parallelism(),
            filter_flavor: config::runtime_filter_flavor(),
            filter_seed: config::runtime_filter_seed(),
            bloom_bits_per_key: config::bloom_bits_per_key(),
            query_mem_limit_bytes: config::query_mem_limit_bytes(),
        }
    }
}

/// RuntimeState is the per-query execution context.
///
/// It carries the task scheduler handle, the query options, the query memory tracker
/// and the registry of global sink states keyed by operator id. Operators that act as
/// both sink and source (or events finishing a sink) look their state up here.
pub struct RuntimeState {
    scheduler: Arc<dyn TaskScheduler>,
    options: ExecOptions,
    mem_tracker: Arc<MemTracker>,
    sink_states: Mutex<HashMap<OperatorId, Arc<dyn GlobalSinkState>>>,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("threads", &self.scheduler.number_of_threads())
            .field("options", &self.options)
            .field("mem_tracker", &self.mem_tracker.label())
            .finish()
    }
}

impl RuntimeState {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, options: ExecOptions) -> Arc<Self> {
        let mem_tracker = MemTracker::new_root_with_limit("query", options.query_mem_limit_bytes);
        Arc::new(Self {
            scheduler,
            options,
            mem_tracker,
            sink_states: Mutex::new(HashMap::new()),
        })
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    pub fn number_of_threads(&self) -> usize {
        self.scheduler.number_of_threads().max(1)
    }

    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    pub fn chunk_size(&self) -> usize {
        self.options.chunk_size.max(1)
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn register_sink_state(
        &self,
        id: OperatorId,
        sink_state: Arc<dyn GlobalSinkState>,
    ) -> ExecResult<()> {
        let mut guard = self.sink_states.lock().expect("sink state registry lock");
        if guard.contains_key(&id) {
            return Err(ExecError::internal(format!(
                "global sink state registered twice for operator {}",
                id
            )));
        }
        debug!("register sink state: operator_id={}", id);
        guard.insert(id, sink_state);
        Ok(())
    }

    pub fn sink_state(&self, id: OperatorId) -> ExecResult<Arc<dyn GlobalSinkState>> {
        let guard = self.sink_states.lock().expect("sink state registry lock");
        guard.get(&id).cloned().ok_or_else(|| {
            ExecError::internal(format!("missing global sink state for operator {}", id))
        })
    }

    /// Look up the sink state of `id` and downcast it to the concrete kind `T`.
    pub fn sink_state_as<T: Any + Send + Sync>(&self, id: OperatorId) -> ExecResult<Arc<T>> {
        downcast_sink_state::<T>(self.sink_state(id)?, id)
    }
}

pub fn downcast_sink_state<T: Any + Send + Sync>(
    state: Arc<dyn GlobalSinkState>,
    id: OperatorId,
) -> ExecResult<Arc<T>> {
    state.into_any().downcast::<T>().map_err(|_| {
        ExecError::internal(format!(
            "global sink state of operator {} is not a {}",
            id,
            std::any::type_name::<T>()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::{ExecOptions, RuntimeState};
    use crate::common::ids::OperatorId;
    use crate::exec::pipeline::operator::GlobalSinkState;
    use crate::exec::pipeline::worker_pool::WorkerPool;
    use std::any::Any;
    use std::sync::Arc;

    struct CountState(usize);

    impl GlobalSinkState for CountState {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[derive(Debug)]
    struct OtherState;

    impl GlobalSinkState for OtherState {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn sink_state_lookup_checks_presence_and_kind() {
        let state = RuntimeState::new(WorkerPool::new(1), ExecOptions::default());
        let id = OperatorId::next();
        assert!(state.sink_state(id).err().unwrap().is_internal());

        state.register_sink_state(id, Arc::new(CountState(3))).unwrap();
        assert_eq!(state.sink_state_as::<CountState>(id).unwrap().0, 3);
        assert!(state.sink_state_as::<OtherState>(id).unwrap_err().is_internal());
        assert!(
            state
                .register_sink_state(id, Arc::new(OtherState))
                .unwrap_err()
                .is_internal()
        );
    }

    #[test]
    fn query_tracker_uses_configured_limit() {
        let options = ExecOptions {
            query_mem_limit_bytes: 1024,
            ..ExecOptions::default()
        };
        let state = RuntimeState::new(WorkerPool::new(1), options);
        assert_eq!(state.mem_tracker().limit(), 1024);
        assert_eq!(state.number_of_threads(), 1);
    }
}
