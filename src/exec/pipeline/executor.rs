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
//! Top-level pipeline executor entrypoint.
//!
//! Responsibilities:
//! - Builds the pipeline graph for a physical plan and runs it on the query's scheduler.
//! - Starts a pipeline once every pipeline it depends on has completed.
//! - Drives source -> operators -> sink per driver, then combine, then one finalize.
//! - Treats a pipeline as complete only after the events its finalize inserted completed.
//!
//! Key exported interfaces:
//! - Functions: `execute_plan_with_pipeline`, `execute_pipeline_graph`.
//!
//! Current limitations:
//! - The first failure aborts the query; drivers stop at their next chunk boundary and
//!   pipelines not yet started are never started.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::common::ids::PipelineId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::builder::{PipelineBuilder, PipelineGraph};
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::exec::pipeline::event::Event;
use crate::exec::pipeline::operator::{
    GlobalSinkState, GlobalSourceState, PendingEvents, PhysicalOperator, SinkResult, SourceResult,
};
use crate::exec::pipeline::pipeline::Pipeline;
use crate::exec::pipeline::task_scheduler::Job;
use crate::exec::pipeline::worker_pool::panic_message;
use crate::predtrans_logging::{debug, info, warn};
use crate::runtime::runtime_state::RuntimeState;

/// Execute `root` with its output flowing into `sink`, blocking until the query finished.
pub fn execute_plan_with_pipeline(
    root: Arc<dyn PhysicalOperator>,
    sink: Arc<dyn PhysicalOperator>,
    state: &Arc<RuntimeState>,
) -> ExecResult<()> {
    let graph = PipelineBuilder::build_graph(root, sink)?;
    execute_pipeline_graph(graph, state)
}

pub fn execute_pipeline_graph(graph: PipelineGraph, state: &Arc<RuntimeState>) -> ExecResult<()> {
    info!(
        "execute pipeline graph: pipelines={} threads={}\n{}",
        graph.len(),
        state.number_of_threads(),
        graph.describe()
    );
    let run = GraphRun::new(graph, state);
    run.start();
    let result = run.completion.wait();
    if let Err(err) = &result {
        warn!("query failed: {}", err);
    }
    result
}

/// Query-wide completion tracking.
struct QueryCompletion {
    mu: Mutex<QueryCompletionState>,
    cv: Condvar,
}

#[derive(Debug)]
struct QueryCompletionState {
    /// Pipelines not yet completed.
    remaining: usize,
    /// Pipelines started and not yet completed or terminated.
    running: usize,
    aborting: bool,
    error: Option<ExecError>,
}

impl QueryCompletion {
    fn new(pipeline_count: usize) -> Self {
        Self {
            mu: Mutex::new(QueryCompletionState {
                remaining: pipeline_count,
                running: 0,
                aborting: false,
                error: None,
            }),
            cv: Condvar::new(),
        }
    }

    fn should_abort(&self) -> bool {
        self.mu.lock().expect("query completion lock").aborting
    }

    fn fail(&self, err: ExecError) {
        let mut st = self.mu.lock().expect("query completion lock");
        if st.error.is_none() {
            st.error = Some(err);
        }
        st.aborting = true;
        self.cv.notify_all();
    }

    fn pipeline_started(&self) {
        let mut st = self.mu.lock().expect("query completion lock");
        st.running += 1;
    }

    fn pipeline_completed(&self) {
        let mut st = self.mu.lock().expect("query completion lock");
        st.remaining = st.remaining.saturating_sub(1);
        st.running = st.running.saturating_sub(1);
        self.cv.notify_all();
    }

    /// A started pipeline stopped without completing.
    fn pipeline_terminated(&self) {
        let mut st = self.mu.lock().expect("query completion lock");
        st.running = st.running.saturating_sub(1);
        self.cv.notify_all();
    }

    fn wait(&self) -> ExecResult<()> {
        let mut st = self.mu.lock().expect("query completion lock");
        while st.remaining > 0 && !(st.aborting && st.running == 0) {
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        match st.error.clone() {
            Some(err) => Err(err),
            None if st.remaining > 0 => Err(ExecError::internal(format!(
                "query stopped with {} pipelines unfinished",
                st.remaining
            ))),
            None => Ok(()),
        }
    }
}

struct PipelineRun {
    pipeline: Pipeline,
    finished: DependencyHandle,
    pending_deps: AtomicUsize,
}

/// Per-run execution objects of one started pipeline.
struct PipelineExec {
    id: PipelineId,
    source: Arc<dyn PhysicalOperator>,
    operators: Vec<Arc<dyn PhysicalOperator>>,
    sink: Arc<dyn PhysicalOperator>,
    gsource: Arc<dyn GlobalSourceState>,
    gsink: Arc<dyn GlobalSinkState>,
    remaining_drivers: AtomicUsize,
}

/// Events inserted by one finalize; the pipeline completes when all of them succeeded.
struct EventBarrier {
    remaining: AtomicUsize,
    failed: AtomicBool,
}

struct GraphRun {
    pipelines: Vec<PipelineRun>,
    state: Arc<RuntimeState>,
    completion: QueryCompletion,
}

impl GraphRun {
    fn new(graph: PipelineGraph, state: &Arc<RuntimeState>) -> Arc<Self> {
        let pipelines: Vec<PipelineRun> = graph
            .into_pipelines()
            .into_iter()
            .map(|pipeline| PipelineRun {
                finished: Dependency::new(format!("pipeline_finish:{}", pipeline.id())),
                pending_deps: AtomicUsize::new(pipeline.dependencies().len()),
                pipeline,
            })
            .collect();
        let completion = QueryCompletion::new(pipelines.len());
        Arc::new(Self {
            pipelines,
            state: Arc::clone(state),
            completion,
        })
    }

    fn start(self: &Arc<Self>) {
        for run in &self.pipelines {
            let id = run.pipeline.id();
            for dep in run.pipeline.dependencies() {
                let weak: Weak<GraphRun> = Arc::downgrade(self);
                self.pipelines[dep.0].finished.add_waiter(Arc::new(move || {
                    if let Some(graph) = weak.upgrade() {
                        graph.dependency_finished(id);
                    }
                }));
            }
        }
        let roots: Vec<PipelineId> = self
            .pipelines
            .iter()
            .filter(|run| run.pipeline.dependencies().is_empty())
            .map(|run| run.pipeline.id())
            .collect();
        for id in roots {
            self.start_pipeline(id);
        }
    }

    fn dependency_finished(self: &Arc<Self>, id: PipelineId) {
        if self.pipelines[id.0]
            .pending_deps
            .fetch_sub(1, Ordering::AcqRel)
            == 1
        {
            self.start_pipeline(id);
        }
    }

    fn start_pipeline(self: &Arc<Self>, id: PipelineId) {
        if self.completion.should_abort() {
            debug!("skip pipeline start after abort: pipeline={}", id);
            return;
        }
        self.completion.pipeline_started();
        let exec = match self.prepare_pipeline(id) {
            Ok(exec) => exec,
            Err(err) => {
                self.completion.fail(err);
                self.completion.pipeline_terminated();
                return;
            }
        };
        let dop = exec.remaining_drivers.load(Ordering::Acquire);
        info!(
            "pipeline scheduled: pipeline={} dop={} chain={}",
            id,
            dop,
            self.pipelines[id.0].pipeline.operator_chain()
        );
        let jobs: Vec<Job> = (0..dop)
            .map(|driver_idx| {
                let graph = Arc::clone(self);
                let exec = Arc::clone(&exec);
                Box::new(move || graph.run_driver(&exec, driver_idx)) as Job
            })
            .collect();
        if let Err(err) = self.state.scheduler().schedule(jobs) {
            self.completion.fail(err);
            self.completion.pipeline_terminated();
        }
    }

    fn prepare_pipeline(&self, id: PipelineId) -> ExecResult<Arc<PipelineExec>> {
        let pipeline = &self.pipelines[id.0].pipeline;
        let source = Arc::clone(pipeline.source()?);
        let sink = Arc::clone(pipeline.sink()?);
        let gsink = sink.global_sink_state(&self.state)?;
        self.state
            .register_sink_state(sink.id(), Arc::clone(&gsink))?;
        let gsource = source.global_source_state(&self.state)?;
        let dop = gsource
            .max_threads()
            .min(self.state.number_of_threads())
            .max(1);
        Ok(Arc::new(PipelineExec {
            id,
            source,
            operators: pipeline.operators().to_vec(),
            sink,
            gsource,
            gsink,
            remaining_drivers: AtomicUsize::new(dop),
        }))
    }

    fn run_driver(self: &Arc<Self>, exec: &Arc<PipelineExec>, driver_idx: usize) {
        if !self.completion.should_abort() {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.drive(exec)))
                    .unwrap_or_else(|payload| {
                        Err(ExecError::TaskFailed(format!(
                            "panic in pipeline {} driver {}: {}",
                            exec.id,
                            driver_idx,
                            panic_message(payload.as_ref())
                        )))
                    });
            if let Err(err) = outcome {
                warn!(
                    "pipeline driver failed: pipeline={} driver={} error={}",
                    exec.id, driver_idx, err
                );
                self.completion.fail(err);
            }
        }
        if exec.remaining_drivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish_pipeline(exec);
        }
    }

    fn drive(&self, exec: &PipelineExec) -> ExecResult<()> {
        let state = self.state.as_ref();
        let mut lsource = exec
            .source
            .local_source_state(state, exec.gsource.as_ref())?;
        let mut lsink = exec.sink.local_sink_state(state, exec.gsink.as_ref())?;
        'next_chunk: loop {
            if self.completion.should_abort() {
                return Ok(());
            }
            let mut chunk = match exec
                .source
                .get_data(state, exec.gsource.as_ref(), lsource.as_mut())?
            {
                SourceResult::HaveMoreOutput(chunk) => chunk,
                SourceResult::Finished => break,
            };
            for op in &exec.operators {
                match op.execute(state, chunk)? {
                    Some(out) => chunk = out,
                    None => continue 'next_chunk,
                }
            }
            if chunk.is_empty() {
                continue;
            }
            let sunk = exec
                .sink
                .sink(state, exec.gsink.as_ref(), lsink.as_mut(), chunk)?;
            if sunk == SinkResult::Finished {
                break;
            }
        }
        exec.sink
            .combine(state, exec.gsink.as_ref(), lsink.as_mut())?;
        Ok(())
    }

    /// Runs on the last driver of a pipeline.
    fn finish_pipeline(self: &Arc<Self>, exec: &Arc<PipelineExec>) {
        if self.completion.should_abort() {
            self.completion.pipeline_terminated();
            return;
        }
        let mut events = PendingEvents::default();
        let finalized = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            exec.sink.finalize(&self.state, &exec.gsink, &mut events)
        }))
        .unwrap_or_else(|payload| {
            Err(ExecError::TaskFailed(format!(
                "panic in finalize of {}: {}",
                exec.sink.name(),
                panic_message(payload.as_ref())
            )))
        });
        if let Err(err) = finalized {
            warn!(
                "sink finalize failed: pipeline={} sink={} error={}",
                exec.id,
                exec.sink.name(),
                err
            );
            self.completion.fail(err);
            self.completion.pipeline_terminated();
            return;
        }

        let handlers = events.into_handlers();
        if handlers.is_empty() {
            self.complete_pipeline(exec.id);
            return;
        }
        let barrier = Arc::new(EventBarrier {
            remaining: AtomicUsize::new(handlers.len()),
            failed: AtomicBool::new(false),
        });
        for handler in handlers {
            let event = Event::new(handler);
            let graph = Arc::clone(self);
            let barrier_cloned = Arc::clone(&barrier);
            let id = exec.id;
            event.on_complete(move |result| graph.event_done(&barrier_cloned, id, result));
            if let Err(err) = event.schedule(&self.state) {
                self.event_done(&barrier, exec.id, Err(err));
            }
        }
    }

    fn event_done(&self, barrier: &EventBarrier, id: PipelineId, result: ExecResult<()>) {
        if let Err(err) = result {
            barrier.failed.store(true, Ordering::Release);
            self.completion.fail(err);
        }
        if barrier.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if barrier.failed.load(Ordering::Acquire) {
                self.completion.pipeline_terminated();
            } else {
                self.complete_pipeline(id);
            }
        }
    }

    fn complete_pipeline(&self, id: PipelineId) {
        info!("pipeline finished: pipeline={}", id);
        // Dependents are started before this pipeline stops counting as running.
        self.pipelines[id.0].finished.set_ready();
        self.completion.pipeline_completed();
    }
}
