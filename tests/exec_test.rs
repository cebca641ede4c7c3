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
//! Integration tests for runtime filter build, finalize and pipeline gating.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Array, ArrayRef, Int64Array};
use arrow::datatypes::DataType;

use crate::common::{
    key_batches, key_schema, run_with_timeout, sorted_keys, test_options, test_state, total_rows,
};
use predtrans::common::app_config::FilterFlavor;
use predtrans::exec::chunk::{Chunk, record_batch_bytes};
use predtrans::exec::operators::create_filter::ReplayGlobalSourceState;
use predtrans::exec::operators::{
    ChunkRange, CreateFilterOperator, FilterBuildInput, FilterGateOperator, ResultSinkHandle,
    ResultSinkOperator, UseFilterOperator, ValuesSourceOperator,
};
use predtrans::exec::pipeline::builder::PipelineBuilder;
use predtrans::exec::pipeline::executor::{execute_pipeline_graph, execute_plan_with_pipeline};
use predtrans::exec::pipeline::operator::PhysicalOperator;
use predtrans::exec::runtime_filter::{
    BuilderParams, DefaultFilterBuilderFactory, FilterBuilder, FilterBuilderFactory, FilterProbe,
    FilterSpec, RuntimeFilter,
};
use predtrans::lower::{LogicalFilterBuild, LogicalFilterProbe, LogicalPlan, PlanLowering};
use predtrans::{ExecError, ExecResult, FilterId, execute_plan_with_pipeline as top_level_execute};

mod common;

const TIMEOUT: Duration = Duration::from_secs(60);

/// One `push_next_batch` call seen by a recording builder.
#[derive(Clone, Debug)]
struct Push {
    thread_id: usize,
    first_key: i64,
    rows: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    None,
    FailSecondPush,
    PanicSecondPush,
}

/// Wraps the default builders, records pushes and optionally injects a fault.
struct RecordingFactory {
    fault: Fault,
    pushes: Arc<Mutex<Vec<Push>>>,
    thread_counts: Arc<Mutex<Vec<usize>>>,
}

impl RecordingFactory {
    fn new(fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            fault,
            pushes: Arc::new(Mutex::new(Vec::new())),
            thread_counts: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn pushes(&self) -> Vec<Push> {
        self.pushes.lock().unwrap().clone()
    }
}

impl FilterBuilderFactory for RecordingFactory {
    fn create(
        &self,
        spec: &FilterSpec,
        params: &BuilderParams,
    ) -> ExecResult<Box<dyn FilterBuilder>> {
        let inner = DefaultFilterBuilderFactory.create(spec, params)?;
        self.thread_counts
            .lock()
            .unwrap()
            .push(inner.thread_count());
        Ok(Box::new(RecordingBuilder {
            inner,
            fault: self.fault,
            calls: AtomicUsize::new(0),
            pushes: Arc::clone(&self.pushes),
        }))
    }
}

struct RecordingBuilder {
    inner: Box<dyn FilterBuilder>,
    fault: Fault,
    calls: AtomicUsize,
    pushes: Arc<Mutex<Vec<Push>>>,
}

impl FilterBuilder for RecordingBuilder {
    fn filter(&self) -> &Arc<RuntimeFilter> {
        self.inner.filter()
    }

    fn built_cols(&self) -> &[usize] {
        self.inner.built_cols()
    }

    fn thread_count(&self) -> usize {
        self.inner.thread_count()
    }

    fn push_next_batch(
        &self,
        thread_id: usize,
        keys: &[ArrayRef],
        num_rows: usize,
    ) -> ExecResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 1 {
            match self.fault {
                Fault::FailSecondPush => {
                    return Err(ExecError::internal("injected builder failure"));
                }
                Fault::PanicSecondPush => panic!("injected builder panic"),
                Fault::None => {}
            }
        }
        let first_key = keys[0]
            .as_any()
            .downcast_ref::<Int64Array>()
            .map(|a| a.value(0))
            .unwrap_or(-1);
        self.pushes.lock().unwrap().push(Push {
            thread_id,
            first_key,
            rows: num_rows,
        });
        self.inner.push_next_batch(thread_id, keys, num_rows)
    }

    fn requires_merge(&self) -> bool {
        self.inner.requires_merge()
    }

    fn merge(&self) -> ExecResult<()> {
        self.inner.merge()
    }

    fn stage(&self) -> ExecResult<()> {
        self.inner.stage()
    }
}

fn values_op(batches: Vec<arrow::record_batch::RecordBatch>) -> Arc<dyn PhysicalOperator> {
    let chunks = batches.into_iter().map(Chunk::new).collect();
    Arc::new(ValuesSourceOperator::new(key_schema(), chunks).unwrap())
}

fn int64_filter(id: u32) -> Arc<RuntimeFilter> {
    RuntimeFilter::new(FilterId::new(id), &[DataType::Int64]).unwrap()
}

fn result_sink() -> (Arc<dyn PhysicalOperator>, ResultSinkHandle) {
    let handle = ResultSinkHandle::new();
    (
        Arc::new(ResultSinkOperator::new(key_schema(), handle.clone())),
        handle,
    )
}

fn filter_build(id: u32, build_columns: Vec<usize>) -> LogicalFilterBuild {
    LogicalFilterBuild {
        id: FilterId::new(id),
        build_columns,
    }
}

fn filter_probe(id: u32, probe_columns: Vec<usize>) -> LogicalFilterProbe {
    LogicalFilterProbe {
        id: FilterId::new(id),
        probe_columns,
    }
}

#[test]
fn small_build_side_uses_one_finalize_task_and_replays_every_row() {
    run_with_timeout(TIMEOUT, || {
        let state = test_state(3, test_options(100));
        let factory = RecordingFactory::new(Fault::None);
        let plan = LogicalPlan::create_filter(
            LogicalPlan::values(key_schema(), key_batches(0, 10, 100)),
            vec![filter_build(1, vec![0])],
        );
        let lowered = PlanLowering::new(factory.clone()).lower(&plan).unwrap();
        let (sink, handle) = result_sink();

        execute_plan_with_pipeline(lowered.root.clone(), sink, &state).unwrap();

        let pushes = factory.pushes();
        assert_eq!(pushes.len(), 10);
        assert_eq!(pushes.iter().map(|p| p.rows).sum::<usize>(), 1000);
        let threads: HashSet<usize> = pushes.iter().map(|p| p.thread_id).collect();
        assert_eq!(threads.len(), 1, "one finalize task runs on one thread");
        assert_eq!(*factory.thread_counts.lock().unwrap(), vec![3]);

        let chunks = handle.take_chunks();
        assert_eq!(total_rows(&chunks), 1000);
        assert_eq!(sorted_keys(&chunks), (0..1000).collect::<Vec<i64>>());
        assert!(lowered.filter(FilterId::new(1)).unwrap().is_ready());
    });
}

/// Replay partitions of a 10-chunk build side on 3 workers.
fn replay_ranges(verify_parallelism: bool) -> Vec<ChunkRange> {
    run_with_timeout(TIMEOUT, move || {
        let mut options = test_options(100);
        options.verify_parallelism = verify_parallelism;
        let state = test_state(3, options);
        let plan = LogicalPlan::create_filter(
            LogicalPlan::values(key_schema(), key_batches(0, 10, 100)),
            vec![filter_build(31, vec![0])],
        );
        let lowered = predtrans::lower_plan(&plan).unwrap();
        let (sink, handle) = result_sink();

        execute_plan_with_pipeline(lowered.root.clone(), sink, &state).unwrap();
        assert_eq!(total_rows(&handle.take_chunks()), 1000);

        let gstate = lowered.root.global_source_state(&state).unwrap();
        gstate
            .as_any()
            .downcast_ref::<ReplayGlobalSourceState>()
            .expect("replay source state")
            .ranges()
            .to_vec()
    })
}

#[test]
fn small_build_side_replays_as_one_partition() {
    assert_eq!(replay_ranges(false), vec![ChunkRange::new(0, 10)]);
}

#[test]
fn forced_parallel_replay_partitions_cover_all_chunks() {
    let ranges = replay_ranges(true);
    assert!(!ranges.is_empty() && ranges.len() <= 3, "{:?}", ranges);
    let mut expected_from = 0;
    for range in &ranges {
        assert_eq!(range.from, expected_from, "{:?}", ranges);
        assert!(!range.is_empty());
        expected_from = range.to;
    }
    assert_eq!(expected_from, 10);
}

#[test]
fn forced_parallelism_covers_every_chunk_exactly_once() {
    run_with_timeout(TIMEOUT, || {
        let mut options = test_options(100);
        options.verify_parallelism = true;
        options.filter_flavor = FilterFlavor::Hash;
        let state = test_state(3, options);
        let factory = RecordingFactory::new(Fault::None);
        let plan = LogicalPlan::create_filter(
            LogicalPlan::values(key_schema(), key_batches(0, 10, 100)),
            vec![filter_build(2, vec![0])],
        );
        let lowered = PlanLowering::new(factory.clone()).lower(&plan).unwrap();
        let (sink, handle) = result_sink();

        execute_plan_with_pipeline(lowered.root.clone(), sink, &state).unwrap();

        let pushes = factory.pushes();
        let mut firsts: Vec<i64> = pushes.iter().map(|p| p.first_key).collect();
        firsts.sort_unstable();
        assert_eq!(firsts, (0..10).map(|c| c * 100).collect::<Vec<i64>>());
        assert!(pushes.iter().all(|p| (1..=3).contains(&p.thread_id)));

        let chunks = handle.take_chunks();
        assert_eq!(sorted_keys(&chunks), (0..1000).collect::<Vec<i64>>());
        let filter = lowered.filter(FilterId::new(2)).unwrap();
        assert_eq!(filter.flavor(), Some(FilterFlavor::Hash));
    });
}

#[test]
fn shared_build_root_gets_one_pipeline_and_a_dependency_edge() {
    run_with_timeout(TIMEOUT, || {
        let mut options = test_options(100);
        options.filter_flavor = FilterFlavor::Hash;
        let state = test_state(3, options);
        let factory: Arc<dyn FilterBuilderFactory> = Arc::new(DefaultFilterBuilderFactory);

        let rf1 = int64_filter(11);
        let rf2 = int64_filter(12);
        let build_a = Arc::new(
            CreateFilterOperator::new(
                values_op(key_batches(0, 5, 100)),
                vec![FilterSpec::new(Arc::clone(&rf1), vec![0])],
                Arc::clone(&factory),
            )
            .unwrap(),
        );
        let inner_probe = Arc::new(
            UseFilterOperator::new(
                values_op(key_batches(250, 10, 100)),
                vec![FilterProbe {
                    filter: Arc::clone(&rf1),
                    probe_columns: vec![0],
                }],
            )
            .unwrap(),
        );
        let inner_gate = Arc::new(FilterGateOperator::new(
            inner_probe,
            FilterBuildInput::Shared(Arc::downgrade(&build_a)),
        ));
        let build_b = Arc::new(
            CreateFilterOperator::new(
                inner_gate,
                vec![FilterSpec::new(Arc::clone(&rf2), vec![0])],
                Arc::clone(&factory),
            )
            .unwrap(),
        );
        let outer_probe = Arc::new(
            UseFilterOperator::new(
                build_b.clone(),
                vec![FilterProbe {
                    filter: Arc::clone(&rf1),
                    probe_columns: vec![0],
                }],
            )
            .unwrap(),
        );
        let outer_gate: Arc<dyn PhysicalOperator> = Arc::new(FilterGateOperator::new(
            outer_probe,
            FilterBuildInput::Owned(Arc::clone(&build_a)),
        ));
        let (sink, handle) = result_sink();

        let graph = PipelineBuilder::build_graph(outer_gate, sink).unwrap();
        assert_eq!(graph.len(), 3, "{}", graph.describe());
        assert_eq!(graph.pipelines_sinking_into(build_a.id()), 1);
        assert_eq!(graph.pipelines_sinking_into(build_b.id()), 1);
        let sinking_into = |id| {
            graph
                .pipelines()
                .iter()
                .find(|p| p.sink().map(|s| s.id() == id).unwrap_or(false))
                .map(|p| p.id())
                .unwrap()
        };
        let pipeline_a = sinking_into(build_a.id());
        let pipeline_b = sinking_into(build_b.id());
        let root = graph.pipeline(graph.root_id()).unwrap();
        assert!(root.dependencies().contains(&pipeline_a));
        assert!(root.dependencies().contains(&pipeline_b));
        assert_eq!(
            graph.pipeline(pipeline_b).unwrap().dependencies(),
            &[pipeline_a]
        );

        execute_pipeline_graph(graph, &state).unwrap();

        assert!(rf1.is_ready());
        assert!(rf2.is_ready());
        let chunks = handle.take_chunks();
        assert_eq!(sorted_keys(&chunks), (250..500).collect::<Vec<i64>>());
    });
}

fn gated_plan(build_start: i64, build_batches: usize, probe_batches: usize) -> LogicalPlan {
    let build = LogicalPlan::create_filter(
        LogicalPlan::values(key_schema(), key_batches(build_start, build_batches, 100)),
        vec![filter_build(21, vec![0])],
    );
    let probe = LogicalPlan::use_filter(
        LogicalPlan::values(key_schema(), key_batches(0, probe_batches, 100)),
        vec![filter_probe(21, vec![0])],
    );
    LogicalPlan::apply_filters(probe, build)
}

#[test]
fn failing_finalize_task_fails_query_and_never_publishes() {
    for fault in [Fault::FailSecondPush, Fault::PanicSecondPush] {
        run_with_timeout(TIMEOUT, move || {
            let mut options = test_options(100);
            options.verify_parallelism = true;
            let state = test_state(3, options);
            let factory = RecordingFactory::new(fault);
            let lowered = PlanLowering::new(factory)
                .lower(&gated_plan(500, 5, 20))
                .unwrap();
            let (sink, handle) = result_sink();

            let err = execute_plan_with_pipeline(lowered.root.clone(), sink, &state).unwrap_err();

            match (&err, fault) {
                (ExecError::TaskFailed(msg), Fault::PanicSecondPush) => {
                    assert!(msg.contains("injected builder panic"), "{}", msg)
                }
                (ExecError::TaskFailed(msg), Fault::FailSecondPush) => {
                    assert!(msg.contains("injected builder failure"), "{}", msg)
                }
                other => panic!("unexpected error {:?}", other),
            }
            let filter = lowered.filter(FilterId::new(21)).unwrap();
            assert!(!filter.is_ready());
            assert!(filter.flavor().is_none());
            assert_eq!(total_rows(&handle.take_chunks()), 0);
        });
    }
}

#[test]
fn memory_limit_aborts_query_with_resource_exhausted() {
    run_with_timeout(TIMEOUT, || {
        let mut options = test_options(100);
        options.query_mem_limit_bytes = 4096;
        let state = test_state(2, options);
        let lowered = predtrans::lower_plan(&gated_plan(0, 10, 10)).unwrap();
        let (sink, _handle) = result_sink();

        let err = top_level_execute(lowered.root.clone(), sink, &state).unwrap_err();

        assert!(matches!(err, ExecError::ResourceExhausted(_)), "{:?}", err);
        assert!(!lowered.filter(FilterId::new(21)).unwrap().is_ready());
        assert!(state.mem_tracker().peak() <= 4096);
    });
}

#[test]
fn stacked_filter_builds_fit_a_few_copies_of_the_input() {
    run_with_timeout(TIMEOUT, || {
        let batches = key_batches(0, 1, 10_000);
        let one_copy = record_batch_bytes(&batches[0]).unwrap();
        let limit = 4 * one_copy as i64;
        let mut options = test_options(100);
        options.query_mem_limit_bytes = limit;
        let state = test_state(2, options);
        let plan = LogicalPlan::create_filter(
            LogicalPlan::create_filter(
                LogicalPlan::values(key_schema(), batches),
                vec![filter_build(41, vec![0])],
            ),
            vec![filter_build(42, vec![0])],
        );
        let lowered = predtrans::lower_plan(&plan).unwrap();
        let (sink, handle) = result_sink();

        execute_plan_with_pipeline(lowered.root.clone(), sink, &state).unwrap();

        assert_eq!(
            sorted_keys(&handle.take_chunks()),
            (0..10_000).collect::<Vec<i64>>()
        );
        assert!(lowered.filter(FilterId::new(41)).unwrap().is_ready());
        assert!(lowered.filter(FilterId::new(42)).unwrap().is_ready());
        assert!(state.mem_tracker().peak() <= limit);
    });
}

#[test]
fn gated_probe_keeps_matching_rows_for_both_flavors() {
    for flavor in [FilterFlavor::Hash, FilterFlavor::Bloom] {
        run_with_timeout(TIMEOUT, move || {
            let mut options = test_options(100);
            options.filter_flavor = flavor;
            options.filter_seed = 99;
            let state = test_state(4, options);
            let lowered = predtrans::lower_plan(&gated_plan(500, 5, 20)).unwrap();
            let (sink, handle) = result_sink();

            execute_plan_with_pipeline(lowered.root.clone(), sink, &state).unwrap();

            let keys = sorted_keys(&handle.take_chunks());
            let expected: Vec<i64> = (500..1000).collect();
            match flavor {
                FilterFlavor::Hash => assert_eq!(keys, expected),
                FilterFlavor::Bloom => {
                    let kept: HashSet<i64> = keys.iter().copied().collect();
                    assert!(expected.iter().all(|k| kept.contains(k)));
                    assert!(keys.len() < 2000, "bloom kept {} rows", keys.len());
                }
            }
            let filter = lowered.filter(FilterId::new(21)).unwrap();
            assert_eq!(filter.flavor(), Some(flavor));
        });
    }
}

#[test]
fn empty_build_side_publishes_a_filter_that_rejects_everything() {
    run_with_timeout(TIMEOUT, || {
        let state = test_state(3, test_options(100));
        let lowered = predtrans::lower_plan(&gated_plan(0, 0, 5)).unwrap();
        let (sink, handle) = result_sink();

        execute_plan_with_pipeline(lowered.root.clone(), sink, &state).unwrap();

        assert!(lowered.filter(FilterId::new(21)).unwrap().is_ready());
        assert_eq!(total_rows(&handle.take_chunks()), 0);
    });
}

#[test]
fn pipeline_description_names_the_gate_and_build_sink() {
    let lowered = predtrans::lower_plan(&gated_plan(0, 1, 1)).unwrap();
    let (sink, _handle) = result_sink();
    let graph = PipelineBuilder::build_graph(lowered.root.clone(), sink).unwrap();
    let text = graph.describe();
    assert_eq!(graph.len(), 2);
    assert!(text.contains("FilterGate#"), "{}", text);
    assert!(text.contains("CreateFilter#"), "{}", text);
    assert!(text.contains("rf21"), "{}", text);
}
