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
//! Pipeline graph builder for physical operator trees.
//!
//! Responsibilities:
//! - Splits an operator tree into source/operators/sink pipelines grouped in meta pipelines.
//! - Records dependency edges between pipelines (a consumer waits for its producers).
//! - Memoizes filter build pipelines by build-root operator id so a shared build side
//!   is constructed exactly once.
//!
//! Key exported interfaces:
//! - Types: `PipelineBuilder`, `MetaPipelineId`, `PipelineGraph`.
//!
//! Current limitations:
//! - Each meta pipeline holds exactly one pipeline; there is no intra-meta union or
//!   pipeline splitting.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::common::ids::{OperatorId, PipelineId};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::operator::PhysicalOperator;
use crate::exec::pipeline::pipeline::Pipeline;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MetaPipelineId(pub usize);

impl fmt::Display for MetaPipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group of pipelines sharing one sink.
struct MetaPipeline {
    sink: Arc<dyn PhysicalOperator>,
    base: PipelineId,
    children: Vec<MetaPipelineId>,
}

/// Mutable construction context passed through `PhysicalOperator::build_pipelines`.
pub struct PipelineBuilder {
    pipelines: Vec<Pipeline>,
    metas: Vec<MetaPipeline>,
    filter_build_pipelines: HashMap<OperatorId, PipelineId>,
}

impl PipelineBuilder {
    fn new() -> Self {
        Self {
            pipelines: Vec::new(),
            metas: Vec::new(),
            filter_build_pipelines: HashMap::new(),
        }
    }

    /// Build the whole graph for `root`, whose output flows into `sink`.
    pub fn build_graph(
        root: Arc<dyn PhysicalOperator>,
        sink: Arc<dyn PhysicalOperator>,
    ) -> ExecResult<PipelineGraph> {
        let mut builder = Self::new();
        let root_meta = builder.new_meta(sink);
        builder.build(root_meta, root)?;
        builder.finish(root_meta)
    }

    fn new_meta(&mut self, sink: Arc<dyn PhysicalOperator>) -> MetaPipelineId {
        let pipeline_id = PipelineId(self.pipelines.len());
        self.pipelines
            .push(Pipeline::new(pipeline_id, Some(Arc::clone(&sink))));
        let meta_id = MetaPipelineId(self.metas.len());
        self.metas.push(MetaPipeline {
            sink,
            base: pipeline_id,
            children: Vec::new(),
        });
        meta_id
    }

    fn meta(&self, meta: MetaPipelineId) -> ExecResult<&MetaPipeline> {
        self.metas
            .get(meta.0)
            .ok_or_else(|| ExecError::internal(format!("unknown meta pipeline {}", meta)))
    }

    fn pipeline_mut(&mut self, id: PipelineId) -> ExecResult<&mut Pipeline> {
        self.pipelines
            .get_mut(id.0)
            .ok_or_else(|| ExecError::internal(format!("unknown pipeline {}", id)))
    }

    pub fn base_pipeline(&self, meta: MetaPipelineId) -> ExecResult<PipelineId> {
        Ok(self.meta(meta)?.base)
    }

    /// Recurse construction of `op` into the base pipeline of `meta`.
    pub fn build(&mut self, meta: MetaPipelineId, op: Arc<dyn PhysicalOperator>) -> ExecResult<()> {
        let current = self.base_pipeline(meta)?;
        op.build_pipelines(&op, current, meta, self)
    }

    /// Create a child meta pipeline sunk into `sink`; `current` waits for it to finish.
    pub fn create_child_meta_pipeline(
        &mut self,
        current: PipelineId,
        parent: MetaPipelineId,
        sink: Arc<dyn PhysicalOperator>,
    ) -> ExecResult<MetaPipelineId> {
        if !sink.is_sink() {
            return Err(ExecError::internal(format!(
                "operator {} cannot sink a child meta pipeline",
                sink.name()
            )));
        }
        self.meta(parent)?;
        let child = self.new_meta(sink);
        let child_base = self.base_pipeline(child)?;
        self.metas[parent.0].children.push(child);
        self.add_dependency(current, child_base)?;
        Ok(child)
    }

    pub fn set_pipeline_source(
        &mut self,
        current: PipelineId,
        source: Arc<dyn PhysicalOperator>,
    ) -> ExecResult<()> {
        self.pipeline_mut(current)?.set_source(source)
    }

    pub fn add_pipeline_operator(
        &mut self,
        current: PipelineId,
        op: Arc<dyn PhysicalOperator>,
    ) -> ExecResult<()> {
        self.pipeline_mut(current)?.push_operator(op);
        Ok(())
    }

    /// `current` may only start after `dependency` completed.
    pub fn add_dependency(&mut self, current: PipelineId, dependency: PipelineId) -> ExecResult<()> {
        if dependency.0 >= self.pipelines.len() {
            return Err(ExecError::internal(format!(
                "unknown dependency pipeline {}",
                dependency
            )));
        }
        self.pipeline_mut(current)?.add_dependency(dependency);
        Ok(())
    }

    /// Build pipeline previously created for the filter build rooted at `build_root`.
    pub fn filter_build_pipeline(&self, build_root: OperatorId) -> Option<PipelineId> {
        self.filter_build_pipelines.get(&build_root).copied()
    }

    pub fn record_filter_build_pipeline(
        &mut self,
        build_root: OperatorId,
        pipeline: PipelineId,
    ) -> ExecResult<()> {
        if let Some(existing) = self.filter_build_pipelines.insert(build_root, pipeline) {
            return Err(ExecError::internal(format!(
                "filter build root {} already owns pipeline {}",
                build_root, existing
            )));
        }
        Ok(())
    }

    fn finish(mut self, root_meta: MetaPipelineId) -> ExecResult<PipelineGraph> {
        for pipeline in self.pipelines.iter_mut() {
            pipeline.finish()?;
        }
        let root_id = self.base_pipeline(root_meta)?;
        let meta_sinks = self
            .metas
            .iter()
            .map(|m| (m.base, m.sink.name().to_string(), m.children.len()))
            .collect();
        Ok(PipelineGraph {
            pipelines: self.pipelines,
            root_id,
            meta_sinks,
        })
    }
}

/// Finished pipeline graph for one query.
pub struct PipelineGraph {
    pipelines: Vec<Pipeline>,
    root_id: PipelineId,
    meta_sinks: Vec<(PipelineId, String, usize)>,
}

impl PipelineGraph {
    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn into_pipelines(self) -> Vec<Pipeline> {
        self.pipelines
    }

    pub fn root_id(&self) -> PipelineId {
        self.root_id
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn pipeline(&self, id: PipelineId) -> Option<&Pipeline> {
        self.pipelines.get(id.0)
    }

    /// Number of pipelines whose sink is the operator `id`.
    pub fn pipelines_sinking_into(&self, id: OperatorId) -> usize {
        self.pipelines
            .iter()
            .filter(|p| p.sink().map(|s| s.id() == id).unwrap_or(false))
            .count()
    }

    /// Multi-line description: one line per pipeline with its chain and dependencies.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for pipeline in &self.pipelines {
            let deps = pipeline
                .dependencies()
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let meta_children = self
                .meta_sinks
                .iter()
                .find(|(base, _, _)| *base == pipeline.id())
                .map(|(_, _, children)| *children)
                .unwrap_or(0);
            let root_marker = if pipeline.id() == self.root_id {
                " root"
            } else {
                ""
            };
            out.push_str(&format!(
                "Pipeline#{}{} [deps: {}] [child metas: {}] {}\n",
                pipeline.id(),
                root_marker,
                deps,
                meta_children,
                pipeline.operator_chain()
            ));
        }
        out
    }
}
