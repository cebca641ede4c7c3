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
//! Pipeline structure metadata.
//!
//! Responsibilities:
//! - Represents one pipeline: a source, ordered in-line operators and a sink.
//! - Records the pipelines that must complete before this one may start.
//!
//! Key exported interfaces:
//! - Types: `Pipeline`.

use std::sync::Arc;

use crate::common::ids::PipelineId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::operator::PhysicalOperator;

/// One pipeline definition with its operator chain and dependency links.
pub struct Pipeline {
    id: PipelineId,
    source: Option<Arc<dyn PhysicalOperator>>,
    /// In-line operators. Collected top-down during construction, stored source-to-sink
    /// once the builder finishes.
    operators: Vec<Arc<dyn PhysicalOperator>>,
    sink: Option<Arc<dyn PhysicalOperator>>,
    dependencies: Vec<PipelineId>,
}

impl Pipeline {
    pub(crate) fn new(id: PipelineId, sink: Option<Arc<dyn PhysicalOperator>>) -> Self {
        Self {
            id,
            source: None,
            operators: Vec::new(),
            sink,
            dependencies: Vec::new(),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn source(&self) -> ExecResult<&Arc<dyn PhysicalOperator>> {
        self.source
            .as_ref()
            .ok_or_else(|| ExecError::internal(format!("pipeline {} has no source", self.id)))
    }

    pub fn operators(&self) -> &[Arc<dyn PhysicalOperator>] {
        &self.operators
    }

    pub fn sink(&self) -> ExecResult<&Arc<dyn PhysicalOperator>> {
        self.sink
            .as_ref()
            .ok_or_else(|| ExecError::internal(format!("pipeline {} has no sink", self.id)))
    }

    pub fn dependencies(&self) -> &[PipelineId] {
        &self.dependencies
    }

    pub(crate) fn set_source(&mut self, source: Arc<dyn PhysicalOperator>) -> ExecResult<()> {
        if let Some(existing) = self.source.as_ref() {
            return Err(ExecError::internal(format!(
                "pipeline {} already has source {} (new source {})",
                self.id,
                existing.name(),
                source.name()
            )));
        }
        if !source.is_source() {
            return Err(ExecError::internal(format!(
                "operator {} cannot be a pipeline source",
                source.name()
            )));
        }
        self.source = Some(source);
        Ok(())
    }

    pub(crate) fn push_operator(&mut self, op: Arc<dyn PhysicalOperator>) {
        self.operators.push(op);
    }

    pub(crate) fn add_dependency(&mut self, dep: PipelineId) {
        if dep != self.id && !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
    }

    pub(crate) fn finish(&mut self) -> ExecResult<()> {
        self.operators.reverse();
        let source = self.source()?;
        let sink = self.sink()?;
        if !sink.is_sink() {
            return Err(ExecError::internal(format!(
                "operator {} cannot be a pipeline sink",
                sink.name()
            )));
        }
        if Arc::ptr_eq(source, sink) {
            return Err(ExecError::internal(format!(
                "pipeline {} uses {} as both source and sink",
                self.id,
                source.name()
            )));
        }
        Ok(())
    }

    /// `source -> op -> ... -> sink`, using operator names.
    pub fn operator_chain(&self) -> String {
        let mut parts = Vec::with_capacity(self.operators.len() + 2);
        parts.push(describe_op(self.source.as_ref()));
        for op in &self.operators {
            parts.push(describe_op(Some(op)));
        }
        parts.push(describe_op(self.sink.as_ref()));
        parts.join(" -> ")
    }
}

fn describe_op(op: Option<&Arc<dyn PhysicalOperator>>) -> String {
    match op {
        None => "<none>".to_string(),
        Some(op) => {
            let params = op.params_to_string();
            if params.is_empty() {
                format!("{}#{}", op.name(), op.id())
            } else {
                format!("{}#{}({})", op.name(), op.id(), params)
            }
        }
    }
}
