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
//! Dual-input pipeline gate.
//!
//! Responsibilities:
//! - Sits in-line on the probe pipeline and passes chunks through unchanged.
//! - Spawns the build side as a child pipeline the probe pipeline depends on, so every
//!   operator after the gate runs only once the build side finalized its filters.
//! - Reuses the build pipeline when several gates share one filter build root.
//!
//! Key exported interfaces:
//! - Types: `FilterGateOperator`, `FilterBuildInput`.

use std::sync::{Arc, Weak};

use arrow::datatypes::SchemaRef;

use crate::common::ids::{OperatorId, PipelineId};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::operators::create_filter::CreateFilterOperator;
use crate::exec::pipeline::builder::{MetaPipelineId, PipelineBuilder};
use crate::exec::pipeline::operator::PhysicalOperator;
use crate::runtime::runtime_state::RuntimeState;

/// Build side of a gate.
///
/// The first gate over a build root owns it; further gates over the same root keep a
/// weak back-reference and resolve the build pipeline through the builder's memo.
pub enum FilterBuildInput {
    Owned(Arc<CreateFilterOperator>),
    Shared(Weak<CreateFilterOperator>),
}

impl FilterBuildInput {
    fn resolve(&self) -> ExecResult<Arc<CreateFilterOperator>> {
        match self {
            FilterBuildInput::Owned(op) => Ok(Arc::clone(op)),
            FilterBuildInput::Shared(weak) => weak.upgrade().ok_or_else(|| {
                ExecError::internal("shared filter build root dropped before pipeline construction")
            }),
        }
    }

    fn is_shared(&self) -> bool {
        matches!(self, FilterBuildInput::Shared(_))
    }
}

pub struct FilterGateOperator {
    id: OperatorId,
    probe: Arc<dyn PhysicalOperator>,
    build: FilterBuildInput,
}

impl FilterGateOperator {
    pub fn new(probe: Arc<dyn PhysicalOperator>, build: FilterBuildInput) -> Self {
        Self {
            id: OperatorId::next(),
            probe,
            build,
        }
    }

    pub fn probe(&self) -> &Arc<dyn PhysicalOperator> {
        &self.probe
    }
}

impl PhysicalOperator for FilterGateOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &str {
        "FilterGate"
    }

    fn schema(&self) -> SchemaRef {
        self.probe.schema()
    }

    fn params_to_string(&self) -> String {
        match self.build.resolve() {
            Ok(build) => format!(
                "build={}#{}{}",
                build.name(),
                build.id(),
                if self.build.is_shared() { " shared" } else { "" }
            ),
            Err(_) => "build=<dropped>".to_string(),
        }
    }

    fn execute(&self, _state: &RuntimeState, chunk: Chunk) -> ExecResult<Option<Chunk>> {
        Ok(Some(chunk))
    }

    fn build_pipelines(
        &self,
        this: &Arc<dyn PhysicalOperator>,
        current: PipelineId,
        meta: MetaPipelineId,
        builder: &mut PipelineBuilder,
    ) -> ExecResult<()> {
        builder.add_pipeline_operator(current, Arc::clone(this))?;
        let build = self.build.resolve()?;
        let build_op: Arc<dyn PhysicalOperator> = build.clone();
        build.ensure_build_pipeline(&build_op, current, meta, builder)?;
        self.probe.build_pipelines(&self.probe, current, meta, builder)
    }
}
