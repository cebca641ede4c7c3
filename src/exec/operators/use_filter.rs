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
//! Probe-side runtime filter application.
//!
//! Evaluates every attached filter on its probe key columns and keeps the rows all of
//! them accept. Rows with a null key are dropped. The filters must already be ready:
//! the pipeline carrying this operator depends on the pipeline that builds them.

use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::compute::{and, filter_record_batch};
use arrow::datatypes::SchemaRef;

use crate::common::ids::{OperatorId, PipelineId};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::builder::{MetaPipelineId, PipelineBuilder};
use crate::exec::pipeline::operator::PhysicalOperator;
use crate::exec::runtime_filter::FilterProbe;
use crate::runtime::runtime_state::RuntimeState;

pub struct UseFilterOperator {
    id: OperatorId,
    child: Arc<dyn PhysicalOperator>,
    probes: Vec<FilterProbe>,
}

impl UseFilterOperator {
    pub fn new(child: Arc<dyn PhysicalOperator>, probes: Vec<FilterProbe>) -> ExecResult<Self> {
        let schema = child.schema();
        for probe in &probes {
            let types: Vec<_> = probe
                .probe_columns
                .iter()
                .map(|col| {
                    schema
                        .fields()
                        .get(*col)
                        .map(|f| f.data_type().clone())
                        .ok_or_else(|| {
                            ExecError::internal(format!(
                                "runtime filter {} probe column {} out of range",
                                probe.filter.id(),
                                col
                            ))
                        })
                })
                .collect::<ExecResult<_>>()?;
            if types.as_slice() != probe.filter.key_types() {
                return Err(ExecError::internal(format!(
                    "runtime filter {} probe key types {:?} do not match build key types {:?}",
                    probe.filter.id(),
                    types,
                    probe.filter.key_types()
                )));
            }
        }
        Ok(Self {
            id: OperatorId::next(),
            child,
            probes,
        })
    }

    fn selection(&self, chunk: &Chunk) -> ExecResult<Option<BooleanArray>> {
        let mut selection: Option<BooleanArray> = None;
        for probe in &self.probes {
            let keys = chunk.key_columns(&probe.probe_columns)?;
            let mask = probe.filter.probe(&keys, chunk.len())?;
            selection = Some(match selection {
                Some(prev) => and(&prev, &mask)?,
                None => mask,
            });
        }
        Ok(selection)
    }
}

impl PhysicalOperator for UseFilterOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &str {
        "UseFilter"
    }

    fn schema(&self) -> SchemaRef {
        self.child.schema()
    }

    fn params_to_string(&self) -> String {
        self.probes
            .iter()
            .map(|p| format!("rf{}:{:?}", p.filter.id(), p.probe_columns))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn execute(&self, _state: &RuntimeState, chunk: Chunk) -> ExecResult<Option<Chunk>> {
        let Some(selection) = self.selection(&chunk)? else {
            return Ok(Some(chunk));
        };
        if selection.true_count() == chunk.len() {
            return Ok(Some(chunk));
        }
        let batch = filter_record_batch(&chunk.batch, &selection)?;
        if batch.num_rows() == 0 {
            return Ok(None);
        }
        Ok(Some(Chunk::new(batch)))
    }

    fn build_pipelines(
        &self,
        this: &Arc<dyn PhysicalOperator>,
        current: PipelineId,
        meta: MetaPipelineId,
        builder: &mut PipelineBuilder,
    ) -> ExecResult<()> {
        builder.add_pipeline_operator(current, Arc::clone(this))?;
        self.child.build_pipelines(&self.child, current, meta, builder)
    }
}
