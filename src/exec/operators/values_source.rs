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
//! VALUES source operator.
//!
//! Responsibilities:
//! - Produces in-memory chunks as a finite pipeline source.
//! - Hands chunks to drivers through an atomic claim cursor; each chunk is emitted once.
//!
//! Key exported interfaces:
//! - Types: `ValuesSourceOperator`.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow::datatypes::SchemaRef;

use crate::common::ids::OperatorId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{
    GlobalSourceState, LocalSourceState, PhysicalOperator, SourceResult, downcast_ref,
};
use crate::runtime::runtime_state::RuntimeState;

pub struct ValuesSourceOperator {
    id: OperatorId,
    schema: SchemaRef,
    chunks: Arc<Vec<Chunk>>,
}

impl ValuesSourceOperator {
    pub fn new(schema: SchemaRef, chunks: Vec<Chunk>) -> ExecResult<Self> {
        for (idx, chunk) in chunks.iter().enumerate() {
            let chunk_schema = chunk.schema();
            let same_types = chunk_schema.fields().len() == schema.fields().len()
                && chunk_schema
                    .fields()
                    .iter()
                    .zip(schema.fields().iter())
                    .all(|(a, b)| a.data_type() == b.data_type());
            if !same_types {
                return Err(ExecError::internal(format!(
                    "values chunk {} does not match the declared schema",
                    idx
                )));
            }
        }
        Ok(Self {
            id: OperatorId::next(),
            schema,
            chunks: Arc::new(chunks.into_iter().filter(|c| !c.is_empty()).collect()),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }
}

struct ValuesGlobalSourceState {
    chunks: Arc<Vec<Chunk>>,
    cursor: AtomicUsize,
}

impl GlobalSourceState for ValuesGlobalSourceState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn max_threads(&self) -> usize {
        self.chunks.len().max(1)
    }
}

struct ValuesLocalSourceState;

impl LocalSourceState for ValuesLocalSourceState {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl PhysicalOperator for ValuesSourceOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &str {
        "ValuesSource"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn params_to_string(&self) -> String {
        format!("chunks={} rows={}", self.chunks.len(), self.num_rows())
    }

    fn is_source(&self) -> bool {
        true
    }

    fn global_source_state(&self, _state: &RuntimeState) -> ExecResult<Arc<dyn GlobalSourceState>> {
        Ok(Arc::new(ValuesGlobalSourceState {
            chunks: Arc::clone(&self.chunks),
            cursor: AtomicUsize::new(0),
        }))
    }

    fn local_source_state(
        &self,
        _state: &RuntimeState,
        _gstate: &dyn GlobalSourceState,
    ) -> ExecResult<Box<dyn LocalSourceState>> {
        Ok(Box::new(ValuesLocalSourceState))
    }

    fn get_data(
        &self,
        _state: &RuntimeState,
        gstate: &dyn GlobalSourceState,
        _lstate: &mut dyn LocalSourceState,
    ) -> ExecResult<SourceResult> {
        let gstate =
            downcast_ref::<ValuesGlobalSourceState>(gstate.as_any(), self.name(), "source state")?;
        let idx = gstate.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(match gstate.chunks.get(idx) {
            Some(chunk) => SourceResult::HaveMoreOutput(chunk.clone()),
            None => SourceResult::Finished,
        })
    }
}
