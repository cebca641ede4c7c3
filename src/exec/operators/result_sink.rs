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
//! Result sink for buffering query output rows.
//!
//! Responsibilities:
//! - Collects output chunks into a shared result handle read after the query finished.
//!
//! Key exported interfaces:
//! - Types: `ResultSinkHandle`, `ResultSinkOperator`.

use std::any::Any;
use std::sync::{Arc, Mutex};

use arrow::datatypes::SchemaRef;

use crate::common::ids::OperatorId;
use crate::common::status::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{
    GlobalSinkState, LocalSinkState, PhysicalOperator, SinkResult,
};
use crate::runtime::runtime_state::RuntimeState;

#[derive(Clone, Default)]
/// Shared handle that stores buffered result chunks.
pub struct ResultSinkHandle {
    inner: Arc<Mutex<Vec<Chunk>>>,
}

impl ResultSinkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_chunks(&self) -> Vec<Chunk> {
        let mut guard = self.inner.lock().expect("result_sink lock");
        guard.drain(..).collect()
    }

    pub fn num_rows(&self) -> usize {
        let guard = self.inner.lock().expect("result_sink lock");
        guard.iter().map(Chunk::len).sum()
    }
}

pub struct ResultSinkOperator {
    id: OperatorId,
    schema: SchemaRef,
    handle: ResultSinkHandle,
}

impl ResultSinkOperator {
    pub fn new(schema: SchemaRef, handle: ResultSinkHandle) -> Self {
        Self {
            id: OperatorId::next(),
            schema,
            handle,
        }
    }
}

struct ResultGlobalSinkState;

impl GlobalSinkState for ResultGlobalSinkState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct ResultLocalSinkState;

impl LocalSinkState for ResultLocalSinkState {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl PhysicalOperator for ResultSinkOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &str {
        "ResultSink"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn global_sink_state(&self, _state: &RuntimeState) -> ExecResult<Arc<dyn GlobalSinkState>> {
        Ok(Arc::new(ResultGlobalSinkState))
    }

    fn local_sink_state(
        &self,
        _state: &RuntimeState,
        _gstate: &dyn GlobalSinkState,
    ) -> ExecResult<Box<dyn LocalSinkState>> {
        Ok(Box::new(ResultLocalSinkState))
    }

    fn sink(
        &self,
        _state: &RuntimeState,
        _gstate: &dyn GlobalSinkState,
        _lstate: &mut dyn LocalSinkState,
        chunk: Chunk,
    ) -> ExecResult<SinkResult> {
        let mut guard = self.handle.inner.lock().expect("result_sink lock");
        guard.push(chunk);
        Ok(SinkResult::NeedMoreInput)
    }
}
