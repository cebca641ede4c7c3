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
//! Core physical operator contract.
//!
//! Responsibilities:
//! - Defines the source / in-line / sink execution contracts driven by pipeline drivers.
//! - Defines the typed global/local state objects operators keep between calls.
//! - Defines how an operator places itself into pipelines during construction.
//!
//! Key exported interfaces:
//! - Types: `PhysicalOperator`, `SourceResult`, `SinkResult`, `CombineResult`,
//!   `FinalizeResult`, `PendingEvents`.
//! - State traits: `GlobalSinkState`, `LocalSinkState`, `GlobalSourceState`,
//!   `LocalSourceState`.
//!
//! Current limitations:
//! - Calls never suspend: every call runs to completion or failure on the calling worker.
//! - Unsupported calls surface as `ExecError::Internal` instead of fallback behavior.

use std::any::Any;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::common::ids::{OperatorId, PipelineId};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::builder::{MetaPipelineId, PipelineBuilder};
use crate::exec::pipeline::event::EventHandler;
use crate::runtime::runtime_state::RuntimeState;

/// Result of one `get_data` call.
#[derive(Debug)]
pub enum SourceResult {
    HaveMoreOutput(Chunk),
    Finished,
}

/// Result of one `sink` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkResult {
    NeedMoreInput,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombineResult {
    Finished,
}

/// `Ready` means finalize returned; work it scheduled may still be running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizeResult {
    Ready,
}

/// Shared sink state, one per operator per query.
pub trait GlobalSinkState: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Sink state owned by exactly one driver.
pub trait LocalSinkState: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared source state, created once per pipeline run.
pub trait GlobalSourceState: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Upper bound on useful drivers for this source.
    fn max_threads(&self) -> usize {
        1
    }
}

/// Source state owned by exactly one driver.
pub trait LocalSourceState: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Work a sink's finalize asks the runtime to run before its pipeline counts as done.
#[derive(Default)]
pub struct PendingEvents {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl PendingEvents {
    pub fn insert(&mut self, handler: Box<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn into_handlers(self) -> Vec<Box<dyn EventHandler>> {
        self.handlers
    }
}

fn unsupported<T>(op: &str, call: &str) -> ExecResult<T> {
    Err(ExecError::internal(format!(
        "operator {} does not support {}",
        op, call
    )))
}

/// Physical operator placed into pipelines.
///
/// One operator may play several roles: a materializing operator is the sink of the
/// pipeline that feeds it and the source of the pipeline that consumes it.
pub trait PhysicalOperator: Send + Sync {
    fn id(&self) -> OperatorId;

    fn name(&self) -> &str;

    fn schema(&self) -> SchemaRef;

    fn params_to_string(&self) -> String {
        String::new()
    }

    // ---- source ----

    fn is_source(&self) -> bool {
        false
    }

    fn global_source_state(&self, state: &RuntimeState) -> ExecResult<Arc<dyn GlobalSourceState>> {
        let _ = state;
        unsupported(self.name(), "global_source_state")
    }

    fn local_source_state(
        &self,
        state: &RuntimeState,
        gstate: &dyn GlobalSourceState,
    ) -> ExecResult<Box<dyn LocalSourceState>> {
        let _ = (state, gstate);
        unsupported(self.name(), "local_source_state")
    }

    fn get_data(
        &self,
        state: &RuntimeState,
        gstate: &dyn GlobalSourceState,
        lstate: &mut dyn LocalSourceState,
    ) -> ExecResult<SourceResult> {
        let _ = (state, gstate, lstate);
        unsupported(self.name(), "get_data")
    }

    // ---- in-line ----

    /// Transform one chunk; `None` drops it.
    fn execute(&self, state: &RuntimeState, chunk: Chunk) -> ExecResult<Option<Chunk>> {
        let _ = (state, chunk);
        unsupported(self.name(), "execute")
    }

    // ---- sink ----

    fn is_sink(&self) -> bool {
        false
    }

    fn global_sink_state(&self, state: &RuntimeState) -> ExecResult<Arc<dyn GlobalSinkState>> {
        let _ = state;
        unsupported(self.name(), "global_sink_state")
    }

    fn local_sink_state(
        &self,
        state: &RuntimeState,
        gstate: &dyn GlobalSinkState,
    ) -> ExecResult<Box<dyn LocalSinkState>> {
        let _ = (state, gstate);
        unsupported(self.name(), "local_sink_state")
    }

    fn sink(
        &self,
        state: &RuntimeState,
        gstate: &dyn GlobalSinkState,
        lstate: &mut dyn LocalSinkState,
        chunk: Chunk,
    ) -> ExecResult<SinkResult> {
        let _ = (state, gstate, lstate, chunk);
        unsupported(self.name(), "sink")
    }

    /// Called once per driver after its input is exhausted.
    fn combine(
        &self,
        state: &RuntimeState,
        gstate: &dyn GlobalSinkState,
        lstate: &mut dyn LocalSinkState,
    ) -> ExecResult<CombineResult> {
        let _ = (state, gstate, lstate);
        Ok(CombineResult::Finished)
    }

    /// Called exactly once, after every driver of the pipeline has combined.
    fn finalize(
        &self,
        state: &Arc<RuntimeState>,
        gstate: &Arc<dyn GlobalSinkState>,
        events: &mut PendingEvents,
    ) -> ExecResult<FinalizeResult> {
        let _ = (state, gstate, events);
        Ok(FinalizeResult::Ready)
    }

    // ---- construction ----

    /// Place this operator (and its inputs) into `current`.
    ///
    /// `this` is the shared handle of `self`. The default places a source operator as
    /// the leaf of `current`; operators with inputs must override it.
    fn build_pipelines(
        &self,
        this: &Arc<dyn PhysicalOperator>,
        current: PipelineId,
        meta: MetaPipelineId,
        builder: &mut PipelineBuilder,
    ) -> ExecResult<()> {
        let _ = meta;
        if self.is_source() {
            builder.set_pipeline_source(current, Arc::clone(this))
        } else {
            unsupported(self.name(), "build_pipelines")
        }
    }
}

/// Downcast helper used by operators to recover their own concrete state kinds.
pub fn downcast_ref<'a, T: Any>(any: &'a dyn Any, op: &str, what: &str) -> ExecResult<&'a T> {
    any.downcast_ref::<T>().ok_or_else(|| {
        ExecError::internal(format!(
            "operator {} received a {} of the wrong kind (expected {})",
            op,
            what,
            std::any::type_name::<T>()
        ))
    })
}

pub fn downcast_mut<'a, T: Any>(
    any: &'a mut dyn Any,
    op: &str,
    what: &str,
) -> ExecResult<&'a mut T> {
    any.downcast_mut::<T>().ok_or_else(|| {
        ExecError::internal(format!(
            "operator {} received a {} of the wrong kind (expected {})",
            op,
            what,
            std::any::type_name::<T>()
        ))
    })
}
