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
//! Task groups ("events") scheduled after a sink finalizes.
//!
//! Responsibilities:
//! - Turns an `EventHandler`'s task set into scheduler jobs.
//! - Counts task completions; the first failure (error or panic) fails the whole group.
//! - Runs the handler's finish step only when every task succeeded, then reports the
//!   group result to the completion callback and to `wait()`ers.
//!
//! Key exported interfaces:
//! - Types: `Task`, `EventHandler`, `Event`.

use std::sync::{Arc, Condvar, Mutex};

use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::task_scheduler::Job;
use crate::exec::pipeline::worker_pool::panic_message;
use crate::predtrans_logging::{debug, warn};
use crate::runtime::runtime_state::RuntimeState;

/// One schedulable unit of work inside an event.
pub trait Task: Send {
    fn name(&self) -> String;

    fn execute(self: Box<Self>, state: &RuntimeState) -> ExecResult<()>;
}

/// Behavior of one event: which tasks to run and what to do once they all succeeded.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn schedule(&self, state: &Arc<RuntimeState>) -> ExecResult<Vec<Box<dyn Task>>>;

    /// Runs on the thread that completed the last task, only if no task failed.
    fn finish_event(&self, state: &Arc<RuntimeState>) -> ExecResult<()> {
        let _ = state;
        Ok(())
    }
}

type CompletionCallback = Box<dyn FnOnce(ExecResult<()>) + Send>;

struct EventState {
    remaining: usize,
    error: Option<ExecError>,
    result: Option<ExecResult<()>>,
}

/// A scheduled task group.
pub struct Event {
    handler: Box<dyn EventHandler>,
    mu: Mutex<EventState>,
    cv: Condvar,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl Event {
    pub fn new(handler: Box<dyn EventHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            mu: Mutex::new(EventState {
                remaining: 0,
                error: None,
                result: None,
            }),
            cv: Condvar::new(),
            on_complete: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Register the callback receiving the group result. Must precede `schedule`.
    pub fn on_complete(&self, callback: impl FnOnce(ExecResult<()>) + Send + 'static) {
        *self.on_complete.lock().expect("event callback lock") = Some(Box::new(callback));
    }

    /// Ask the handler for its tasks and submit them.
    ///
    /// An error here means nothing was submitted; the completion callback is not run.
    pub fn schedule(self: &Arc<Self>, state: &Arc<RuntimeState>) -> ExecResult<()> {
        let tasks = self.handler.schedule(state)?;
        debug!("event scheduled: name={} tasks={}", self.name(), tasks.len());
        if tasks.is_empty() {
            self.complete(state);
            return Ok(());
        }
        {
            let mut st = self.mu.lock().expect("event lock");
            st.remaining = tasks.len();
        }
        let jobs: Vec<Job> = tasks
            .into_iter()
            .map(|task| {
                let event = Arc::clone(self);
                let state = Arc::clone(state);
                Box::new(move || event.run_task(&state, task)) as Job
            })
            .collect();
        state.scheduler().schedule(jobs)
    }

    fn run_task(self: &Arc<Self>, state: &Arc<RuntimeState>, task: Box<dyn Task>) {
        if !self.has_failed() {
            let task_name = task.name();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                task.execute(state)
            }))
            .unwrap_or_else(|payload| {
                Err(ExecError::TaskFailed(format!(
                    "panic in task {}: {}",
                    task_name,
                    panic_message(payload.as_ref())
                )))
            });
            if let Err(err) = outcome {
                warn!(
                    "event task failed: event={} task={} error={}",
                    self.name(),
                    task_name,
                    err
                );
                self.record_error(err);
            }
        }
        self.task_finished(state);
    }

    fn has_failed(&self) -> bool {
        self.mu.lock().expect("event lock").error.is_some()
    }

    fn record_error(&self, err: ExecError) {
        let mut st = self.mu.lock().expect("event lock");
        if st.error.is_none() {
            st.error = Some(match err {
                ExecError::TaskFailed(_) | ExecError::ResourceExhausted(_) => err,
                other => ExecError::TaskFailed(other.to_string()),
            });
        }
    }

    fn task_finished(&self, state: &Arc<RuntimeState>) {
        let last = {
            let mut st = self.mu.lock().expect("event lock");
            st.remaining = st.remaining.saturating_sub(1);
            st.remaining == 0
        };
        if last {
            self.complete(state);
        }
    }

    fn complete(&self, state: &Arc<RuntimeState>) {
        let error = self.mu.lock().expect("event lock").error.clone();
        let result = match error {
            Some(err) => Err(err),
            None => self.handler.finish_event(state),
        };
        match &result {
            Ok(()) => debug!("event finished: name={}", self.name()),
            Err(err) => warn!("event failed: name={} error={}", self.name(), err),
        }
        {
            let mut st = self.mu.lock().expect("event lock");
            st.result = Some(result.clone());
            self.cv.notify_all();
        }
        let callback = self.on_complete.lock().expect("event callback lock").take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.mu.lock().expect("event lock").result.is_some()
    }

    /// Block until the group completed and return its result.
    pub fn wait(&self) -> ExecResult<()> {
        let mut st = self.mu.lock().expect("event lock");
        loop {
            if let Some(result) = st.result.clone() {
                return result;
            }
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }
}
