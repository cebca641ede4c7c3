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
//! Fixed-size worker pool.
//!
//! Responsibilities:
//! - Runs scheduled jobs on named worker threads pulling from one shared FIFO queue.
//! - Resolves the dense worker id of the calling thread.
//!
//! Key exported interfaces:
//! - Types: `WorkerPool`.
//!
//! Current limitations:
//! - Jobs run to completion; there is no time slicing or preemption.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::common::config;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::task_scheduler::{Job, TaskScheduler};
use crate::predtrans_logging::{debug, error};

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

/// Worker pool implementing [`TaskScheduler`].
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    thread_ids: Vec<thread::ThreadId>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Arc<Self> {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(num_threads);
        let mut thread_ids = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("predtrans-exec-{}", idx))
                .spawn(move || worker_loop(shared_cloned));
            match spawned {
                Ok(handle) => {
                    thread_ids.push(handle.thread().id());
                    workers.push(handle);
                }
                Err(e) => {
                    error!("failed to spawn exec worker {}: {}", idx, e);
                    break;
                }
            }
        }
        debug!("worker pool started: threads={}", workers.len());

        Arc::new(Self {
            shared,
            thread_ids,
            workers: Mutex::new(workers),
        })
    }

    /// Pool sized from `[runtime] exec_threads`.
    pub fn from_config() -> Arc<Self> {
        Self::new(config::exec_threads())
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.workers.lock().expect("worker pool lock"));
        for handle in handles {
            // A worker may drop the last pool handle from inside a job.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl TaskScheduler for WorkerPool {
    fn number_of_threads(&self) -> usize {
        self.thread_ids.len().max(1)
    }

    fn schedule(&self, jobs: Vec<Job>) -> ExecResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        if self.shared.shutdown.load(Ordering::Acquire) || self.thread_ids.is_empty() {
            return Err(ExecError::internal("worker pool is not accepting jobs"));
        }
        let mut queue = self.shared.queue.lock().expect("worker pool queue lock");
        queue.extend(jobs);
        self.shared.cv.notify_all();
        Ok(())
    }

    fn current_thread_id(&self) -> usize {
        let current = thread::current().id();
        self.thread_ids
            .iter()
            .position(|id| *id == current)
            .map(|idx| idx + 1)
            .unwrap_or(0)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("worker pool queue lock");
            while queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                queue = shared
                    .cv
                    .wait(queue)
                    .expect("worker pool queue condvar wait");
            }
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            queue.pop_front()
        };

        let Some(job) = job else {
            continue;
        };

        // Jobs report their own failures; a panic escaping one must not kill the worker.
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            error!("panic escaped worker job: {}", panic_message(payload.as_ref()));
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
