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
//! Task scheduler contract consumed by pipelines and events.

use crate::common::status::ExecResult;

/// Unit of work handed to a scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool of worker threads that runs submitted jobs to completion.
pub trait TaskScheduler: Send + Sync {
    /// Number of worker threads; at least 1.
    fn number_of_threads(&self) -> usize;

    /// Queue `jobs` for execution. Fails only when the scheduler no longer accepts work.
    fn schedule(&self, jobs: Vec<Job>) -> ExecResult<()>;

    /// Stable identity of the calling thread: 0 when it is not one of this scheduler's
    /// workers, otherwise its position in the worker table plus one.
    fn current_thread_id(&self) -> usize;
}
