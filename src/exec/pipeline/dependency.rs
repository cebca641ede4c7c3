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
//! Readiness flags with waiters.
//!
//! Responsibilities:
//! - Models "this thing is done" conditions: a pipeline finishing, a runtime filter
//!   being published.
//! - Runs registered waiters exactly once when the flag flips to ready.
//!
//! Key exported interfaces:
//! - Types: `DependencyHandle`, `Dependency`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::exec::pipeline::schedule::observer::{Observable, Observer};
use crate::predtrans_logging::debug;

static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

/// Reference-counted handle to one dependency object.
pub type DependencyHandle = Arc<Dependency>;

/// One-way readiness flag. Once ready it never goes back to blocked.
pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    observable: Arc<Observable>,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    pub fn new(name: impl Into<String>) -> DependencyHandle {
        Arc::new(Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            observable: Arc::new(Observable::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        let prev = self.ready.swap(true, Ordering::AcqRel);
        if !prev {
            let notify = self.observable.defer_notify();
            notify.arm();
            debug!(
                "Dependency ready: dep_id={} name={} observers={}",
                self.id,
                self.name,
                self.observable.num_observers()
            );
        }
    }

    /// Run `observer` once the dependency is ready; immediately if it already is.
    pub fn add_waiter(&self, observer: Observer) {
        if self.is_ready() {
            observer();
            return;
        }
        self.observable.add_observer(observer);
        // Ready may have flipped between the check and the registration.
        if self.is_ready() {
            let notify = self.observable.defer_notify();
            notify.arm();
        }
    }
}
