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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::status::{ExecError, ExecResult};

/// Bytes charged to a tracker and released when dropped.
///
/// Accumulators keep one of these per buffered allocation so that moving a buffer
/// between owners (local sink state -> global sink state) keeps the accounting exact.
#[derive(Debug)]
pub struct MemReservation {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl MemReservation {
    pub fn try_new(bytes: usize, tracker: &Arc<MemTracker>) -> ExecResult<Self> {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.try_consume(bytes)?;
        Ok(Self {
            bytes,
            tracker: Arc::clone(tracker),
        })
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for MemReservation {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

/// Tracks logical memory usage for a component and its ancestors.
///
/// Only bytes explicitly reported by the caller are counted. A negative limit means
/// unlimited; a positive limit on any tracker in the chain makes `try_consume` fail
/// with `ResourceExhausted` once the charge would exceed it.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Self::new_root_with_limit(label, -1)
    }

    pub fn new_root_with_limit(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            parent: None,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Create an unlimited child tracker with the provided parent.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        let child = Arc::new(Self {
            label: label.into(),
            limit: -1,
            parent: Some(Arc::clone(parent)),
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        });
        parent
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&child));
        child
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// Charge `bytes` to this tracker and all ancestors, failing if any limit is hit.
    ///
    /// On failure nothing stays charged.
    pub fn try_consume(&self, bytes: i64) -> ExecResult<()> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut charged: Vec<&MemTracker> = Vec::new();
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            charged.push(current);
            if current.limit >= 0 && new_value > current.limit {
                for t in charged {
                    t.current.fetch_sub(bytes, Ordering::AcqRel);
                }
                return Err(ExecError::ResourceExhausted(format!(
                    "memory limit exceeded on tracker '{}': limit={} consumption={} request={}",
                    current.label,
                    current.limit,
                    new_value - bytes,
                    bytes
                )));
            }
            tracker = current.parent.as_deref();
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.update_peak(current.current());
            tracker = current.parent.as_deref();
        }
        Ok(())
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}
