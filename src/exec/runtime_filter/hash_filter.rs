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
use hashbrown::HashSet;

/// Exact membership set over row-encoded keys.
#[derive(Clone, Debug, Default)]
pub struct ExactKeySet {
    keys: HashSet<Box<[u8]>>,
    key_bytes: usize,
}

impl ExactKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &[u8]) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.key_bytes += key.len();
        self.keys.insert(key.into())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Bytes held by stored keys.
    pub fn key_bytes(&self) -> usize {
        self.key_bytes
    }

    /// Union `other` into `self`, consuming it.
    pub fn merge_from(&mut self, other: ExactKeySet) {
        if self.keys.is_empty() {
            *self = other;
            return;
        }
        for key in other.keys {
            if !self.keys.contains(&key) {
                self.key_bytes += key.len();
                self.keys.insert(key);
            }
        }
    }
}
