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
//! Combined-key encoding shared by filter build and probe.
//!
//! Multi-column keys are turned into one byte string per row with Arrow's row format,
//! so build and probe sides agree on key identity as long as they use the same column
//! types. Bloom filters hash that byte string with seeded xxHash64.

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::DataType;
use arrow::row::{RowConverter, Rows, SortField};
use twox_hash::XxHash64;

use crate::common::status::{ExecError, ExecResult};

pub struct KeyEncoder {
    key_types: Vec<DataType>,
    converter: RowConverter,
}

impl std::fmt::Debug for KeyEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEncoder")
            .field("key_types", &self.key_types)
            .finish()
    }
}

impl KeyEncoder {
    pub fn new(key_types: &[DataType]) -> ExecResult<Self> {
        if key_types.is_empty() {
            return Err(ExecError::internal("runtime filter needs at least one key column"));
        }
        let fields = key_types.iter().cloned().map(SortField::new).collect();
        let converter = RowConverter::new(fields)?;
        Ok(Self {
            key_types: key_types.to_vec(),
            converter,
        })
    }

    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    pub fn encode(&self, keys: &[ArrayRef]) -> ExecResult<Rows> {
        if keys.len() != self.key_types.len() {
            return Err(ExecError::internal(format!(
                "key column count mismatch: expected {}, got {}",
                self.key_types.len(),
                keys.len()
            )));
        }
        for (idx, (array, expected)) in keys.iter().zip(self.key_types.iter()).enumerate() {
            if array.data_type() != expected {
                return Err(ExecError::internal(format!(
                    "key column {} type mismatch: expected {:?}, got {:?}",
                    idx,
                    expected,
                    array.data_type()
                )));
            }
        }
        Ok(self.converter.convert_columns(keys)?)
    }
}

pub fn hash_key(seed: u64, key: &[u8]) -> u64 {
    XxHash64::oneshot(seed, key)
}

/// `true` for rows where any key column is null.
pub fn rows_with_null_key(keys: &[ArrayRef], num_rows: usize) -> Vec<bool> {
    let mut out = vec![false; num_rows];
    for array in keys {
        if array.null_count() == 0 {
            continue;
        }
        for (row, flag) in out.iter_mut().enumerate() {
            if array.is_null(row) {
                *flag = true;
            }
        }
    }
    out
}
