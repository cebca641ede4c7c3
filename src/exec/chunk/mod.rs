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
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch};
use arrow::datatypes::{Schema, SchemaRef};

use crate::common::status::{ExecError, ExecResult};

mod collection;

pub use collection::ChunkCollection;

/// A chunk of data, consisting of multiple rows.
/// Thin wrapper around an Arrow RecordBatch; cloning shares the column buffers.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn column(&self, idx: usize) -> ExecResult<ArrayRef> {
        self.batch.columns().get(idx).cloned().ok_or_else(|| {
            ExecError::internal(format!(
                "column index {} out of range (num_columns={})",
                idx,
                self.batch.num_columns()
            ))
        })
    }

    /// Columns at `indices`, in that order.
    pub fn key_columns(&self, indices: &[usize]) -> ExecResult<Vec<ArrayRef>> {
        indices.iter().map(|&idx| self.column(idx)).collect()
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    /// Bytes addressed by this chunk's rows. A slice is charged for its own window,
    /// not for the parent allocation it shares.
    pub fn logical_bytes(&self) -> ExecResult<usize> {
        record_batch_bytes(&self.batch)
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            batch: RecordBatch::new_empty(Arc::new(Schema::empty())),
        }
    }
}

pub fn record_batch_bytes(batch: &RecordBatch) -> ExecResult<usize> {
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(column.to_data().get_slice_memory_size()?);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field};

    fn int_chunk(values: Vec<i32>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))])
            .expect("record batch");
        Chunk::new(batch)
    }

    #[test]
    fn column_out_of_range_is_internal() {
        let chunk = int_chunk(vec![1, 2, 3]);
        assert!(chunk.column(0).is_ok());
        let err = chunk.column(1).expect_err("expected out of range");
        assert!(err.is_internal());
    }

    #[test]
    fn slices_are_charged_for_their_own_rows() {
        let chunk = int_chunk((0..64).collect());
        let slice = chunk.slice(10, 5);
        assert_eq!(slice.len(), 5);
        assert_eq!(chunk.logical_bytes().unwrap(), 64 * 4);
        assert_eq!(slice.logical_bytes().unwrap(), 5 * 4);
        let pieces: usize = (0..8)
            .map(|i| chunk.slice(i * 8, 8).logical_bytes().unwrap())
            .sum();
        assert_eq!(pieces, chunk.logical_bytes().unwrap());
        assert!(Chunk::default().is_empty());
        assert_eq!(Chunk::default().logical_bytes().unwrap(), 0);
    }
}
