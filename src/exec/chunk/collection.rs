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
//! Append-only chunk store used by materializing sinks.
//!
//! Responsibilities:
//! - Buffers incoming chunks in bounded-size slices addressable by index.
//! - Moves all buffered chunks from a donor collection on combine.
//! - Charges buffered bytes to an optional memory tracker.
//!
//! Key exported interfaces:
//! - Types: `ChunkCollection`.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use super::Chunk;
use crate::common::status::{ExecError, ExecResult};
use crate::runtime::mem_tracker::{MemReservation, MemTracker};

/// Ordered chunk store with random-access fetch.
///
/// Every stored chunk holds at most `chunk_size` rows and is never empty.
#[derive(Debug)]
pub struct ChunkCollection {
    schema: SchemaRef,
    chunk_size: usize,
    chunks: Vec<Chunk>,
    rows: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    reservations: Vec<MemReservation>,
}

impl ChunkCollection {
    pub fn new(schema: SchemaRef, chunk_size: usize) -> Self {
        Self {
            schema,
            chunk_size: chunk_size.max(1),
            chunks: Vec::new(),
            rows: 0,
            mem_tracker: None,
            reservations: Vec::new(),
        }
    }

    pub fn with_mem_tracker(mut self, tracker: Arc<MemTracker>) -> Self {
        self.mem_tracker = Some(tracker);
        self
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total number of rows.
    pub fn count(&self) -> usize {
        self.rows
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn append(&mut self, chunk: Chunk) -> ExecResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.check_schema(&chunk.schema())?;
        if let Some(tracker) = self.mem_tracker.as_ref() {
            let reservation = MemReservation::try_new(chunk.logical_bytes()?, tracker)?;
            self.reservations.push(reservation);
        }
        let len = chunk.len();
        if len <= self.chunk_size {
            self.chunks.push(chunk);
        } else {
            let mut offset = 0;
            while offset < len {
                let n = self.chunk_size.min(len - offset);
                self.chunks.push(chunk.slice(offset, n));
                offset += n;
            }
        }
        self.rows += len;
        Ok(())
    }

    /// Move every chunk of `other` into `self`, leaving `other` empty.
    pub fn combine(&mut self, other: &mut ChunkCollection) -> ExecResult<()> {
        if other.chunks.is_empty() {
            return Ok(());
        }
        self.check_schema(&other.schema)?;
        self.chunks.append(&mut other.chunks);
        self.reservations.append(&mut other.reservations);
        self.rows += other.rows;
        other.rows = 0;
        Ok(())
    }

    pub fn fetch_chunk(&self, idx: usize) -> ExecResult<Chunk> {
        self.chunks.get(idx).cloned().ok_or_else(|| {
            ExecError::internal(format!(
                "chunk index {} out of range (chunk_count={})",
                idx,
                self.chunks.len()
            ))
        })
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    fn check_schema(&self, schema: &SchemaRef) -> ExecResult<()> {
        let expected = self.schema.fields();
        let actual = schema.fields();
        let same = expected.len() == actual.len()
            && expected
                .iter()
                .zip(actual.iter())
                .all(|(a, b)| a.data_type() == b.data_type());
        if same {
            Ok(())
        } else {
            Err(ExecError::internal(format!(
                "chunk schema mismatch: expected {:?}, got {:?}",
                self.schema, schema
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkCollection;
    use crate::common::status::ExecError;
    use crate::exec::chunk::Chunk;
    use crate::runtime::mem_tracker::MemTracker;
    use arrow::array::{Int64Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use std::sync::Arc;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]))
    }

    fn chunk(start: i64, len: usize) -> Chunk {
        let values: Vec<i64> = (start..start + len as i64).collect();
        Chunk::new(
            RecordBatch::try_new(schema(), vec![Arc::new(Int64Array::from(values))]).unwrap(),
        )
    }

    #[test]
    fn append_splits_into_bounded_chunks() {
        let mut c = ChunkCollection::new(schema(), 4);
        c.append(chunk(0, 10)).unwrap();
        c.append(chunk(0, 0)).unwrap();
        assert_eq!(c.count(), 10);
        assert_eq!(c.chunk_count(), 3);
        let lens: Vec<usize> = c.chunks().map(Chunk::len).collect();
        assert_eq!(lens, vec![4, 4, 2]);
    }

    #[test]
    fn combine_moves_all_rows_and_empties_donor() {
        let mut global = ChunkCollection::new(schema(), 8);
        let mut local = ChunkCollection::new(schema(), 8);
        global.append(chunk(0, 3)).unwrap();
        local.append(chunk(3, 5)).unwrap();
        global.combine(&mut local).unwrap();
        assert_eq!(global.count(), 8);
        assert_eq!(global.chunk_count(), 2);
        assert!(local.is_empty());
        assert_eq!(local.chunk_count(), 0);
    }

    #[test]
    fn fetch_out_of_range_is_internal() {
        let mut c = ChunkCollection::new(schema(), 8);
        c.append(chunk(0, 3)).unwrap();
        assert_eq!(c.fetch_chunk(0).unwrap().len(), 3);
        assert!(c.fetch_chunk(1).unwrap_err().is_internal());
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let mut c = ChunkCollection::new(schema(), 8);
        let other = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, true)]));
        let batch =
            RecordBatch::try_new(other, vec![Arc::new(StringArray::from(vec!["a"]))]).unwrap();
        assert!(c.append(Chunk::new(batch)).unwrap_err().is_internal());
    }

    #[test]
    fn reservations_follow_chunks_and_respect_limit() {
        let root = MemTracker::new_root_with_limit("query", 1 << 20);
        let mut global = ChunkCollection::new(schema(), 8).with_mem_tracker(Arc::clone(&root));
        let mut local = ChunkCollection::new(schema(), 8).with_mem_tracker(Arc::clone(&root));
        local.append(chunk(0, 100)).unwrap();
        let charged = root.current();
        assert!(charged > 0);
        global.combine(&mut local).unwrap();
        drop(local);
        assert_eq!(root.current(), charged);
        drop(global);
        assert_eq!(root.current(), 0);

        let tiny = MemTracker::new_root_with_limit("tiny", 16);
        let mut c = ChunkCollection::new(schema(), 8).with_mem_tracker(tiny);
        let err = c.append(chunk(0, 100)).unwrap_err();
        assert!(matches!(err, ExecError::ResourceExhausted(_)));
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn slices_of_one_parent_are_charged_once_per_row() {
        let root = MemTracker::new_root("query");
        let parent = chunk(0, 100);
        let mut c = ChunkCollection::new(schema(), 10).with_mem_tracker(Arc::clone(&root));
        for i in 0..10 {
            c.append(parent.slice(i * 10, 10)).unwrap();
        }
        assert_eq!(c.count(), 100);
        assert_eq!(root.current(), 100 * 8);
    }
}
