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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use arrow::array::{Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use predtrans::exec::chunk::Chunk;
use predtrans::exec::pipeline::worker_pool::WorkerPool;
use predtrans::predtrans_config;
use predtrans::predtrans_logging;
use predtrans::runtime::runtime_state::{ExecOptions, RuntimeState};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_predtrans.toml");

        let config_content = r#"
log_level = "debug"

[runtime]
exec_threads = 3
chunk_size = 100
parallel_construct_threshold = 4096
verify_parallelism = false
query_mem_limit_bytes = 67108864

[runtime_filter]
flavor = "hash"
seed = 7
bloom_bits_per_key = 12
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        predtrans_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static predtrans_config::PredTransConfig> {
        predtrans_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Options for a query on `threads` workers with small chunks.
pub fn test_options(chunk_size: usize) -> ExecOptions {
    ExecOptions {
        chunk_size,
        ..ExecOptions::default()
    }
}

pub fn test_state(threads: usize, options: ExecOptions) -> Arc<RuntimeState> {
    RuntimeState::new(WorkerPool::new(threads), options)
}

/// Schema `(k INT64, tag UTF8)` used by the build and probe generators.
pub fn key_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("tag", DataType::Utf8, true),
    ]))
}

/// `batches` batches of `rows_per_batch` rows with consecutive keys starting at `start`.
pub fn key_batches(start: i64, batches: usize, rows_per_batch: usize) -> Vec<RecordBatch> {
    let schema = key_schema();
    (0..batches)
        .map(|b| {
            let from = start + (b * rows_per_batch) as i64;
            let keys = Int64Array::from_iter_values(from..from + rows_per_batch as i64);
            let tags = StringArray::from_iter_values(
                (0..rows_per_batch).map(|i| format!("b{}r{}", b, i)),
            );
            RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(keys), Arc::new(tags)])
                .expect("key batch")
        })
        .collect()
}

pub fn total_rows(chunks: &[Chunk]) -> usize {
    chunks.iter().map(Chunk::len).sum()
}

/// All values of the `k` column, sorted.
pub fn sorted_keys(chunks: &[Chunk]) -> Vec<i64> {
    let mut keys: Vec<i64> = chunks
        .iter()
        .flat_map(|chunk| {
            chunk
                .batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("k column")
                .iter()
                .flatten()
                .collect::<Vec<_>>()
        })
        .collect();
    keys.sort_unstable();
    keys
}
