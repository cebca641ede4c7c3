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
use crate::common::app_config::FilterFlavor;
use crate::predtrans_config::config as predtrans_app_config;

pub(crate) fn exec_threads() -> usize {
    predtrans_app_config()
        .ok()
        .map(|c| c.runtime.actual_exec_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn chunk_size() -> usize {
    predtrans_app_config()
        .ok()
        .map(|c| {
            if c.runtime.chunk_size == 0 {
                2048
            } else {
                c.runtime.chunk_size
            }
        })
        .unwrap_or(2048)
}

pub(crate) fn parallel_construct_threshold() -> usize {
    predtrans_app_config()
        .ok()
        .map(|c| c.runtime.parallel_construct_threshold)
        .unwrap_or(1_048_576)
}

pub(crate) fn verify_parallelism() -> bool {
    predtrans_app_config()
        .ok()
        .map(|c| c.runtime.verify_parallelism)
        .unwrap_or(false)
}

pub(crate) fn query_mem_limit_bytes() -> i64 {
    predtrans_app_config()
        .ok()
        .map(|c| c.runtime.query_mem_limit_bytes)
        .unwrap_or(-1)
}

pub(crate) fn runtime_filter_flavor() -> FilterFlavor {
    predtrans_app_config()
        .ok()
        .map(|c| c.runtime_filter.flavor)
        .unwrap_or_default()
}

pub(crate) fn runtime_filter_seed() -> u64 {
    predtrans_app_config()
        .ok()
        .map(|c| c.runtime_filter.seed)
        .unwrap_or(0)
}

pub(crate) fn bloom_bits_per_key() -> usize {
    predtrans_app_config()
        .ok()
        .map(|c| c.runtime_filter.bloom_bits_per_key.max(1))
        .unwrap_or(16)
}
