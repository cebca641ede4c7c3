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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<PredTransConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static PredTransConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = PredTransConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn init_from_env_or_default() -> Result<&'static PredTransConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = PredTransConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn config() -> Result<&'static PredTransConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("PREDTRANS_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    let candidates = [PathBuf::from("predtrans.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $PREDTRANS_CONFIG or create ./predtrans.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct PredTransConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "predtrans=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub runtime_filter: RuntimeFilterConfig,
}

impl PredTransConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: PredTransConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    /// Filter expression handed to the logging subscriber.
    pub fn effective_log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for PredTransConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
            runtime_filter: RuntimeFilterConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_exec_threads")]
    pub exec_threads: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_parallel_construct_threshold")]
    pub parallel_construct_threshold: usize,
    /// Forces the parallel finalize/source paths even for small inputs.
    #[serde(default)]
    pub verify_parallelism: bool,
    #[serde(default = "default_query_mem_limit_bytes")]
    pub query_mem_limit_bytes: i64,
}

fn default_exec_threads() -> usize {
    0 // 0 means use CPU cores
}

fn default_chunk_size() -> usize {
    2048
}

fn default_parallel_construct_threshold() -> usize {
    1_048_576
}

fn default_query_mem_limit_bytes() -> i64 {
    -1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exec_threads: default_exec_threads(),
            chunk_size: default_chunk_size(),
            parallel_construct_threshold: default_parallel_construct_threshold(),
            verify_parallelism: false,
            query_mem_limit_bytes: default_query_mem_limit_bytes(),
        }
    }
}

impl RuntimeConfig {
    /// Get the actual number of executor threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_exec_threads(&self) -> usize {
        if self.exec_threads > 0 {
            self.exec_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Filter structure produced by the build side.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FilterFlavor {
    /// Block bloom filter, may return false positives.
    #[default]
    Bloom,
    /// Exact set of encoded key rows.
    Hash,
}

impl fmt::Display for FilterFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterFlavor::Bloom => write!(f, "bloom"),
            FilterFlavor::Hash => write!(f, "hash"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeFilterConfig {
    #[serde(default)]
    pub flavor: FilterFlavor,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_bloom_bits_per_key")]
    pub bloom_bits_per_key: usize,
}

fn default_bloom_bits_per_key() -> usize {
    16
}

impl Default for RuntimeFilterConfig {
    fn default() -> Self {
        Self {
            flavor: FilterFlavor::default(),
            seed: 0,
            bloom_bits_per_key: default_bloom_bits_per_key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterFlavor, PredTransConfig};

    #[test]
    fn test_runtime_defaults() {
        let cfg: PredTransConfig = toml::from_str(
            r#"
[runtime]
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.runtime.chunk_size, 2048);
        assert_eq!(cfg.runtime.parallel_construct_threshold, 1_048_576);
        assert!(!cfg.runtime.verify_parallelism);
        assert_eq!(cfg.runtime.query_mem_limit_bytes, -1);
        assert_eq!(cfg.runtime_filter.flavor, FilterFlavor::Bloom);
        assert_eq!(cfg.runtime_filter.bloom_bits_per_key, 16);
    }

    #[test]
    fn test_runtime_filter_can_be_overridden() {
        let cfg: PredTransConfig = toml::from_str(
            r#"
log_filter = "predtrans=debug"

[runtime]
exec_threads = 3
verify_parallelism = true

[runtime_filter]
flavor = "hash"
seed = 42
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.runtime.actual_exec_threads(), 3);
        assert!(cfg.runtime.verify_parallelism);
        assert_eq!(cfg.runtime_filter.flavor, FilterFlavor::Hash);
        assert_eq!(cfg.runtime_filter.seed, 42);
        assert_eq!(cfg.effective_log_filter(), "predtrans=debug");
    }

    #[test]
    fn test_unknown_flavor_is_rejected() {
        let parsed: Result<PredTransConfig, _> = toml::from_str(
            r#"
[runtime_filter]
flavor = "cuckoo"
"#,
        );
        assert!(parsed.is_err());
    }
}
