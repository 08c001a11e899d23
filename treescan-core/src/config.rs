//! Configuration for treescan

use crate::ScanError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration as TOML
pub const DEFAULT_CONFIG: &str = r#"# treescan configuration

[scan]
# Files per batch. Chunks are persisted after every batch.
batch_size = 5000
# Parse worker threads (0 = number of CPU cores)
workers = 0
# Files larger than this (bytes) are recorded as failures instead of parsed
max_file_bytes = 8388608
# Files whose syntax tree nests deeper than this are recorded as failures
max_tree_depth = 100000

[store]
# SQLite database holding scans, ast_chunks and scan_failures
database = "treescan.db"

[cache]
# Content-addressed blob cache: "redis" or "memory"
backend = "redis"
redis_url = "redis://127.0.0.1:6379/0"

[discovery]
# Apply .gitignore / .ignore files while walking the source tree
respect_gitignore = false
# Additional glob patterns to skip (relative to the source root)
ignore = []

[jobs]
# Background scan jobs allowed to run at the same time
concurrency = 4
# Finished jobs kept for polling; the oldest are forgotten first
retain_finished = 1000
"#;

/// Environment variable overriding `store.database`
pub const ENV_DATABASE: &str = "TREESCAN_DATABASE";
/// Environment variable overriding `cache.redis_url`
pub const ENV_REDIS_URL: &str = "TREESCAN_REDIS_URL";

/// treescan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_tree_depth")]
    pub max_tree_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub respect_gitignore: bool,
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_job_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

// Default value functions
fn default_batch_size() -> usize {
    5000
}
fn default_max_file_bytes() -> u64 {
    8 * 1024 * 1024
}
fn default_max_tree_depth() -> usize {
    crate::syntax::DEFAULT_MAX_TREE_DEPTH
}
fn default_database() -> PathBuf {
    PathBuf::from("treescan.db")
}
fn default_cache_backend() -> CacheBackend {
    CacheBackend::Redis
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_job_concurrency() -> usize {
    4
}
fn default_retain_finished() -> usize {
    1000
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: 0,
            max_file_bytes: default_max_file_bytes(),
            max_tree_depth: default_max_tree_depth(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_job_concurrency(),
            retain_finished: default_retain_finished(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load config from `path` if it exists, defaults otherwise, then apply
    /// environment overrides.
    pub fn load_or_default(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::load(p)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| ScanError::ConfigParse(e.to_string()))
    }

    /// Write the default config to `path`, refusing to overwrite.
    pub fn init(path: &Path) -> crate::Result<()> {
        if path.exists() {
            return Err(ScanError::ConfigExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, DEFAULT_CONFIG)?;
        Ok(())
    }

    /// Apply `TREESCAN_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var(ENV_DATABASE) {
            if !db.is_empty() {
                self.store.database = PathBuf::from(db);
            }
        }
        if let Ok(url) = std::env::var(ENV_REDIS_URL) {
            if !url.is_empty() {
                self.cache.redis_url = url;
            }
        }
    }

    /// Worker count with 0 resolved to the number of available cores
    pub fn worker_count(&self) -> usize {
        resolve_workers(self.scan.workers)
    }

    /// Batch size, never zero
    pub fn batch_size(&self) -> usize {
        self.scan.batch_size.max(1)
    }
}

pub(crate) fn resolve_workers(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
