//! Error types for treescan operations

use serde::Serialize;
use std::path::PathBuf;

/// Structured error payload shared between the service and the CLI.
///
/// Used as the HTTP error body in treescan-service and as the `--json` error
/// output of the CLI.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub hint: String,
}

impl ErrorEnvelope {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn internal(msg: &str) -> Self {
        Self::new("internal_error", msg, "Check service logs for details")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache unavailable: {0}")]
    Cache(String),

    #[error("Corrupt cache entry {hash}: {message}")]
    Corrupt { hash: String, message: String },

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Config already exists at {}", .0.display())]
    ConfigExists(PathBuf),

    #[error("Glob pattern error: {0}")]
    GlobPattern(String),

    #[error("Grammar error for '{lang}': {message}")]
    Grammar { lang: String, message: String },

    #[error("Schema version mismatch: database is v{found}, expected v{expected}. Point treescan at a fresh database file.")]
    SchemaVersionMismatch { found: i32, expected: i32 },

    #[error("Scan {0} not found")]
    ScanNotFound(i64),

    #[error("Blob {0} not found in cache")]
    BlobNotFound(String),

    #[error("git clone of {url} failed: {message}")]
    Clone { url: String, message: String },

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for ScanError {
    fn from(err: redis::RedisError) -> Self {
        ScanError::Cache(err.to_string())
    }
}

impl ScanError {
    /// Short machine-readable code, used for error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::Cache(_) => "cache_unavailable",
            Self::Corrupt { .. } => "corrupt_blob",
            Self::ConfigParse(_) | Self::ConfigExists(_) => "config_error",
            Self::GlobPattern(_) => "glob_error",
            Self::Grammar { .. } => "grammar_error",
            Self::SchemaVersionMismatch { .. } => "schema_mismatch",
            Self::ScanNotFound(_) => "scan_not_found",
            Self::BlobNotFound(_) => "blob_not_found",
            Self::Clone { .. } => "clone_failed",
            Self::Cancelled => "cancelled",
            Self::Serialization(_) => "serialization_error",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let hint = match self {
            Self::Cache(_) => "Check that the cache backend is reachable (cache.redis_url)",
            Self::ScanNotFound(_) => "List scans with 'treescan show' or check the scan ID",
            Self::Clone { .. } => "Check the repository URL and that git is installed",
            Self::SchemaVersionMismatch { .. } => "Use a new store.database path",
            _ => "",
        };
        ErrorEnvelope::new(self.code(), self.to_string(), hint)
    }
}
