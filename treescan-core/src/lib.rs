//! Treescan Core - repository-wide syntax-tree extraction
//!
//! Walks a source tree, parses every file with a registered grammar in
//! parallel, stores each syntax tree as a compressed, content-addressed
//! blob and records one chunk row per file.

pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod grammar;
pub mod scan;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod syntax;
pub mod worker;

pub use config::Config;
pub use db::{ChunkRecord, ScanDb, ScanId, ScanRecord, ScanStatus};
pub use discovery::discover;
pub use error::{ErrorEnvelope, ScanError};
pub use grammar::{Grammar, GrammarRegistry};
pub use scan::{ScanDeps, ScanEngine, ScanReport};
pub use scheduler::{BatchScheduler, CancelFlag, SchedulerStats};
pub use source::SourceTree;
pub use store::{BlobCache, ContentStore, MemoryCache, RedisCache};
pub use syntax::{Position, SyntaxNode, TreeTooDeep};
pub use worker::{ChunkPayload, FailureStage, FileFailure, FileOutcome, ParseWorker};

/// Result type alias for treescan operations
pub type Result<T> = std::result::Result<T, ScanError>;
