//! Scan orchestrator: scan record → discovery → batches → commit.

use crate::config::Config;
use crate::db::{ScanDb, ScanId, ScanStatus};
use crate::discovery::discover;
use crate::error::ScanError;
use crate::grammar::GrammarRegistry;
use crate::scheduler::{BatchScheduler, CancelFlag};
use crate::store::{open_cache, BlobCache, ContentStore};
use crate::worker::ParseWorker;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Long-lived collaborators shared by every scan in a process
#[derive(Clone)]
pub struct ScanDeps {
    pub config: Config,
    pub registry: Arc<GrammarRegistry>,
    pub cache: Arc<dyn BlobCache>,
}

impl ScanDeps {
    pub fn new(config: Config, registry: Arc<GrammarRegistry>, cache: Arc<dyn BlobCache>) -> Self {
        Self {
            config,
            registry,
            cache,
        }
    }

    /// Default grammars plus the cache backend named in `config`
    pub fn from_config(config: Config) -> crate::Result<Self> {
        let cache = open_cache(&config.cache)?;
        let registry = Arc::new(GrammarRegistry::with_defaults());
        registry.warm()?;
        Ok(Self::new(config, registry, cache))
    }
}

/// Summary of a finished scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scan_id: ScanId,
    pub files_discovered: usize,
    pub chunks: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batches: usize,
    pub lines: usize,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl ScanReport {
    pub fn lines_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.lines as f64 / secs
        } else {
            0.0
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Runs scans for one source reference against one database
pub struct ScanEngine {
    source_ref: String,
    deps: ScanDeps,
    db: ScanDb,
    cancel: CancelFlag,
}

impl ScanEngine {
    pub fn new(source_ref: &str, deps: ScanDeps, db: ScanDb) -> Self {
        Self {
            source_ref: source_ref.to_string(),
            deps,
            db,
            cancel: CancelFlag::new(),
        }
    }

    /// Open the database named in the config
    pub fn open(source_ref: &str, deps: ScanDeps) -> crate::Result<Self> {
        let db = ScanDb::open(&deps.config.store.database)?;
        Ok(Self::new(source_ref, deps, db))
    }

    /// Use an externally owned cancel flag
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for cancelling from another thread (honored between batches)
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn db(&self) -> &ScanDb {
        &self.db
    }

    pub fn into_db(self) -> ScanDb {
        self.db
    }

    /// Scan `root` and return the scan id once every chunk is committed
    pub fn run(&mut self, root: &Path) -> crate::Result<ScanId> {
        self.run_with_report(root).map(|report| report.scan_id)
    }

    pub fn run_with_report(&mut self, root: &Path) -> crate::Result<ScanReport> {
        let scan_id = self.db.create_scan(&self.source_ref)?;
        info!(scan_id, source = %self.source_ref, root = %root.display(), "scan started");

        match self.execute(scan_id, root) {
            Ok(report) => {
                self.db.finish_scan(scan_id, ScanStatus::Done, None)?;
                info!(
                    scan_id,
                    chunks = report.chunks,
                    failed = report.failed,
                    lines = report.lines,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "scan done"
                );
                Ok(report)
            }
            Err(err) => {
                let status = if matches!(err, ScanError::Cancelled) {
                    ScanStatus::Cancelled
                } else {
                    ScanStatus::Failed
                };
                error!(scan_id, status = status.as_str(), error = %err, "scan ended early");
                if let Err(mark_err) = self.db.finish_scan(scan_id, status, Some(&err.to_string())) {
                    warn!(scan_id, error = %mark_err, "could not record scan status");
                }
                Err(err)
            }
        }
    }

    fn execute(&mut self, scan_id: ScanId, root: &Path) -> crate::Result<ScanReport> {
        let started = Instant::now();
        let config = &self.deps.config;

        let files = discover(root, &self.deps.registry, &config.discovery)?;
        info!(scan_id, files = files.len(), "discovered files");

        let scheduler = BatchScheduler::new(config.batch_size(), config.scan.workers)?;
        let worker = ParseWorker::new(
            root,
            Arc::clone(&self.deps.registry),
            ContentStore::new(Arc::clone(&self.deps.cache)),
            config.scan.max_file_bytes,
        )
        .with_max_tree_depth(config.scan.max_tree_depth);

        let db = &mut self.db;
        let stats = scheduler.run(&files, &worker, &self.cancel, |batch| {
            db.insert_batch(scan_id, &batch.chunks, &batch.failures)
        })?;

        Ok(ScanReport {
            scan_id,
            files_discovered: files.len(),
            chunks: stats.chunks,
            skipped: stats.skipped,
            failed: stats.failed,
            batches: stats.batches,
            lines: stats.lines,
            elapsed: started.elapsed(),
        })
    }
}
