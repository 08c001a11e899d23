//! Batch scheduler: splits the file list into bounded batches, fans each batch
//! out over the parse pool and hands the collected results to the caller
//! before the next batch starts.

use crate::error::ScanError;
use crate::worker::{ChunkPayload, FileFailure, FileOutcome, ParseWorker};
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Cooperative cancellation, honored between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Results of one batch, in no particular order
#[derive(Debug, Default)]
pub struct BatchResult {
    pub index: usize,
    pub dispatched: usize,
    pub chunks: Vec<ChunkPayload>,
    pub failures: Vec<FileFailure>,
    pub skipped: usize,
}

impl BatchResult {
    pub fn lines(&self) -> usize {
        self.chunks.iter().map(|c| c.n_lines).sum()
    }
}

/// Totals across all batches of a run
#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerStats {
    pub batches: usize,
    pub dispatched: usize,
    pub chunks: usize,
    pub failed: usize,
    pub skipped: usize,
    pub lines: usize,
}

pub struct BatchScheduler {
    batch_size: usize,
    pool: rayon::ThreadPool,
}

impl BatchScheduler {
    /// Capacity of the worker → coordinator channel
    const CHANNEL_CAPACITY: usize = 256;
    /// Worker stack size; tree-sitter parses deeply nested input on these threads
    const WORKER_STACK_BYTES: usize = 16 * 1024 * 1024;

    /// `workers == 0` means one per available core.
    pub fn new(batch_size: usize, workers: usize) -> crate::Result<Self> {
        let workers = crate::config::resolve_workers(workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .stack_size(Self::WORKER_STACK_BYTES)
            .thread_name(|i| format!("treescan-parse-{}", i))
            .build()
            .map_err(|e| ScanError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self {
            batch_size: batch_size.max(1),
            pool,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// ⌈n / batch_size⌉
    pub fn batch_count(&self, n: usize) -> usize {
        n.div_ceil(self.batch_size)
    }

    /// Run every batch. `on_batch` runs on the calling thread after a batch's
    /// workers have all finished and before the next batch is dispatched; an
    /// error from it stops the run.
    pub fn run<F>(
        &self,
        files: &[PathBuf],
        worker: &ParseWorker,
        cancel: &CancelFlag,
        mut on_batch: F,
    ) -> crate::Result<SchedulerStats>
    where
        F: FnMut(BatchResult) -> crate::Result<()>,
    {
        let total_batches = self.batch_count(files.len());
        let mut stats = SchedulerStats::default();

        for (index, batch) in files.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                info!(batch = index, total_batches, "cancelled before batch");
                return Err(ScanError::Cancelled);
            }

            let result = self.run_batch(index, batch, worker)?;
            info!(
                batch = index + 1,
                total_batches,
                files = result.dispatched,
                chunks = result.chunks.len(),
                failed = result.failures.len(),
                skipped = result.skipped,
                "batch parsed"
            );

            stats.batches += 1;
            stats.dispatched += result.dispatched;
            stats.chunks += result.chunks.len();
            stats.failed += result.failures.len();
            stats.skipped += result.skipped;
            stats.lines += result.lines();

            on_batch(result)?;
        }

        Ok(stats)
    }

    /// Fan one batch out over the pool and collect it on this thread.
    fn run_batch(
        &self,
        index: usize,
        batch: &[PathBuf],
        worker: &ParseWorker,
    ) -> crate::Result<BatchResult> {
        let (tx, rx) = crossbeam_channel::bounded::<crate::Result<FileOutcome>>(Self::CHANNEL_CAPACITY);

        // Set on the first infrastructure error so remaining files are not started
        let aborted = AtomicBool::new(false);
        let aborted_ref = &aborted;
        let pool = &self.pool;

        std::thread::scope(|s| {
            s.spawn(move || {
                pool.install(|| {
                    batch.par_iter().for_each_with(tx, |sender, path| {
                        if aborted_ref.load(Ordering::Relaxed) {
                            return;
                        }
                        let outcome = worker.process(path);
                        if outcome.is_err() {
                            aborted_ref.store(true, Ordering::Relaxed);
                        }
                        if sender.send(outcome).is_err() {
                            aborted_ref.store(true, Ordering::Relaxed);
                        }
                    });
                });
                // sender dropped here → receiver sees disconnect
            });

            let mut result = BatchResult {
                index,
                dispatched: batch.len(),
                ..Default::default()
            };
            let mut first_error: Option<ScanError> = None;

            // Drain fully so no worker blocks on a full channel
            for outcome in rx.iter() {
                match outcome {
                    Ok(FileOutcome::Chunk(chunk)) => result.chunks.push(chunk),
                    Ok(FileOutcome::Failed(failure)) => result.failures.push(failure),
                    Ok(FileOutcome::Skipped { relpath }) => {
                        debug!(relpath = %relpath, "skipped");
                        result.skipped += 1;
                    }
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }

            match first_error {
                Some(err) => Err(err),
                None => Ok(result),
            }
        })
    }
}
