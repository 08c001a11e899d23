//! Background job runner. Callers get a ticket immediately; the scan runs on
//! a blocking thread and its outcome is polled by job id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};
use treescan_core::{CancelFlag, ScanDeps, ScanEngine, ScanError, ScanId, SourceTree};
use uuid::Uuid;

/// Named tasks a client may submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTask {
    ScanRepo,
}

impl JobTask {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScanRepo => "scan_repo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "scan_repo" => Some(Self::ScanRepo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobArgs {
    pub repo_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded { scan_id: ScanId },
    Failed { error: String },
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// Returned by [`JobRunner::submit`]
#[derive(Debug, Clone, Serialize)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub task: JobTask,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub task: JobTask,
    pub args: JobArgs,
    pub status: JobStatus,
    pub submitted_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
}

/// Job counts by state, for /status
#[derive(Debug, Default, Clone, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct JobEntry {
    record: JobRecord,
    cancel: CancelFlag,
    finished: Option<Instant>,
}

struct Inner {
    deps: ScanDeps,
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    permits: Arc<Semaphore>,
    retain_finished: usize,
}

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Clone `repo_url`, scan the working copy and return the scan id.
/// The working copy is removed when this returns, successful or not.
pub fn scan_repo(repo_url: &str, deps: ScanDeps, cancel: CancelFlag) -> treescan_core::Result<ScanId> {
    let tree = SourceTree::clone_repo(repo_url)?;
    let mut engine = ScanEngine::open(repo_url, deps)?.with_cancel(cancel);
    engine.run(tree.path())
}

impl JobRunner {
    pub fn new(deps: ScanDeps) -> Self {
        let concurrency = deps.config.jobs.concurrency.max(1);
        let retain_finished = deps.config.jobs.retain_finished.max(1);
        Self {
            inner: Arc::new(Inner {
                deps,
                jobs: RwLock::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(concurrency)),
                retain_finished,
            }),
        }
    }

    /// Queue a named task. Must be called from within a tokio runtime.
    pub async fn submit(&self, task: &str, args: JobArgs) -> Result<JobTicket, SubmitError> {
        let task = JobTask::from_name(task).ok_or_else(|| SubmitError::UnknownTask(task.to_string()))?;
        if args.repo_url.trim().is_empty() {
            return Err(SubmitError::InvalidArgs("repo_url is empty".to_string()));
        }

        let job_id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        let record = JobRecord {
            job_id,
            task,
            args: args.clone(),
            status: JobStatus::Queued,
            submitted_at: now_rfc3339(),
            finished_at: None,
        };
        self.inner.jobs.write().await.insert(
            job_id,
            JobEntry {
                record,
                cancel: cancel.clone(),
                finished: None,
            },
        );
        info!(%job_id, task = task.as_str(), repo_url = %args.repo_url, "job queued");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_job(inner, job_id, args, cancel).await;
        });

        Ok(JobTicket {
            job_id,
            task,
            status: JobStatus::Queued,
        })
    }

    pub async fn get(&self, job_id: Uuid) -> Option<JobRecord> {
        self.inner
            .jobs
            .read()
            .await
            .get(&job_id)
            .map(|entry| entry.record.clone())
    }

    /// All jobs, oldest first
    pub async fn list(&self) -> Vec<JobRecord> {
        let jobs = self.inner.jobs.read().await;
        let mut records: Vec<JobRecord> = jobs.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        records
    }

    /// Request cancellation. A running scan stops at its next batch boundary.
    pub async fn cancel(&self, job_id: Uuid) -> Option<JobStatus> {
        let jobs = self.inner.jobs.read().await;
        let entry = jobs.get(&job_id)?;
        if !entry.record.status.is_finished() {
            entry.cancel.cancel();
            info!(%job_id, "cancel requested");
        }
        Some(entry.record.status.clone())
    }

    pub async fn counts(&self) -> JobCounts {
        let jobs = self.inner.jobs.read().await;
        let mut counts = JobCounts::default();
        for entry in jobs.values() {
            match entry.record.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded { .. } => counts.succeeded += 1,
                JobStatus::Failed { .. } => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

async fn set_status(inner: &Inner, job_id: Uuid, status: JobStatus) {
    let mut jobs = inner.jobs.write().await;
    let finished = status.is_finished();
    if let Some(entry) = jobs.get_mut(&job_id) {
        if finished {
            entry.record.finished_at = Some(now_rfc3339());
            entry.finished = Some(Instant::now());
        }
        entry.record.status = status;
    }
    if finished {
        evict_finished(&mut jobs, inner.retain_finished);
    }
}

/// Forget the oldest finished jobs beyond `retain`. Queued and running jobs
/// are never evicted.
fn evict_finished(jobs: &mut HashMap<Uuid, JobEntry>, retain: usize) {
    let mut finished: Vec<(Instant, Uuid)> = jobs
        .iter()
        .filter_map(|(id, entry)| entry.finished.map(|at| (at, *id)))
        .collect();
    if finished.len() <= retain {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - retain;
    for (_, job_id) in finished.into_iter().take(excess) {
        jobs.remove(&job_id);
        debug!(%job_id, "finished job evicted");
    }
}

async fn run_job(inner: Arc<Inner>, job_id: Uuid, args: JobArgs, cancel: CancelFlag) {
    let _permit = match Arc::clone(&inner.permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(err) => {
            set_status(&inner, job_id, JobStatus::Failed { error: err.to_string() }).await;
            return;
        }
    };

    if cancel.is_cancelled() {
        set_status(&inner, job_id, JobStatus::Cancelled).await;
        return;
    }

    set_status(&inner, job_id, JobStatus::Running).await;
    info!(%job_id, repo_url = %args.repo_url, "job running");

    let deps = inner.deps.clone();
    let repo_url = args.repo_url.clone();
    let result = tokio::task::spawn_blocking(move || scan_repo(&repo_url, deps, cancel)).await;

    let status = match result {
        Ok(Ok(scan_id)) => {
            info!(%job_id, scan_id, "job succeeded");
            JobStatus::Succeeded { scan_id }
        }
        Ok(Err(ScanError::Cancelled)) => {
            info!(%job_id, "job cancelled");
            JobStatus::Cancelled
        }
        Ok(Err(err)) => {
            warn!(%job_id, error = %err, "job failed");
            JobStatus::Failed {
                error: err.to_string(),
            }
        }
        Err(join_err) => {
            warn!(%job_id, error = %join_err, "job panicked");
            JobStatus::Failed {
                error: format!("scan task failed: {}", join_err),
            }
        }
    };
    set_status(&inner, job_id, status).await;
}
