use crate::error::AppError;
use crate::jobs::{JobArgs, JobCounts, JobRecord, JobStatus, JobTicket, SubmitError};
use crate::state::SharedState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use treescan_core::{syntax, ChunkRecord, FileFailure, ScanId, ScanRecord};
use uuid::Uuid;

const DEFAULT_SCAN_LIMIT: usize = 50;

// POST /jobs
#[derive(Deserialize)]
pub struct SubmitRequest {
    pub task: String,
    pub args: JobArgs,
}

pub async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<JobTicket>), AppError> {
    let ticket = state
        .jobs
        .submit(&req.task, req.args)
        .await
        .map_err(|err| match err {
            SubmitError::UnknownTask(_) => {
                AppError::bad_request("unknown_task", err.to_string(), "Supported tasks: scan_repo")
            }
            SubmitError::InvalidArgs(_) => AppError::bad_request(
                "invalid_args",
                err.to_string(),
                "Pass {\"args\": {\"repo_url\": \"...\"}}",
            ),
        })?;
    info!(job_id = %ticket.job_id, task = %req.task, "POST /jobs accepted");
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

// GET /jobs
pub async fn list_jobs(State(state): State<SharedState>) -> Json<Vec<JobRecord>> {
    Json(state.jobs.list().await)
}

// GET /jobs/{id}
pub async fn get_job(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobRecord>, AppError> {
    state
        .jobs
        .get(job_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("job"))
}

// POST /jobs/{id}/cancel
#[derive(Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

pub async fn cancel_job(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, AppError> {
    let status = state
        .jobs
        .cancel(job_id)
        .await
        .ok_or_else(|| AppError::not_found("job"))?;
    info!(%job_id, "POST /jobs/cancel");
    Ok(Json(CancelResponse {
        job_id,
        cancel_requested: !status.is_finished(),
        status,
    }))
}

// GET /scans
#[derive(Deserialize)]
pub struct ListScansParams {
    pub limit: Option<usize>,
}

pub async fn list_scans(
    State(state): State<SharedState>,
    Query(params): Query<ListScansParams>,
) -> Result<Json<Vec<ScanRecord>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_SCAN_LIMIT);
    state.with_db(move |db| db.list_scans(limit)).await.map(Json)
}

// GET /scans/{id}
#[derive(Serialize)]
pub struct ScanDetail {
    #[serde(flatten)]
    pub scan: ScanRecord,
    pub chunks: usize,
    pub failures: usize,
}

pub async fn get_scan(
    State(state): State<SharedState>,
    Path(scan_id): Path<ScanId>,
) -> Result<Json<ScanDetail>, AppError> {
    state
        .with_db(move |db| {
            Ok(ScanDetail {
                scan: db.get_scan(scan_id)?,
                chunks: db.count_chunks(scan_id)?,
                failures: db.list_failures(scan_id)?.len(),
            })
        })
        .await
        .map(Json)
}

// GET /scans/{id}/chunks
pub async fn list_chunks(
    State(state): State<SharedState>,
    Path(scan_id): Path<ScanId>,
) -> Result<Json<Vec<ChunkRecord>>, AppError> {
    state
        .with_db(move |db| {
            db.get_scan(scan_id)?;
            db.list_chunks(scan_id)
        })
        .await
        .map(Json)
}

// GET /scans/{id}/failures
pub async fn list_failures(
    State(state): State<SharedState>,
    Path(scan_id): Path<ScanId>,
) -> Result<Json<Vec<FileFailure>>, AppError> {
    state
        .with_db(move |db| {
            db.get_scan(scan_id)?;
            db.list_failures(scan_id)
        })
        .await
        .map(Json)
}

// GET /blobs/{hash}
pub async fn get_blob(
    State(state): State<SharedState>,
    Path(hash): Path<String>,
) -> Result<Response, AppError> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AppError::bad_request(
            "invalid_hash",
            format!("'{}' is not a SHA-256 hex digest", hash),
            "Use a file_sha256 value from /scans/{id}/chunks",
        ));
    }
    let store = state.store.clone();
    // syntax::encode does not recurse per tree level
    let body = tokio::task::spawn_blocking(move || -> treescan_core::Result<Vec<u8>> {
        let tree = store.load_tree(&hash.to_ascii_lowercase())?;
        syntax::encode(&tree)
    })
    .await
    .map_err(AppError::internal)?
    .map_err(AppError::from)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

// GET /status
#[derive(Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
    pub cache_backend: String,
    pub languages: Vec<String>,
    pub jobs: JobCounts,
}

pub async fn status(State(state): State<SharedState>) -> Json<ServiceStatus> {
    Json(ServiceStatus {
        service: "treescan-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        cache_backend: state.deps.cache.name().to_string(),
        languages: state
            .deps
            .registry
            .extensions()
            .into_iter()
            .map(String::from)
            .collect(),
        jobs: state.jobs.counts().await,
    })
}

