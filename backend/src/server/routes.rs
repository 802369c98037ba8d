//! REST API routes

use crate::db::{DownloadPayload, JobPayload, LibraryItem, ScanPayload};
use crate::events::JobEvent;
use crate::jobs::{ControlResponse, JobError, JobSummary};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeJobs": state.runner.active_count(),
    }))
}

// ============ Job Endpoints ============

/// List all jobs, newest first
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<JobSummary>>, AppError> {
    let jobs = state.db.list_jobs()?;
    Ok(Json(jobs.into_iter().map(JobSummary::from).collect()))
}

/// Queue a download-and-install job
pub async fn submit_download(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DownloadPayload>,
) -> Result<(StatusCode, Json<JobSummary>), AppError> {
    let job = state.runner.submit(JobPayload::DownloadAndInstall(req))?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

/// Queue a library scan
pub async fn submit_scan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScanPayload>,
) -> Result<(StatusCode, Json<JobSummary>), AppError> {
    let job = state.runner.submit(JobPayload::Scan(req))?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

/// One job with its steps
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobSummary>, AppError> {
    let job = state
        .db
        .get_job(&id)?
        .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))?;
    Ok(Json(job.into()))
}

/// Persisted event history of one job
pub async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<JobEvent>>, AppError> {
    if state.db.get_job(&id)?.is_none() {
        return Err(AppError::NotFound(format!("Job {id} not found")));
    }
    Ok(Json(state.db.events_for_job(&id)?))
}

/// Invalid transitions still answer with the `{ok, message}` shape.
fn control_reply(result: Result<ControlResponse, JobError>) -> Result<Response, AppError> {
    match result {
        Ok(reply) => Ok(Json(reply).into_response()),
        Err(JobError::InvalidTransition(message)) => Ok((
            StatusCode::CONFLICT,
            Json(ControlResponse { ok: false, message }),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    control_reply(state.runner.cancel(&id))
}

pub async fn pause_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    control_reply(state.runner.pause(&id))
}

pub async fn resume_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    control_reply(state.runner.resume(&id))
}

// ============ Library Endpoints ============

pub async fn list_library(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<LibraryItem>>, AppError> {
    Ok(Json(state.db.list_library()?))
}

// ============ Error Handling ============

/// Application error type
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Internal(msg) => {
                error!("request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(_) | JobError::InvalidTransition(_) => {
                AppError::BadRequest(err.to_string())
            }
            JobError::NotFound(_) => AppError::NotFound(err.to_string()),
            JobError::Storage(e) => AppError::Internal(e.to_string()),
        }
    }
}
