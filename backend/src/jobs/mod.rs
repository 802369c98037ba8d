//! Job lifecycle: submission, queueing, execution and control
//!
//! The runner knows nothing about what a job does. It hands each job's
//! payload to a [`JobExecutor`] together with a [`JobContext`], and turns
//! whatever comes back into the terminal status and events.

mod context;
mod runner;

pub use context::JobContext;
pub use runner::JobRunner;
#[cfg(test)]
pub use runner::CANCELLED_MESSAGE;

use crate::db::{Job, JobPayload};
use crate::pipeline::PipelineError;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// What a successful job produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    pub output_path: Option<String>,
    /// Reported instead of a path, e.g. when downloads are disabled
    pub message: Option<String>,
}

/// Runs the work behind one job kind.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Reject malformed payloads before anything is persisted.
    fn validate(&self, payload: &JobPayload) -> Result<(), PipelineError>;

    async fn execute(
        &self,
        payload: &JobPayload,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError>;
}

/// Reply to cancel/pause/resume requests
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponse {
    pub ok: bool,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }
}

/// Job plus a one-line description for listings
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    #[serde(flatten)]
    pub job: Job,
    pub preview: String,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        let preview = job.payload.preview();
        Self { job, preview }
    }
}
