//! Per-job handle given to executors

use crate::db::{Database, JobStep, StepStatus};
use crate::download::Control;
use crate::events::{EventPublisher, JobEvent, JobEventType};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

/// Persists an event to the job's audit trail, then publishes it.
#[derive(Clone)]
pub(crate) struct EventSink {
    pub db: Database,
    pub publisher: Arc<dyn EventPublisher>,
}

impl EventSink {
    pub fn emit(&self, event: JobEvent) {
        if let Err(e) = self.db.append_event(&event) {
            warn!(job_id = %event.job_id, "failed to persist {} event: {}", event.kind.as_str(), e);
        }
        self.publisher.publish(event);
    }
}

/// Step reporting and control signals for one running job.
///
/// Every report becomes a persisted step row (where it carries progress) and
/// a published event.
pub struct JobContext {
    job_id: String,
    sink: EventSink,
    control: Control,
}

impl JobContext {
    pub(crate) fn new(job_id: String, sink: EventSink, control: Control) -> Self {
        Self {
            job_id,
            sink,
            control,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    fn event(&self, kind: JobEventType, step: &str) -> JobEvent {
        JobEvent::new(self.job_id.clone(), kind).with_step(step)
    }

    fn save_step(&self, step: &str, status: StepStatus, progress: f64, message: Option<&str>) {
        let row = JobStep {
            step: step.to_string(),
            status,
            progress: progress.clamp(0.0, 1.0),
            message: message.map(str::to_string),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.sink.db.upsert_step(&self.job_id, &row) {
            warn!(job_id = %self.job_id, step, "failed to persist step: {}", e);
        }
    }

    pub fn step_started(&self, step: &str) {
        self.save_step(step, StepStatus::Running, 0.0, None);
        self.sink
            .emit(self.event(JobEventType::StepStarted, step).with_progress(0.0));
    }

    /// Report progress of `step`. `fraction` is `None` when the total is unknown.
    pub fn progress(
        &self,
        step: &str,
        fraction: Option<f64>,
        bytes: Option<(u64, Option<u64>)>,
        message: Option<&str>,
    ) {
        let mut event = self.event(JobEventType::StepProgress, step);
        if let Some(fraction) = fraction {
            self.save_step(step, StepStatus::Running, fraction, message);
            event = event.with_progress(fraction);
        }
        if let Some((downloaded, total)) = bytes {
            event = event.with_bytes(downloaded, total);
        }
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.sink.emit(event);
    }

    pub fn log(&self, step: &str, message: impl Into<String>) {
        self.sink
            .emit(self.event(JobEventType::StepLog, step).with_message(message));
    }

    pub fn step_done(&self, step: &str, message: Option<&str>) {
        self.save_step(step, StepStatus::Done, 1.0, message);
        let mut event = self.event(JobEventType::StepDone, step).with_progress(1.0);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.sink.emit(event);
    }

    /// Mark `step` failed. The job's terminal event is left to the runner.
    pub fn step_failed(&self, step: &str, message: &str) {
        self.save_step(step, StepStatus::Failed, 0.0, Some(message));
        self.log(step, message);
    }
}
