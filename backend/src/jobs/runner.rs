//! Job queue and scheduler

use super::context::{EventSink, JobContext};
use super::{ControlResponse, JobError, JobExecutor, JobOutcome};
use crate::db::{Database, Job, JobPayload, JobStatus};
use crate::download::Control;
use crate::events::{EventPublisher, JobEvent, JobEventType};
use crate::pipeline::{ErrorKind, PipelineError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// Message recorded on jobs cancelled before or during execution.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// Message recorded on jobs found unfinished at startup.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted by restart";

#[derive(Default)]
struct Queue {
    /// Job ids waiting for a slot, oldest first
    pending: VecDeque<String>,
    /// Running (or paused) jobs and their control handles
    active: HashMap<String, Control>,
}

struct Inner {
    db: Database,
    sink: EventSink,
    executor: Arc<dyn JobExecutor>,
    max_concurrent: usize,
    queue: Mutex<Queue>,
}

/// Schedules jobs FIFO up to a concurrency ceiling.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    pub fn new(
        db: Database,
        publisher: Arc<dyn EventPublisher>,
        executor: Arc<dyn JobExecutor>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: EventSink {
                    db: db.clone(),
                    publisher,
                },
                db,
                executor,
                max_concurrent: max_concurrent.max(1),
                queue: Mutex::new(Queue::default()),
            }),
        }
    }

    /// Validate, persist and enqueue a job.
    pub fn submit(&self, payload: JobPayload) -> Result<Job, JobError> {
        self.inner
            .executor
            .validate(&payload)
            .map_err(|e| JobError::Validation(e.to_string()))?;

        let job = Job::new(payload);
        self.inner.db.insert_job(&job)?;
        self.inner.sink.emit(
            JobEvent::new(job.id.clone(), JobEventType::JobCreated)
                .with_message(job.payload.preview()),
        );
        info!(job_id = %job.id, kind = job.kind.as_str(), "job queued");

        self.inner.queue.lock().pending.push_back(job.id.clone());
        self.pump();
        Ok(job)
    }

    /// Number of jobs currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.inner.queue.lock().active.len()
    }

    /// Fail jobs a previous process left unfinished and re-enqueue queued ones.
    pub fn recover_orphans(&self) -> anyhow::Result<()> {
        for status in [JobStatus::Running, JobStatus::Paused] {
            for job in self.inner.db.jobs_with_status(status)? {
                warn!(job_id = %job.id, "job was {} at shutdown; marking failed", status.as_str());
                self.inner.db.update_job_status(
                    &job.id,
                    JobStatus::Failed,
                    Some(INTERRUPTED_MESSAGE),
                    None,
                )?;
                self.inner.sink.emit(
                    JobEvent::new(job.id, JobEventType::JobFailed).with_message(INTERRUPTED_MESSAGE),
                );
            }
        }

        let queued = self.inner.db.jobs_with_status(JobStatus::Queued)?;
        if !queued.is_empty() {
            info!("re-enqueueing {} queued jobs", queued.len());
            let mut queue = self.inner.queue.lock();
            for job in queued {
                if !queue.pending.contains(&job.id) && !queue.active.contains_key(&job.id) {
                    queue.pending.push_back(job.id);
                }
            }
        }
        self.pump();
        Ok(())
    }

    /// Start queued jobs while slots are free.
    fn pump(&self) {
        loop {
            let (id, control) = {
                let mut queue = self.inner.queue.lock();
                if queue.active.len() >= self.inner.max_concurrent {
                    return;
                }
                let Some(id) = queue.pending.pop_front() else {
                    return;
                };
                let control = Control::default();
                queue.active.insert(id.clone(), control.clone());
                (id, control)
            };
            self.start(id, control);
        }
    }

    fn start(&self, id: String, control: Control) {
        let job = match self.inner.db.get_job(&id) {
            Ok(Some(job)) if job.status == JobStatus::Queued => job,
            Ok(_) => {
                // Finished or removed while waiting.
                self.inner.queue.lock().active.remove(&id);
                return;
            }
            Err(e) => {
                error!(job_id = %id, "failed to load job: {}", e);
                self.inner.queue.lock().active.remove(&id);
                return;
            }
        };

        if let Err(e) = self
            .inner
            .db
            .update_job_status(&id, JobStatus::Running, None, None)
        {
            error!(job_id = %id, "failed to mark job running: {}", e);
        }
        info!(job_id = %id, kind = job.kind.as_str(), "job started");

        let runner = self.clone();
        tokio::spawn(async move {
            let ctx = JobContext::new(id.clone(), runner.inner.sink.clone(), control);
            let executor = runner.inner.executor.clone();
            let payload = job.payload;

            // A panicking executor only takes down its own task.
            let result = tokio::spawn(async move { executor.execute(&payload, &ctx).await }).await;

            runner.finish(&id, result);
            runner.pump();
        });
    }

    fn finish(&self, id: &str, result: Result<Result<JobOutcome, PipelineError>, JoinError>) {
        let terminal = match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err((e.to_string(), e.kind())),
            Err(join) => {
                error!(job_id = %id, "job task aborted: {}", join);
                Err((format!("Internal error: {join}"), ErrorKind::Fatal))
            }
        };

        // The status write happens under the queue lock so pause/resume
        // cannot overwrite a terminal status.
        {
            let mut queue = self.inner.queue.lock();
            queue.active.remove(id);
            let write = match &terminal {
                Ok(outcome) => self.inner.db.update_job_status(
                    id,
                    JobStatus::Done,
                    None,
                    outcome.output_path.as_deref(),
                ),
                Err((message, _)) => {
                    self.inner
                        .db
                        .update_job_status(id, JobStatus::Failed, Some(message), None)
                }
            };
            if let Err(e) = write {
                error!(job_id = %id, "failed to record job result: {}", e);
            }
        }

        match terminal {
            Ok(outcome) => {
                let mut result = JobEvent::new(id, JobEventType::JobResult);
                if let Some(text) = outcome.output_path.or(outcome.message) {
                    result = result.with_message(text);
                }
                self.inner.sink.emit(result);
                self.inner
                    .sink
                    .emit(JobEvent::new(id, JobEventType::JobDone).with_progress(1.0));
                info!(job_id = %id, "job finished");
            }
            Err((message, kind)) => {
                if kind == ErrorKind::Cancelled {
                    info!(job_id = %id, "job cancelled");
                } else {
                    warn!(job_id = %id, ?kind, "job failed: {}", message);
                }
                self.inner
                    .sink
                    .emit(JobEvent::new(id, JobEventType::JobFailed).with_message(message));
            }
        }
    }

    fn status_of(&self, id: &str) -> Result<JobStatus, JobError> {
        self.inner
            .db
            .get_job(id)?
            .map(|job| job.status)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Cancel a queued job immediately, or ask a running one to stop.
    pub fn cancel(&self, id: &str) -> Result<ControlResponse, JobError> {
        let mut queue = self.inner.queue.lock();

        if let Some(pos) = queue.pending.iter().position(|p| p == id) {
            queue.pending.remove(pos);
            drop(queue);
            self.inner
                .db
                .update_job_status(id, JobStatus::Failed, Some(CANCELLED_MESSAGE), None)?;
            self.inner
                .sink
                .emit(JobEvent::new(id, JobEventType::JobFailed).with_message(CANCELLED_MESSAGE));
            info!(job_id = %id, "queued job cancelled");
            return Ok(ControlResponse::ok("Job cancelled"));
        }

        if let Some(control) = queue.active.get(id) {
            control.cancel.cancel();
            info!(job_id = %id, "cancellation requested");
            return Ok(ControlResponse::ok("Cancellation requested"));
        }
        drop(queue);

        let status = self.status_of(id)?;
        Err(JobError::InvalidTransition(format!(
            "Job is already {}",
            status.as_str()
        )))
    }

    pub fn pause(&self, id: &str) -> Result<ControlResponse, JobError> {
        self.transition(id, JobStatus::Running, JobStatus::Paused)
    }

    pub fn resume(&self, id: &str) -> Result<ControlResponse, JobError> {
        self.transition(id, JobStatus::Paused, JobStatus::Running)
    }

    fn transition(&self, id: &str, from: JobStatus, to: JobStatus) -> Result<ControlResponse, JobError> {
        let queue = self.inner.queue.lock();
        let status = self.status_of(id)?;

        let control = match queue.active.get(id) {
            Some(control) if status == from && status.can_transition_to(to) => control,
            _ => {
                return Err(JobError::InvalidTransition(format!(
                    "Cannot move a {} job to {}",
                    status.as_str(),
                    to.as_str()
                )))
            }
        };

        let message = if to == JobStatus::Paused {
            control.pause.pause();
            "Paused"
        } else {
            control.pause.resume();
            "Resumed"
        };
        self.inner.db.update_job_status(id, to, None, None)?;
        drop(queue);

        self.inner
            .sink
            .emit(JobEvent::new(id, JobEventType::StepLog).with_message(message));
        info!(job_id = %id, "job {}", message.to_lowercase());
        Ok(ControlResponse::ok(message))
    }
}
