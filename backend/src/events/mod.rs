//! Job event model and the in-process event bus
//!
//! Producers publish through the [`EventPublisher`] trait so the runner and
//! pipeline never depend on a concrete bus. The [`EventBus`] fans events out
//! over `tokio::broadcast` and keeps a bounded ring of recent events that a
//! reconnecting subscriber may replay.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, Receiver, Sender};

/// Sequence number assigned by the bus.
pub type EventSeq = u64;

/// Default size of the replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Kind of job notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventType {
    JobCreated,
    StepStarted,
    StepProgress,
    StepLog,
    StepDone,
    JobDone,
    JobFailed,
    JobResult,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "JOB_CREATED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepProgress => "STEP_PROGRESS",
            Self::StepLog => "STEP_LOG",
            Self::StepDone => "STEP_DONE",
            Self::JobDone => "JOB_DONE",
            Self::JobFailed => "JOB_FAILED",
            Self::JobResult => "JOB_RESULT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "JOB_CREATED" => Some(Self::JobCreated),
            "STEP_STARTED" => Some(Self::StepStarted),
            "STEP_PROGRESS" => Some(Self::StepProgress),
            "STEP_LOG" => Some(Self::StepLog),
            "STEP_DONE" => Some(Self::StepDone),
            "JOB_DONE" => Some(Self::JobDone),
            "JOB_FAILED" => Some(Self::JobFailed),
            "JOB_RESULT" => Some(Self::JobResult),
            _ => None,
        }
    }

    /// Whether this event ends the job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::JobDone | Self::JobFailed)
    }
}

/// Immutable notification about one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    #[serde(rename = "type")]
    pub kind: JobEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_downloaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub ts: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, kind: JobEventType) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            step: None,
            progress: None,
            message: None,
            bytes_downloaded: None,
            total_bytes: None,
            ts: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 1.0));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_bytes(mut self, downloaded: u64, total: Option<u64>) -> Self {
        self.bytes_downloaded = Some(downloaded);
        self.total_bytes = total;
        self
    }
}

/// Event plus the sequence number the bus assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub seq: EventSeq,
    pub event: JobEvent,
}

/// Sink for job events.
///
/// Publishing must never block on consumers.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// Broadcast bus with a bounded replay ring.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    ring: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_seq: Arc<AtomicU64>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose broadcast buffer and replay ring hold `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_seq: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    /// Publish and return the assigned sequence number.
    pub fn emit(&self, event: JobEvent) -> EventSeq {
        // Sequence assignment and ring insertion happen under one lock so the
        // ring and the broadcast channel see the same global order.
        let mut ring = self.ring.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope { seq, event };
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(envelope.clone());
        let _ = self.sender.send(envelope);
        seq
    }

    /// Attach a live subscriber without history.
    #[cfg(test)]
    pub fn subscribe(&self) -> EventStream {
        self.subscribe_with(Replay::None)
    }

    /// Attach a subscriber, optionally replaying part of the ring first.
    pub fn subscribe_with(&self, replay: Replay) -> EventStream {
        // Holding the ring lock while subscribing keeps backlog and live
        // stream from overlapping or leaving a gap.
        let ring = self.ring.lock();
        let backlog = match replay {
            Replay::None => VecDeque::new(),
            Replay::All => ring.iter().cloned().collect(),
            Replay::Since(seq) => ring.iter().filter(|e| e.seq > seq).cloned().collect(),
        };
        let receiver = self.sender.subscribe();
        EventStream { backlog, receiver }
    }

    /// Snapshot of the replay ring, oldest first.
    #[cfg(test)]
    pub fn recent(&self) -> Vec<EventEnvelope> {
        self.ring.lock().iter().cloned().collect()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: JobEvent) {
        self.emit(event);
    }
}

/// How much history a new subscriber sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    None,
    All,
    Since(EventSeq),
}

/// Replay backlog followed by the live broadcast.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }

        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged; dropping oldest events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Publisher that keeps every event in memory, for tests.
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MemoryCollector {
    events: Arc<Mutex<Vec<JobEvent>>>,
}

#[cfg(test)]
impl MemoryCollector {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().clone()
    }

    pub fn kinds_for(&self, job_id: &str) -> Vec<JobEventType> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.kind)
            .collect()
    }
}

#[cfg(test)]
impl EventPublisher for MemoryCollector {
    fn publish(&self, event: JobEvent) {
        self.events.lock().push(event);
    }
}
