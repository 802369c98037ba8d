//! Database schema types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "done" => Self::Done,
            // Unknown states are never resumed.
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Paused)
                | (Running, Done)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scan,
    DownloadAndInstall,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::DownloadAndInstall => "download_and_install",
        }
    }
}

/// What a download job should fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DownloadTarget {
    /// A known catalog entry
    Slug { slug: String },
    /// Free text resolved through the fuzzy matcher
    Query {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPayload {
    #[serde(flatten)]
    pub target: DownloadTarget,
    pub profile_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPayload {
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Job input, one variant per job kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    Scan(ScanPayload),
    DownloadAndInstall(DownloadPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Scan(_) => JobKind::Scan,
            Self::DownloadAndInstall(_) => JobKind::DownloadAndInstall,
        }
    }

    pub fn profile_id(&self) -> &str {
        match self {
            Self::Scan(p) => &p.profile_id,
            Self::DownloadAndInstall(p) => &p.profile_id,
        }
    }

    /// Short human-readable description for job listings.
    pub fn preview(&self) -> String {
        match self {
            Self::Scan(p) => match &p.platform {
                Some(platform) => format!("Scan {platform}"),
                None => "Scan library".to_string(),
            },
            Self::DownloadAndInstall(p) => match &p.target {
                DownloadTarget::Slug { slug } => slug.clone(),
                DownloadTarget::Query { query, .. } => format!("\"{query}\""),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "done" => Self::Done,
            _ => Self::Failed,
        }
    }
}

/// A named phase of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStep {
    pub step: String,
    pub status: StepStatus,
    pub progress: f64,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A job stored in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub payload: JobPayload,
    /// Failure or cancellation reason
    pub message: Option<String>,
    pub output_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<JobStep>,
}

impl Job {
    /// Create a new queued job
    pub fn new(payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: payload.kind(),
            status: JobStatus::Queued,
            payload,
            message: None,
            output_path: None,
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibrarySource {
    Local,
    Remote,
}

impl LibrarySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "remote" => Self::Remote,
            _ => Self::Local,
        }
    }
}

/// An installed or discovered file, unique by path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub hash: Option<String>,
    pub platform: Option<String>,
    pub game_slug: Option<String>,
    pub source: LibrarySource,
}
