//! Download engine: cancellation, retry policy and the resumable fetch

mod control;
mod task;

pub use control::Control;
pub use task::Downloader;
#[cfg(test)]
pub use task::part_path;

use std::time::Duration;

/// Longest wait between two retries.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Cumulative progress of one download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl Progress {
    /// Fraction complete, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.downloaded as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Download cancelled")]
    Cancelled,

    /// Worth retrying; the part file is kept.
    #[error("{0}")]
    Transient(String),

    /// Not resumable; the part file is removed.
    #[error("{0}")]
    Fatal(String),
}

impl DownloadError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_builder() || err.is_redirect() {
            Self::Fatal(format!("request error: {err}"))
        } else {
            Self::Transient(format!("request error: {err}"))
        }
    }
}

/// How transient failures are retried within one job.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.max(Duration::from_millis(1));
        base.saturating_mul(1u32 << attempt.min(16)).min(MAX_BACKOFF)
    }
}

/// Extract a filename from a download URL
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string());
    Some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(12), MAX_BACKOFF);
    }

    #[test]
    fn filename_comes_from_last_path_segment() {
        assert_eq!(
            filename_from_url("https://cdn.example/roms/Super%20Mario%20World.sfc?x=1").as_deref(),
            Some("Super Mario World.sfc")
        );
        assert_eq!(filename_from_url("https://cdn.example/"), None);
        assert_eq!(filename_from_url("not a url"), None);
    }

    #[test]
    fn fraction_needs_a_total() {
        let p = Progress {
            downloaded: 50,
            total: Some(200),
        };
        assert_eq!(p.fraction(), Some(0.25));
        assert_eq!(
            Progress {
                downloaded: 50,
                total: None
            }
            .fraction(),
            None
        );
    }
}
