//! Resumable streaming download of a single asset

use super::{Control, DownloadError, Progress, RetryPolicy};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Per-attempt bookkeeping; lives only as long as one fetch.
#[derive(Debug)]
struct DownloadState {
    url: String,
    destination: PathBuf,
    part_path: PathBuf,
    bytes_on_disk: u64,
    total: Option<u64>,
}

/// Result of a finished download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    /// Offset the final attempt continued from (0 for a fresh download)
    pub resumed_from: u64,
}

/// Path of the sidecar file holding in-progress bytes for `destination`.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Streams assets to disk, resuming from `.part` files when possible.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    progress_interval: Duration,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(client: reqwest::Client, progress_interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            client,
            progress_interval,
            retry,
        }
    }

    /// Download `url` to `destination`.
    ///
    /// Transient failures are retried per the retry policy and keep the part
    /// file; cancellation and fatal failures delete it.
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        expected_size: Option<u64>,
        control: &Control,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<DownloadOutcome, DownloadError> {
        let mut state = DownloadState {
            url: url.to_string(),
            destination: destination.to_path_buf(),
            part_path: part_path(destination),
            bytes_on_disk: 0,
            total: expected_size,
        };

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::Fatal(format!("cannot create {}: {e}", parent.display())))?;
        }

        let mut attempt = 0;
        loop {
            let result = self.attempt(&mut state, control, on_progress).await;
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(DownloadError::Transient(message)) if attempt < self.retry.attempts => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt - 1);
                    warn!(
                        url = %state.url,
                        attempt,
                        bytes_on_disk = state.bytes_on_disk,
                        "transient download error, retrying in {:?}: {}",
                        delay,
                        message
                    );
                    tokio::select! {
                        biased;
                        _ = control.cancel.cancelled() => {
                            remove_part(&state.part_path).await;
                            return Err(DownloadError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err @ DownloadError::Transient(_)) => {
                    info!(
                        part = %state.part_path.display(),
                        bytes_on_disk = state.bytes_on_disk,
                        "keeping partial download for a later resume"
                    );
                    return Err(err);
                }
                Err(err) => {
                    remove_part(&state.part_path).await;
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        state: &mut DownloadState,
        control: &Control,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<DownloadOutcome, DownloadError> {
        let mut restarted = false;
        loop {
            if control.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            state.bytes_on_disk = existing_len(&state.part_path).await?;
            let offset = state.bytes_on_disk;

            let mut request = self.client.get(&state.url);
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }

            let response = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => return Err(DownloadError::Cancelled),
                response = request.send() => response.map_err(DownloadError::from_reqwest)?,
            };

            let status = response.status();
            let append = match status {
                StatusCode::PARTIAL_CONTENT => {
                    let range = response
                        .headers()
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_content_range);
                    let Some(range) = range else {
                        return Err(DownloadError::Fatal(
                            "partial response without a usable Content-Range".into(),
                        ));
                    };
                    if range.start != offset {
                        return Err(DownloadError::Fatal(format!(
                            "server resumed at byte {} but {offset} bytes are on disk",
                            range.start
                        )));
                    }
                    if range.total.is_some() {
                        state.total = range.total;
                    }
                    if offset > 0 {
                        info!(url = %state.url, offset, "resuming partial download");
                    }
                    true
                }
                StatusCode::OK => {
                    if offset > 0 {
                        info!(
                            url = %state.url,
                            offset,
                            "server ignored range request, restarting from zero"
                        );
                        state.bytes_on_disk = 0;
                    }
                    state.total = response.content_length().or(state.total);
                    false
                }
                StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                    let total = response
                        .headers()
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_unsatisfied_total);
                    if total == Some(offset) {
                        debug!(url = %state.url, "part file already holds the whole asset");
                        return self.finish(state, offset, on_progress).await;
                    }
                    if restarted {
                        return Err(DownloadError::Fatal(
                            "server rejected the range request twice".into(),
                        ));
                    }
                    info!(url = %state.url, offset, "range not satisfiable, restarting from zero");
                    remove_part(&state.part_path).await;
                    restarted = true;
                    continue;
                }
                s if is_retryable_status(s) => {
                    return Err(DownloadError::Transient(format!("HTTP error: {s}")));
                }
                s => return Err(DownloadError::Fatal(format!("HTTP error: {s}"))),
            };

            let mut file = if append {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&state.part_path)
                    .await
                    .map_err(|e| io_fatal(&state.part_path, e))?
            } else {
                File::create(&state.part_path)
                    .await
                    .map_err(|e| io_fatal(&state.part_path, e))?
            };

            let mut written = if append { offset } else { 0 };
            let mut stream = response.bytes_stream();
            let mut last_progress = Instant::now();
            on_progress(Progress {
                downloaded: written,
                total: state.total,
            });

            loop {
                if !control.pause.wait_until_resumed(&control.cancel).await {
                    drop(file);
                    return Err(DownloadError::Cancelled);
                }

                tokio::select! {
                    biased;
                    _ = control.cancel.cancelled() => {
                        drop(file);
                        return Err(DownloadError::Cancelled);
                    }
                    chunk = stream.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                file.write_all(&bytes)
                                    .await
                                    .map_err(|e| io_fatal(&state.part_path, e))?;
                                written += bytes.len() as u64;
                                state.bytes_on_disk = written;

                                if last_progress.elapsed() >= self.progress_interval {
                                    on_progress(Progress { downloaded: written, total: state.total });
                                    last_progress = Instant::now();
                                }
                            }
                            Some(Err(e)) => {
                                // Whatever reached the file stays there for a resume.
                                let _ = file.flush().await;
                                return Err(DownloadError::Transient(format!("Download error: {e}")));
                            }
                            None => break,
                        }
                    }
                }
            }

            file.flush()
                .await
                .map_err(|e| io_fatal(&state.part_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| io_fatal(&state.part_path, e))?;
            drop(file);

            if let Some(total) = state.total {
                if written < total {
                    return Err(DownloadError::Transient(format!(
                        "stream ended after {written} of {total} bytes"
                    )));
                }
            }

            return self
                .finish(state, if append { offset } else { 0 }, on_progress)
                .await;
        }
    }

    async fn finish(
        &self,
        state: &DownloadState,
        resumed_from: u64,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<DownloadOutcome, DownloadError> {
        let bytes = existing_len(&state.part_path).await?;
        fs::rename(&state.part_path, &state.destination)
            .await
            .map_err(|e| io_fatal(&state.destination, e))?;
        on_progress(Progress {
            downloaded: bytes,
            total: Some(bytes),
        });
        info!(
            url = %state.url,
            destination = %state.destination.display(),
            bytes,
            "download complete"
        );
        Ok(DownloadOutcome {
            path: state.destination.clone(),
            bytes,
            resumed_from,
        })
    }
}

async fn existing_len(path: &Path) -> Result<u64, DownloadError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(io_fatal(path, e)),
    }
}

async fn remove_part(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(part = %path.display(), "removed partial download"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(part = %path.display(), "failed to remove partial download: {}", e),
    }
}

fn io_fatal(path: &Path, err: std::io::Error) -> DownloadError {
    DownloadError::Fatal(format!("{}: {err}", path.display()))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    total: Option<u64>,
}

/// Parse `bytes start-end/total` (total may be `*`).
fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, _end) = span.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange { start, total })
}

/// Parse the `bytes */total` form sent with 416 responses.
fn parse_unsatisfied_total(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes")?
        .trim_start()
        .strip_prefix("*/")?
        .trim()
        .parse()
        .ok()
}
