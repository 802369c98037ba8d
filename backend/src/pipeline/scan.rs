//! Index files already present under a profile's platform roots

use super::{Pipeline, PipelineError, STEP_SCAN};
use crate::catalog::CatalogEntry;
use crate::db::{LibraryItem, LibrarySource, ScanPayload};
use crate::install;
use crate::jobs::{JobContext, JobOutcome};
use crate::matcher::{extract_core_name, find_best_matches, Candidate};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Regular files under `root`, skipping hidden entries and partial downloads.
fn collect_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().map_or(true, |ext| ext != "part"))
        .map(DirEntry::into_path)
        .collect()
}

impl Pipeline {
    pub async fn scan(
        &self,
        payload: &ScanPayload,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        let profile = self.profile(&payload.profile_id)?;
        let platforms: Vec<String> = match &payload.platform {
            Some(platform) => vec![platform.clone()],
            None => {
                let mut names: Vec<_> = profile.platforms.keys().cloned().collect();
                names.sort();
                names
            }
        };

        ctx.step_started(STEP_SCAN);
        if platforms.is_empty() {
            ctx.log(STEP_SCAN, "No platform roots configured");
        }

        let mut files = Vec::new();
        for platform in &platforms {
            let root = self.settings.platform_root(profile, platform);
            let found = tokio::task::spawn_blocking({
                let root = root.clone();
                move || collect_files(&root)
            })
            .await
            .map_err(|e| PipelineError::Storage(format!("scan of {} aborted: {e}", root.display())))?;
            debug!(platform = %platform, root = %root.display(), files = found.len(), "scanned root");
            files.extend(found.into_iter().map(|path| (platform.clone(), path)));
        }

        let mut catalogs: HashMap<String, Vec<CatalogEntry>> = HashMap::new();
        let total = files.len();
        let mut matched = 0;
        let control = ctx.control();

        for (index, (platform, path)) in files.iter().enumerate() {
            if !control.pause.wait_until_resumed(&control.cancel).await {
                return Err(PipelineError::Cancelled);
            }

            if !catalogs.contains_key(platform) {
                let entries = match self.catalog.candidates(Some(platform.as_str())).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(platform = %platform, "catalog unavailable during scan: {}", e);
                        ctx.log(STEP_SCAN, format!("Catalog unavailable for {platform}: {e}"));
                        Vec::new()
                    }
                };
                catalogs.insert(platform.clone(), entries);
            }
            let entries = catalogs.get(platform).map(Vec::as_slice).unwrap_or_default();

            let metadata = match tokio::fs::metadata(path).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable file: {}", e);
                    continue;
                }
            };
            let game_slug = self.identify(path, entries);
            if game_slug.is_some() {
                matched += 1;
            }
            let hash = if self.settings.hash_artifacts {
                install::hash_file(path).await.ok()
            } else {
                None
            };

            self.db
                .upsert_library_item(&LibraryItem {
                    path: path.display().to_string(),
                    size: metadata.len(),
                    mtime: metadata
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                    hash,
                    platform: Some(platform.clone()),
                    game_slug,
                    source: LibrarySource::Local,
                })
                .map_err(|e| PipelineError::Storage(e.to_string()))?;

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            ctx.progress(
                STEP_SCAN,
                Some((index + 1) as f64 / total as f64),
                None,
                Some(&name),
            );
        }

        let summary = format!("Indexed {total} files, {matched} matched");
        ctx.step_done(STEP_SCAN, Some(&summary));
        Ok(JobOutcome {
            output_path: None,
            message: Some(summary),
        })
    }

    /// Catalog slug of the best confident match for a file on disk.
    fn identify(&self, path: &Path, entries: &[CatalogEntry]) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let query = extract_core_name(name);
        let candidates: Vec<Candidate<'_>> = entries
            .iter()
            .map(|e| Candidate {
                title: &e.title,
                platform_match: true,
            })
            .collect();
        let best = find_best_matches(&query, &candidates, self.match_options())
            .into_iter()
            .next()?;
        entries.get(best.index).map(|e| e.slug.clone())
    }
}
