//! Resolve, download and install one catalog entry

use super::{
    link_filename, Pipeline, PipelineError, DOWNLOADS_DISABLED, STEP_DOWNLOAD, STEP_INSTALL,
    STEP_RESOLVE,
};
use crate::catalog::{CatalogEntry, CatalogLink};
use crate::config::Profile;
use crate::db::{DownloadPayload, DownloadTarget, LibraryItem, LibrarySource};
use crate::download::Progress;
use crate::install::{self, destination_path, manifest, Artifact, InstallError};
use crate::jobs::{JobContext, JobOutcome};
use crate::matcher::{find_best_matches, Candidate};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marks `step` failed before the error propagates to the runner.
fn fail<'a>(ctx: &'a JobContext, step: &'a str) -> impl Fn(&PipelineError) + 'a {
    move |e| ctx.step_failed(step, &e.to_string())
}

impl Pipeline {
    pub async fn download_and_install(
        &self,
        payload: &DownloadPayload,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        if !self.settings.downloads_enabled {
            info!(job_id = %ctx.job_id(), "downloads disabled; skipping job");
            return Ok(JobOutcome {
                output_path: None,
                message: Some(DOWNLOADS_DISABLED.to_string()),
            });
        }
        let profile = self.profile(&payload.profile_id)?;

        ctx.step_started(STEP_RESOLVE);
        let entry = self
            .resolve(&payload.target, ctx)
            .await
            .inspect_err(fail(ctx, STEP_RESOLVE))?;
        let (link, destination) = self
            .plan(&entry, profile)
            .inspect_err(fail(ctx, STEP_RESOLVE))?;
        ctx.step_done(
            STEP_RESOLVE,
            Some(&format!("{} -> {}", entry.title, destination.display())),
        );

        if ctx.control().cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        ctx.step_started(STEP_DOWNLOAD);
        let on_progress = |p: Progress| {
            ctx.progress(STEP_DOWNLOAD, p.fraction(), Some((p.downloaded, p.total)), None)
        };
        let outcome = self
            .downloader
            .fetch(&link.url, &destination, link.size, ctx.control(), &on_progress)
            .await
            .map_err(PipelineError::from)
            .inspect_err(fail(ctx, STEP_DOWNLOAD))?;
        if outcome.resumed_from > 0 {
            ctx.log(
                STEP_DOWNLOAD,
                format!("Resumed from byte {}", outcome.resumed_from),
            );
        }
        ctx.step_done(STEP_DOWNLOAD, None);

        ctx.step_started(STEP_INSTALL);
        self.install(&entry, &payload.profile_id, &outcome.path)
            .await
            .inspect_err(fail(ctx, STEP_INSTALL))?;
        ctx.progress(STEP_INSTALL, Some(1.0), None, Some("Complete"));
        ctx.step_done(STEP_INSTALL, Some("Complete"));

        Ok(JobOutcome {
            output_path: Some(outcome.path.display().to_string()),
            message: None,
        })
    }

    async fn resolve(
        &self,
        target: &DownloadTarget,
        ctx: &JobContext,
    ) -> Result<CatalogEntry, PipelineError> {
        match target {
            DownloadTarget::Slug { slug } => self
                .catalog
                .get_entry(slug)
                .await?
                .ok_or_else(|| PipelineError::NotFound(slug.clone())),
            DownloadTarget::Query { query, platform } => {
                let entries = self.catalog.candidates(platform.as_deref()).await?;
                let best = {
                    let candidates: Vec<Candidate<'_>> = entries
                        .iter()
                        .map(|e| Candidate {
                            title: &e.title,
                            platform_match: platform
                                .as_deref()
                                .is_some_and(|p| e.platform.eq_ignore_ascii_case(p)),
                        })
                        .collect();
                    find_best_matches(query, &candidates, self.match_options())
                        .into_iter()
                        .next()
                        .ok_or_else(|| PipelineError::NoMatch(query.clone()))?
                };
                debug!(query = %query, title = %best.title, score = best.score, "query resolved");
                ctx.log(
                    STEP_RESOLVE,
                    format!("Matched {:?} with score {:.2}", best.title, best.score),
                );

                entries
                    .into_iter()
                    .nth(best.index)
                    .ok_or_else(|| PipelineError::NoMatch(query.clone()))
            }
        }
    }

    /// Pick the link and compute the final path; nothing touches disk or network.
    fn plan(
        &self,
        entry: &CatalogEntry,
        profile: &Profile,
    ) -> Result<(CatalogLink, PathBuf), PipelineError> {
        let link = self.links.select(&entry.links).ok_or_else(|| {
            PipelineError::Validation(format!("{} has no download links", entry.slug))
        })?;

        let filename = link_filename(link).unwrap_or_else(|| entry.slug.clone());
        let extension = Path::new(&filename)
            .extension()
            .and_then(|ext| ext.to_str());

        let root = self.settings.platform_root(profile, &entry.platform);
        let template = profile.template_for(&entry.platform);
        let destination = destination_path(&root, template, entry, extension)?;
        Ok((link.clone(), destination))
    }

    async fn install(
        &self,
        entry: &CatalogEntry,
        profile_id: &str,
        path: &Path,
    ) -> Result<(), PipelineError> {
        let metadata = tokio::fs::metadata(path).await.map_err(InstallError::from)?;
        let hash = if self.settings.hash_artifacts {
            Some(install::hash_file(path).await?)
        } else {
            None
        };

        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(InstallError::InvalidPath(path.display().to_string()).into());
        };
        manifest::write_or_merge(
            dir,
            entry,
            profile_id,
            vec![Artifact {
                path: name.to_string_lossy().into_owned(),
                size: metadata.len(),
                hash: hash.clone(),
                slug: Some(entry.slug.clone()),
            }],
        )
        .await?;

        let mtime = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        self.db
            .upsert_library_item(&LibraryItem {
                path: path.display().to_string(),
                size: metadata.len(),
                mtime,
                hash,
                platform: Some(entry.platform.clone()),
                game_slug: Some(entry.slug.clone()),
                source: LibrarySource::Remote,
            })
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        info!(path = %path.display(), slug = %entry.slug, "installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::{CatalogEntry, CatalogLink, StaticCatalog};
    use crate::config::{PlatformConfig, Profile, Settings};
    use crate::db::{
        Database, DownloadPayload, DownloadTarget, JobPayload, JobStatus, LibrarySource,
    };
    use crate::download::{part_path, Downloader, RetryPolicy};
    use crate::events::{JobEventType, MemoryCollector};
    use crate::install::manifest;
    use crate::jobs::{JobExecutor, JobRunner};
    use crate::pipeline::{Pipeline, DOWNLOADS_DISABLED};
    use crate::test_support::{AssetServer, ServeMode};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn asset(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn entry(slug: &str, title: &str, url: String) -> CatalogEntry {
        CatalogEntry {
            slug: slug.into(),
            title: title.into(),
            platform: "snes".into(),
            regions: vec!["USA".into()],
            links: vec![CatalogLink {
                url,
                filename: None,
                size: None,
                host: None,
            }],
        }
    }

    fn settings(root: &Path, template: &str) -> Settings {
        let mut settings = Settings::default();
        settings.download_dir = root.join("staging");
        settings.retry.attempts = 0;
        settings.progress_interval_ms = 0;
        let mut profile = Profile::default();
        profile.naming_template = template.into();
        profile.platforms.insert(
            "snes".into(),
            PlatformConfig {
                root: root.join("snes"),
                naming_template: None,
            },
        );
        settings.profiles.insert("default".into(), profile);
        settings
    }

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        db: Database,
        events: MemoryCollector,
        runner: JobRunner,
    }

    fn harness(entries: Vec<CatalogEntry>, tweak: impl FnOnce(&mut Settings)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let mut settings = settings(&root, "{Title} ({Region})");
        tweak(&mut settings);

        let db = Database::open_in_memory().unwrap();
        let events = MemoryCollector::default();
        let downloader = Downloader::new(
            reqwest::Client::new(),
            Duration::ZERO,
            RetryPolicy {
                attempts: settings.retry.attempts,
                backoff: Duration::from_millis(10),
            },
        );
        let pipeline = Pipeline::new(
            Arc::new(settings),
            Arc::new(StaticCatalog::new(entries)),
            downloader,
            db.clone(),
        );
        let executor: Arc<dyn JobExecutor> = Arc::new(pipeline);
        let runner = JobRunner::new(db.clone(), Arc::new(events.clone()), executor, 2);
        Harness {
            _dir: dir,
            root,
            db,
            events,
            runner,
        }
    }

    fn by_slug(slug: &str) -> JobPayload {
        JobPayload::DownloadAndInstall(DownloadPayload {
            target: DownloadTarget::Slug { slug: slug.into() },
            profile_id: "default".into(),
        })
    }

    async fn wait_terminal(db: &Database, id: &str) -> JobStatus {
        for _ in 0..500 {
            let status = db.get_job(id).unwrap().unwrap().status;
            if status.is_terminal() {
                // Terminal events follow the status write.
                tokio::time::sleep(Duration::from_millis(20)).await;
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn installs_file_with_manifest_and_library_record() {
        let data = asset(50_000);
        let server = AssetServer::start(data.clone(), ServeMode::Ranged).await;
        let h = harness(
            vec![entry("smw", "Super Mario World", server.url_for("smw.sfc"))],
            |_| {},
        );

        let job = h.runner.submit(by_slug("smw")).unwrap();
        assert_eq!(wait_terminal(&h.db, &job.id).await, JobStatus::Done);

        let installed = h.root.join("snes").join("Super Mario World (USA).sfc");
        assert_eq!(std::fs::read(&installed).unwrap(), data);
        assert!(!part_path(&installed).exists());

        let stored = h.db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.output_path, Some(installed.display().to_string()));
        assert_eq!(stored.steps.len(), 3);

        let manifest = manifest::load(&h.root.join("snes")).await.unwrap().unwrap();
        assert_eq!(manifest.slug, "smw");
        assert_eq!(manifest.artifacts.len(), 1);
        assert_eq!(manifest.artifacts[0].path, "Super Mario World (USA).sfc");
        assert_eq!(manifest.artifacts[0].size, 50_000);
        assert!(manifest.artifacts[0].hash.is_some());

        let item = h
            .db
            .get_library_item(&installed.display().to_string())
            .unwrap()
            .unwrap();
        assert_eq!(item.source, LibrarySource::Remote);
        assert_eq!(item.game_slug.as_deref(), Some("smw"));

        let kinds = h.events.kinds_for(&job.id);
        assert_eq!(kinds.first(), Some(&JobEventType::JobCreated));
        assert_eq!(kinds[kinds.len() - 2], JobEventType::JobResult);
        assert_eq!(kinds.last(), Some(&JobEventType::JobDone));
        assert_eq!(kinds.iter().filter(|k| **k == JobEventType::JobDone).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == JobEventType::JobResult).count(), 1);

        let download_events: Vec<_> = h
            .events
            .events()
            .into_iter()
            .filter(|e| e.job_id == job.id && e.step.as_deref() == Some("download"))
            .map(|e| e.kind)
            .collect();
        assert_eq!(download_events.first(), Some(&JobEventType::StepStarted));
        assert_eq!(download_events.last(), Some(&JobEventType::StepDone));
        assert!(download_events.contains(&JobEventType::StepProgress));

        let complete = h
            .events
            .events()
            .into_iter()
            .find(|e| e.job_id == job.id && e.message.as_deref() == Some("Complete"))
            .unwrap();
        assert_eq!(complete.progress, Some(1.0));
    }

    #[tokio::test]
    async fn free_text_query_resolves_through_matcher() {
        let server = AssetServer::start(asset(1_000), ServeMode::Ranged).await;
        let h = harness(
            vec![
                entry("zelda", "The Legend of Zelda: A Link to the Past", server.url_for("z.sfc")),
                entry("smw", "Super Mario World", server.url_for("smw.sfc")),
            ],
            |_| {},
        );

        let job = h
            .runner
            .submit(JobPayload::DownloadAndInstall(DownloadPayload {
                target: DownloadTarget::Query {
                    query: "SMW".into(),
                    platform: Some("snes".into()),
                },
                profile_id: "default".into(),
            }))
            .unwrap();
        assert_eq!(wait_terminal(&h.db, &job.id).await, JobStatus::Done);
        assert!(h.root.join("snes/Super Mario World (USA).sfc").exists());
    }

    #[tokio::test]
    async fn unmatched_query_fails_without_touching_disk() {
        let server = AssetServer::start(asset(10), ServeMode::Ranged).await;
        let h = harness(vec![entry("smw", "Super Mario World", server.url())], |_| {});

        let job = h
            .runner
            .submit(JobPayload::DownloadAndInstall(DownloadPayload {
                target: DownloadTarget::Query {
                    query: "qwxz plorb".into(),
                    platform: None,
                },
                profile_id: "default".into(),
            }))
            .unwrap();
        assert_eq!(wait_terminal(&h.db, &job.id).await, JobStatus::Failed);
        let message = h.db.get_job(&job.id).unwrap().unwrap().message.unwrap();
        assert!(message.contains("no confident match"), "{message}");
        assert_eq!(server.hits(), 0);
        assert!(!h.root.join("snes").exists());
    }

    #[tokio::test]
    async fn escaping_template_fails_before_any_request() {
        let server = AssetServer::start(asset(10), ServeMode::Ranged).await;
        let h = harness(vec![entry("smw", "Super Mario World", server.url())], |s| {
            s.profiles.get_mut("default").unwrap().naming_template = "../{Title}".into();
        });

        let job = h.runner.submit(by_slug("smw")).unwrap();
        assert_eq!(wait_terminal(&h.db, &job.id).await, JobStatus::Failed);
        assert_eq!(server.hits(), 0);
    }

    #[tokio::test]
    async fn disabled_downloads_skip_the_whole_pipeline() {
        let server = AssetServer::start(asset(10), ServeMode::Ranged).await;
        let h = harness(vec![entry("smw", "Super Mario World", server.url())], |s| {
            s.downloads_enabled = false;
        });

        let job = h.runner.submit(by_slug("smw")).unwrap();
        assert_eq!(wait_terminal(&h.db, &job.id).await, JobStatus::Done);
        assert_eq!(server.hits(), 0);
        assert!(!h.root.join("snes").exists());

        let stored = h.db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.output_path, None);
        assert_eq!(
            h.events.kinds_for(&job.id),
            vec![
                JobEventType::JobCreated,
                JobEventType::JobResult,
                JobEventType::JobDone
            ]
        );
        let result = h
            .events
            .events()
            .into_iter()
            .find(|e| e.kind == JobEventType::JobResult)
            .unwrap();
        assert_eq!(result.message.as_deref(), Some(DOWNLOADS_DISABLED));
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_part_manifest_or_library_item() {
        let server = AssetServer::start(asset(100_000), ServeMode::StallAfter(4_096)).await;
        let h = harness(
            vec![entry("smw", "Super Mario World", server.url_for("smw.sfc"))],
            |_| {},
        );

        let job = h.runner.submit(by_slug("smw")).unwrap();
        let destination = h.root.join("snes").join("Super Mario World (USA).sfc");
        for _ in 0..500 {
            if part_path(&destination).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.runner.cancel(&job.id).unwrap().ok);
        assert_eq!(wait_terminal(&h.db, &job.id).await, JobStatus::Failed);

        assert!(!part_path(&destination).exists());
        assert!(!destination.exists());
        assert!(manifest::load(&h.root.join("snes")).await.unwrap().is_none());
        assert!(h.db.list_library().unwrap().is_empty());

        let failed = h
            .events
            .events()
            .into_iter()
            .find(|e| e.job_id == job.id && e.kind == JobEventType::JobFailed)
            .unwrap();
        assert_eq!(failed.message.as_deref(), Some(crate::jobs::CANCELLED_MESSAGE));
    }

    #[tokio::test]
    async fn reinstall_into_same_directory_merges_manifest() {
        let server = AssetServer::start(asset(2_000), ServeMode::Ranged).await;
        let h = harness(
            vec![
                entry("smw", "Super Mario World", server.url_for("smw.sfc")),
                entry("smk", "Super Mario Kart", server.url_for("smk.sfc")),
            ],
            |_| {},
        );

        for slug in ["smw", "smk", "smw"] {
            let job = h.runner.submit(by_slug(slug)).unwrap();
            assert_eq!(wait_terminal(&h.db, &job.id).await, JobStatus::Done);
        }

        let manifest = manifest::load(&h.root.join("snes")).await.unwrap().unwrap();
        let mut paths: Vec<_> = manifest.artifacts.iter().map(|a| a.path.as_str()).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["Super Mario Kart (USA).sfc", "Super Mario World (USA).sfc"]
        );
        assert_eq!(h.db.list_library().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_installs_share_one_manifest() {
        let server = AssetServer::start(asset(20_000), ServeMode::Ranged).await;
        let titles = [
            ("smw", "Super Mario World"),
            ("smk", "Super Mario Kart"),
            ("ct", "Chrono Trigger"),
            ("eb", "EarthBound"),
        ];
        let h = harness(
            titles
                .iter()
                .map(|(slug, title)| entry(slug, title, server.url_for(&format!("{slug}.sfc"))))
                .collect(),
            |_| {},
        );

        let jobs: Vec<_> = titles
            .iter()
            .map(|(slug, _)| h.runner.submit(by_slug(slug)).unwrap())
            .collect();
        for job in &jobs {
            assert_eq!(wait_terminal(&h.db, &job.id).await, JobStatus::Done);
        }

        let manifest = manifest::load(&h.root.join("snes")).await.unwrap().unwrap();
        let mut slugs: Vec<_> = manifest
            .artifacts
            .iter()
            .filter_map(|a| a.slug.as_deref())
            .collect();
        slugs.sort();
        assert_eq!(slugs, vec!["ct", "eb", "smk", "smw"]);
    }

    #[tokio::test]
    async fn transient_failure_keeps_part_for_resubmission() {
        let data = asset(40_000);
        let server = AssetServer::start(data.clone(), ServeMode::CutAfter(15_000)).await;
        let h = harness(
            vec![entry("smw", "Super Mario World", server.url_for("smw.sfc"))],
            |_| {},
        );
        let destination = h.root.join("snes").join("Super Mario World (USA).sfc");

        let first = h.runner.submit(by_slug("smw")).unwrap();
        assert_eq!(wait_terminal(&h.db, &first.id).await, JobStatus::Failed);
        assert!(part_path(&destination).exists());

        server.set_mode(ServeMode::Ranged);
        let second = h.runner.submit(by_slug("smw")).unwrap();
        assert_eq!(wait_terminal(&h.db, &second.id).await, JobStatus::Done);
        assert_eq!(std::fs::read(&destination).unwrap(), data);
        assert!(server.last_range().is_some());
    }
}
