//! Job functions: download-and-install and library scan

mod install;
mod scan;

use crate::catalog::{Catalog, CatalogError, CatalogLink};
use crate::config::{Profile, Settings};
use crate::db::{Database, DownloadTarget, JobPayload};
use crate::download::{filename_from_url, DownloadError, Downloader};
use crate::install::{check_template, InstallError};
use crate::jobs::{JobContext, JobExecutor, JobOutcome};
use crate::matcher::MatchOptions;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub const STEP_RESOLVE: &str = "resolve";
pub const STEP_DOWNLOAD: &str = "download";
pub const STEP_INSTALL: &str = "install";
pub const STEP_SCAN: &str = "scan";

/// Reported by download jobs that hit the global switch.
pub const DOWNLOADS_DISABLED: &str = "Downloads are disabled";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("catalog entry not found: {0}")]
    NotFound(String),

    #[error("no confident match for {0:?}")]
    NoMatch(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("{0}")]
    Validation(String),

    #[error("download failed: {0}")]
    Download(DownloadError),

    #[error("install failed: {0}")]
    Install(#[from] InstallError),

    #[error("library update failed: {0}")]
    Storage(String),

    #[error("Cancelled by user")]
    Cancelled,
}

/// Failure classes callers render differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resolution,
    Transient,
    Fatal,
    Validation,
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::NoMatch(_) | Self::Catalog(_) => ErrorKind::Resolution,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Download(DownloadError::Transient(_)) => ErrorKind::Transient,
            Self::Download(_) | Self::Storage(_) => ErrorKind::Fatal,
            Self::Install(InstallError::InvalidTemplate(_) | InstallError::InvalidPath(_)) => {
                ErrorKind::Validation
            }
            Self::Install(_) => ErrorKind::Fatal,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<DownloadError> for PipelineError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Cancelled => Self::Cancelled,
            other => Self::Download(other),
        }
    }
}

/// Picks which of an entry's links to download.
pub trait LinkSelector: Send + Sync {
    fn select<'a>(&self, links: &'a [CatalogLink]) -> Option<&'a CatalogLink>;
}

/// First link whose file name carries an extension, else the first link.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferTypedLink;

impl LinkSelector for PreferTypedLink {
    fn select<'a>(&self, links: &'a [CatalogLink]) -> Option<&'a CatalogLink> {
        links
            .iter()
            .find(|link| {
                link_filename(link)
                    .map(|name| Path::new(&name).extension().is_some())
                    .unwrap_or(false)
            })
            .or_else(|| links.first())
    }
}

/// Declared file name of a link, or the one its URL implies.
fn link_filename(link: &CatalogLink) -> Option<String> {
    link.filename
        .clone()
        .filter(|name| !name.trim().is_empty())
        .or_else(|| filename_from_url(&link.url))
}

/// Runs download and scan jobs against a catalog, the filesystem and the library.
pub struct Pipeline {
    settings: Arc<Settings>,
    catalog: Arc<dyn Catalog>,
    downloader: Downloader,
    db: Database,
    links: Box<dyn LinkSelector>,
}

impl Pipeline {
    pub fn new(
        settings: Arc<Settings>,
        catalog: Arc<dyn Catalog>,
        downloader: Downloader,
        db: Database,
    ) -> Self {
        Self {
            settings,
            catalog,
            downloader,
            db,
            links: Box::new(PreferTypedLink),
        }
    }

    pub fn with_link_selector(mut self, selector: impl LinkSelector + 'static) -> Self {
        self.links = Box::new(selector);
        self
    }

    fn profile(&self, id: &str) -> Result<&Profile, PipelineError> {
        self.settings
            .profile(id)
            .ok_or_else(|| PipelineError::Validation(format!("unknown profile {id:?}")))
    }

    fn match_options(&self) -> MatchOptions {
        MatchOptions {
            min_score: self.settings.matching.min_score,
            max_results: self.settings.matching.max_results,
        }
    }
}

#[async_trait]
impl JobExecutor for Pipeline {
    fn validate(&self, payload: &JobPayload) -> Result<(), PipelineError> {
        let profile = self.profile(payload.profile_id())?;
        if let JobPayload::DownloadAndInstall(p) = payload {
            // The platform is only known after resolution, so every template
            // the profile could pick has to be well formed.
            check_template(&profile.naming_template)?;
            for platform in profile.platforms.values() {
                if let Some(template) = &platform.naming_template {
                    check_template(template)?;
                }
            }

            let empty = match &p.target {
                DownloadTarget::Slug { slug } => slug.trim().is_empty(),
                DownloadTarget::Query { query, .. } => query.trim().is_empty(),
            };
            if empty {
                return Err(PipelineError::Validation(
                    "a slug or a non-empty query is required".into(),
                ));
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        payload: &JobPayload,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        match payload {
            JobPayload::DownloadAndInstall(p) => self.download_and_install(p, ctx).await,
            JobPayload::Scan(p) => self.scan(p, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(url: &str, filename: Option<&str>) -> CatalogLink {
        CatalogLink {
            url: url.into(),
            filename: filename.map(str::to_string),
            size: None,
            host: None,
        }
    }

    #[test]
    fn typed_links_win_over_earlier_untyped_ones() {
        let links = vec![
            link("https://mirror.example/download?id=1", None),
            link("https://cdn.example/files/smw.zip", None),
        ];
        assert_eq!(
            PreferTypedLink.select(&links).unwrap().url,
            "https://cdn.example/files/smw.zip"
        );

        let untyped = vec![link("https://a.example/get", Some("")), link("https://b.example/get", None)];
        assert_eq!(PreferTypedLink.select(&untyped).unwrap().url, "https://a.example/get");
        assert!(PreferTypedLink.select(&[]).is_none());
    }

    #[test]
    fn errors_classify_into_failure_kinds() {
        assert_eq!(PipelineError::NoMatch("x".into()).kind(), ErrorKind::Resolution);
        assert_eq!(
            PipelineError::from(DownloadError::Transient("reset".into())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            PipelineError::from(DownloadError::Fatal("416".into())).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            PipelineError::from(DownloadError::Cancelled).kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(
            PipelineError::from(InstallError::InvalidPath("..".into())).kind(),
            ErrorKind::Validation
        );
        assert_eq!(PipelineError::Cancelled.to_string(), crate::jobs::CANCELLED_MESSAGE);
    }

    #[test]
    fn malformed_templates_are_rejected_at_submission() {
        let mut settings = Settings::default();
        settings.profiles.get_mut("default").unwrap().platforms.insert(
            "snes".into(),
            crate::config::PlatformConfig {
                root: "/lib/snes".into(),
                naming_template: Some("{Title} ({Name})".into()),
            },
        );
        let pipeline = test_pipeline(settings);
        let payload = JobPayload::DownloadAndInstall(crate::db::DownloadPayload {
            target: DownloadTarget::Slug { slug: "smw".into() },
            profile_id: "default".into(),
        });

        let err = pipeline.validate(&payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("unknown placeholder"), "{err}");

        assert!(test_pipeline(Settings::default()).validate(&payload).is_ok());
    }

    fn test_pipeline(settings: Settings) -> Pipeline {
        Pipeline::new(
            Arc::new(settings),
            Arc::new(crate::catalog::StaticCatalog::default()),
            Downloader::new(
                reqwest::Client::new(),
                std::time::Duration::ZERO,
                crate::download::RetryPolicy {
                    attempts: 0,
                    backoff: std::time::Duration::from_millis(1),
                },
            ),
            Database::open_in_memory().unwrap(),
        )
    }

    struct LastLink;

    impl LinkSelector for LastLink {
        fn select<'a>(&self, links: &'a [CatalogLink]) -> Option<&'a CatalogLink> {
            links.last()
        }
    }

    #[test]
    fn link_selector_can_be_replaced() {
        let pipeline = test_pipeline(Settings::default()).with_link_selector(LastLink);

        let links = vec![
            link("https://cdn.example/files/smw.zip", None),
            link("https://mirror.example/get", None),
        ];
        assert_eq!(
            pipeline.links.select(&links).unwrap().url,
            "https://mirror.example/get"
        );
    }
}
