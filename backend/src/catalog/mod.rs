//! Catalog of games and their downloadable assets
//!
//! The catalog is an external collaborator; this module only defines the
//! shape the pipeline consumes and two ways of reaching it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One downloadable asset of a catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogLink {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub host: Option<String>,
}

/// Read-only description of a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub slug: String,
    pub title: String,
    pub platform: String,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub links: Vec<CatalogLink>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("catalog returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("catalog file error: {0}")]
    File(String),
}

/// Lookup interface the pipeline depends on.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Fetch one entry by slug; `Ok(None)` when the slug is unknown.
    async fn get_entry(&self, slug: &str) -> Result<Option<CatalogEntry>, CatalogError>;

    /// Entries a free-text query may be matched against.
    async fn candidates(&self, platform: Option<&str>) -> Result<Vec<CatalogEntry>, CatalogError>;
}

/// Catalog served over HTTP.
///
/// `GET {base}/entries/{slug}` returns one entry and
/// `GET {base}/entries?platform=..` returns a list.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn get_entry(&self, slug: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        let url = format!("{}/entries/{}", self.base_url, urlencoding::encode(slug));
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status()));
        }
        Ok(Some(response.json().await?))
    }

    async fn candidates(&self, platform: Option<&str>) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut request = self.client.get(format!("{}/entries", self.base_url));
        if let Some(platform) = platform {
            request = request.query(&[("platform", platform)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}

/// Catalog held in memory, optionally loaded from a JSON array on disk.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::File(format!("{}: {e}", path.display())))?;
        let entries = serde_json::from_str(&content)
            .map_err(|e| CatalogError::File(format!("{}: {e}", path.display())))?;
        Ok(Self { entries })
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn get_entry(&self, slug: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        Ok(self.entries.iter().find(|e| e.slug == slug).cloned())
    }

    async fn candidates(&self, platform: Option<&str>) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| platform.map_or(true, |p| e.platform.eq_ignore_ascii_case(p)))
            .cloned()
            .collect())
    }
}
