//! Installation manifest kept next to installed files

use super::InstallError;
use crate::catalog::CatalogEntry;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use uuid::Uuid;

pub const MANIFEST_FILE: &str = ".manifest.json";
pub const MANIFEST_SCHEMA: u32 = 1;

/// One installed file, relative to the manifest's directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Catalog entry the artifact was installed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema: u32,
    pub slug: String,
    pub title: String,
    pub platform: String,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub profile_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn new(entry: &CatalogEntry, profile_id: &str) -> Self {
        Self {
            schema: MANIFEST_SCHEMA,
            slug: entry.slug.clone(),
            title: entry.title.clone(),
            platform: entry.platform.clone(),
            regions: entry.regions.clone(),
            artifacts: Vec::new(),
            profile_id: profile_id.to_string(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Record `artifacts`, replacing entries with the same path and keeping
    /// every other prior entry.
    pub fn merge(&mut self, artifacts: Vec<Artifact>) {
        for artifact in artifacts {
            match self.artifacts.iter_mut().find(|a| a.path == artifact.path) {
                Some(existing) => *existing = artifact,
                None => self.artifacts.push(artifact),
            }
        }
    }
}

/// Manifest updates are read-modify-write, so writers into one directory
/// take turns.
static DIR_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    Lazy::new(Default::default);

fn dir_lock(dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
    DIR_LOCKS
        .lock()
        .entry(dir.to_path_buf())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

/// Read the manifest in `dir`, if one exists.
pub async fn load(dir: &Path) -> Result<Option<Manifest>, InstallError> {
    let path = manifest_path(dir);
    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let manifest: Manifest = serde_json::from_str(&content)
        .map_err(|e| InstallError::Manifest(format!("{}: {e}", path.display())))?;
    if manifest.schema != MANIFEST_SCHEMA {
        return Err(InstallError::Manifest(format!(
            "{}: unsupported schema {}",
            path.display(),
            manifest.schema
        )));
    }
    Ok(Some(manifest))
}

/// Create or merge the manifest in `dir` and write it atomically.
pub async fn write_or_merge(
    dir: &Path,
    entry: &CatalogEntry,
    profile_id: &str,
    artifacts: Vec<Artifact>,
) -> Result<Manifest, InstallError> {
    let lock = dir_lock(dir);
    let _guard = lock.lock().await;

    let mut manifest = match load(dir).await? {
        Some(mut existing) => {
            existing.slug = entry.slug.clone();
            existing.title = entry.title.clone();
            existing.platform = entry.platform.clone();
            existing.regions = entry.regions.clone();
            existing.profile_id = profile_id.to_string();
            existing.updated_at = Some(Utc::now());
            existing
        }
        None => Manifest::new(entry, profile_id),
    };
    manifest.merge(artifacts);

    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| InstallError::Manifest(e.to_string()))?;
    let path = manifest_path(dir);
    let tmp = dir.join(format!("{MANIFEST_FILE}.{}.tmp", Uuid::new_v4().simple()));
    let written = match fs::write(&tmp, json).await {
        Ok(()) => fs::rename(&tmp, &path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(manifest)
}
