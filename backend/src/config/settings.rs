//! Settings data structures

use crate::matcher::{DEFAULT_MAX_RESULTS, DEFAULT_MIN_SCORE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Template used when neither the platform nor the profile defines one.
pub const DEFAULT_NAMING_TEMPLATE: &str = "{Title} ({Region})";

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server configuration
    pub server: ServerSettings,

    /// Maximum number of jobs running at once
    pub max_concurrent_jobs: usize,

    /// Global switch; when off, download jobs finish without touching disk or network
    pub downloads_enabled: bool,

    /// Fallback root for platforms a profile does not map
    pub download_dir: PathBuf,

    /// Minimum time between two progress events of one download
    pub progress_interval_ms: u64,

    pub retry: RetrySettings,

    /// Compute SHA-256 of installed files
    pub hash_artifacts: bool,

    /// Events kept in memory for reconnecting subscribers
    pub event_replay_capacity: usize,

    pub matching: MatchSettings,

    pub catalog: CatalogSettings,

    /// Install profiles by id
    pub profiles: HashMap<String, Profile>,
}

impl Default for Settings {
    fn default() -> Self {
        let download_dir = dirs::download_dir()
            .unwrap_or_else(|| PathBuf::from("./downloads"))
            .join("roms");

        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), Profile::default());

        Self {
            server: ServerSettings::default(),
            max_concurrent_jobs: 2,
            downloads_enabled: true,
            download_dir,
            progress_interval_ms: 250,
            retry: RetrySettings::default(),
            hash_artifacts: true,
            event_replay_capacity: crate::events::DEFAULT_REPLAY_CAPACITY,
            matching: MatchSettings::default(),
            catalog: CatalogSettings::default(),
            profiles,
        }
    }
}

impl Settings {
    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    /// Directory that holds `platform` files for `profile`.
    pub fn platform_root(&self, profile: &Profile, platform: &str) -> PathBuf {
        profile
            .platforms
            .get(platform)
            .map(|p| p.root.clone())
            .unwrap_or_else(|| self.download_dir.join(platform))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to (0.0.0.0 for LAN access)
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Extra attempts after a transient failure
    pub attempts: u32,
    /// Base delay, doubled on every retry
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchSettings {
    pub min_score: f64,
    pub max_results: usize,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_MIN_SCORE,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

/// Where catalog entries come from. `file` wins when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub base_url: Option<String>,
    pub file: Option<PathBuf>,
}

/// A named install layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Display name
    pub name: String,

    /// Template used for platforms without their own
    pub naming_template: String,

    /// Per-platform roots and templates
    pub platforms: HashMap<String, PlatformConfig>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "Default".to_string(),
            naming_template: DEFAULT_NAMING_TEMPLATE.to_string(),
            platforms: HashMap::new(),
        }
    }
}

impl Profile {
    pub fn template_for(&self, platform: &str) -> &str {
        self.platforms
            .get(platform)
            .and_then(|p| p.naming_template.as_deref())
            .unwrap_or(&self.naming_template)
    }
}

/// Library location for one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub naming_template: Option<String>,
}
