//! Configuration management for ROM Downloader

mod settings;

pub use settings::*;

use anyhow::Result;
use std::fs;
use std::path::PathBuf;

/// Overrides the directory holding `config.toml` and the database.
pub const DATA_DIR_ENV: &str = "ROMDL_DATA_DIR";

/// Overrides the fallback download root.
pub const STAGING_DIR_ENV: &str = "ROMDL_STAGING_DIR";

/// Directory paths injected through the environment, read once at startup
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub data_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
}

impl Environment {
    pub fn from_env() -> Self {
        let read = |key: &str| {
            std::env::var_os(key)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        Self {
            data_dir: read(DATA_DIR_ENV),
            staging_dir: read(STAGING_DIR_ENV),
        }
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rom-downloader")
        })
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    /// Get the database file path
    pub fn db_path(&self) -> PathBuf {
        self.config_dir().join("jobs.db")
    }
}

/// Load configuration from file or create default
pub fn load_or_create_default(env: &Environment) -> Result<Settings> {
    let path = env.config_path();

    let mut settings = if path.exists() {
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content)?
    } else {
        let settings = Settings::default();
        save(env, &settings)?;
        settings
    };

    if let Some(staging) = &env.staging_dir {
        settings.download_dir = staging.clone();
    }
    settings.max_concurrent_jobs = settings.max_concurrent_jobs.max(1);

    Ok(settings)
}

/// Save configuration to file
pub fn save(env: &Environment, settings: &Settings) -> Result<()> {
    let path = env.config_path();

    // Ensure config directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(settings)?;
    fs::write(&path, content)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_defaults_and_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment {
            data_dir: Some(dir.path().join("data")),
            staging_dir: Some(dir.path().join("staging")),
        };

        let settings = load_or_create_default(&env).unwrap();
        assert!(env.config_path().exists());
        assert_eq!(settings.download_dir, dir.path().join("staging"));

        std::fs::write(env.config_path(), "max_concurrent_jobs = 0\n").unwrap();
        let reloaded = load_or_create_default(&env).unwrap();
        assert_eq!(reloaded.max_concurrent_jobs, 1);
    }
}
