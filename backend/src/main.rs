//! ROM Downloader - fetches games from a catalog and installs them into a library
//!
//! Runs as a background service exposing a small HTTP API and a live event
//! stream that a UI or CLI can drive.

mod catalog;
mod config;
mod db;
mod download;
mod events;
mod install;
mod jobs;
mod matcher;
mod pipeline;
mod server;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog::{Catalog, HttpCatalog, StaticCatalog};
use crate::config::{Environment, Settings};
use crate::db::Database;
use crate::download::{Downloader, RetryPolicy};
use crate::events::EventBus;
use crate::jobs::{JobExecutor, JobRunner};
use crate::pipeline::Pipeline;

/// Application state shared across all components
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: Database,
    pub bus: EventBus,
    pub runner: JobRunner,
}

fn build_catalog(settings: &Settings, client: &reqwest::Client) -> Result<Arc<dyn Catalog>> {
    if let Some(path) = &settings.catalog.file {
        let catalog = StaticCatalog::load(path)
            .with_context(|| format!("loading catalog file {}", path.display()))?;
        info!("Using catalog file {:?}", path);
        return Ok(Arc::new(catalog));
    }
    if let Some(base_url) = &settings.catalog.base_url {
        info!("Using catalog at {}", base_url);
        return Ok(Arc::new(HttpCatalog::new(client.clone(), base_url.clone())));
    }
    warn!("No catalog configured; every lookup will miss");
    Ok(Arc::new(StaticCatalog::default()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting ROM Downloader v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let env = Environment::from_env();
    let settings = Arc::new(config::load_or_create_default(&env)?);
    info!("Configuration loaded from {:?}", env.config_path());

    // Initialize database
    let db = Database::open(&env.db_path())?;
    info!("Database initialized at {:?}", env.db_path());

    let client = reqwest::Client::builder()
        .user_agent(concat!("rom-downloader/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    let catalog = build_catalog(&settings, &client)?;
    let downloader = Downloader::new(
        client,
        Duration::from_millis(settings.progress_interval_ms),
        RetryPolicy {
            attempts: settings.retry.attempts,
            backoff: Duration::from_millis(settings.retry.backoff_ms),
        },
    );

    let bus = EventBus::with_capacity(settings.event_replay_capacity);
    let executor: Arc<dyn JobExecutor> = Arc::new(Pipeline::new(
        settings.clone(),
        catalog,
        downloader,
        db.clone(),
    ));
    let runner = JobRunner::new(
        db.clone(),
        Arc::new(bus.clone()),
        executor,
        settings.max_concurrent_jobs,
    );

    // Settle jobs left behind by a previous run before accepting new ones
    runner.recover_orphans()?;

    let state = Arc::new(AppState {
        settings,
        db,
        bus,
        runner,
    });

    server::run(state).await
}
