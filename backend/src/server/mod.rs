//! Web server module

mod routes;
mod sse;

use crate::AppState;
use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Build the HTTP router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        // Jobs
        .route("/jobs", get(routes::list_jobs))
        .route("/jobs/download", post(routes::submit_download))
        .route("/jobs/scan", post(routes::submit_scan))
        .route("/jobs/{id}", get(routes::get_job))
        .route("/jobs/{id}/events", get(routes::job_events))
        .route("/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/jobs/{id}/pause", post(routes::pause_job))
        .route("/jobs/{id}/resume", post(routes::resume_job))
        // Library
        .route("/library", get(routes::list_library))
        // Live events
        .route("/events", get(sse::stream_events))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = format!("{}:{}", state.settings.server.host, state.settings.server.port);
    let app = router(state);

    info!("Starting web server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
