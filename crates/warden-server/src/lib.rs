//! Notification intake for Warden.
//!
//! An axum router that accepts GitHub webhook deliveries, hands review
//! triggers to the [`Orchestrator`] and answers immediately. Job outcomes are
//! never reported on the webhook response; they are exposed under `/jobs`.

mod error;
pub mod jobs;
pub mod webhook;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use warden_core::WardenError;
use warden_review::Orchestrator;

pub use error::ApiError;

/// Shared state of every handler.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// When set, deliveries must carry a valid `X-Hub-Signature-256`.
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, webhook_secret: Option<String>) -> Self {
        Self {
            orchestrator,
            webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
        }
    }
}

/// Build the intake router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook::handle_webhook))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/{key}", get(jobs::get_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`WardenError::Io`] if the listener fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), WardenError> {
    let addr = listener.local_addr()?;
    info!(%addr, signed = state.webhook_secret.is_some(), "intake listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
