//! Aggregator server library logic.

pub mod api;
pub mod config;

use aggregator_ingest::IngestionService;
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Ingestion pipeline. The binary keeps its own handle to drain it on
    /// shutdown.
    pub service: Arc<IngestionService>,
    /// When the server started; reported as `uptime` by `/stats`.
    pub started_at: Instant,
}

impl AppState {
    /// Creates state for `service`, with uptime counted from now.
    pub fn new(service: Arc<IngestionService>) -> Self {
        Self {
            service,
            started_at: Instant::now(),
        }
    }
}

/// Maximum request body size (2 MiB). Protects against OOM from oversized payloads.
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Banner handler.
async fn root() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Event Aggregator API is running"
    }))
}

/// Health check handler.
///
/// Reports `degraded` with `503` once the consumer has hit a fatal store
/// error, so load balancers stop routing publishes here.
async fn health(Extension(state): Extension<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let metrics = state.service.metrics();
    let healthy = state.service.is_healthy();
    let consumer_state = state.service.consumer_state().await;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "consumer": {
                "state": consumer_state,
                "inserted": metrics.inserted,
                "duplicates": metrics.duplicates,
                "dropped": metrics.dropped,
                "fatal_errors": metrics.fatal_errors,
            }
        })),
    )
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/publish", post(api::publish_handler))
        .route("/events", get(api::get_events_handler))
        .route("/stats", get(api::get_stats_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
