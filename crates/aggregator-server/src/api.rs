//! API handlers for the aggregator server.

use crate::AppState;
use aggregator_ingest::IngestError;
use aggregator_types::{Event, EventInput, ValidationError};
use axum::{
    extract::{rejection::JsonRejection, Extension, Json, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Request body for `POST /publish`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Events to ingest, in order.
    pub events: Vec<EventInput>,
}

/// Response body for an accepted batch.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub status: String,
    /// Events queued for processing. Duplicates are only visible in `/stats`.
    pub accepted: usize,
    pub message: String,
}

/// Query parameters for `GET /events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Restrict results to one topic.
    pub topic: Option<String>,
}

/// Response body for event retrieval.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub status: String,
    /// Number of events in `data`.
    pub count: usize,
    /// Persisted events in insertion order.
    pub data: Vec<Event>,
}

/// Counters plus process uptime.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsBody {
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    pub topics: Vec<String>,
    /// Seconds since the server started, rounded to two decimals.
    pub uptime: f64,
}

/// Response body for `GET /stats`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub status: String,
    pub stats: StatsBody,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("event {index} is invalid: {source}")]
    InvalidEvent {
        index: usize,
        #[source]
        source: ValidationError,
    },
    #[error(transparent)]
    Body(#[from] JsonRejection),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::QueueClosed { accepted } => ApiError::Unavailable(format!(
                "server is shutting down; {accepted} event(s) were queued before the queue closed"
            )),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            ApiError::InvalidEvent { index, source } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({ "error": source.to_string(), "index": index }),
            ),
            ApiError::Body(rejection) => (
                rejection.status(),
                serde_json::json!({ "error": rejection.body_text() }),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            ApiError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": msg }),
            ),
            ApiError::InternalServerError(msg) => {
                // The cause stays in the logs.
                tracing::error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Handler for `POST /publish`.
///
/// Validates the whole batch before queueing any of it, then returns as
/// soon as every event is queued.
pub async fn publish_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let Json(request) = payload?;

    if request.events.is_empty() {
        return Err(ApiError::BadRequest(ValidationError::EmptyBatch.to_string()));
    }

    let events = request
        .events
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            input
                .validate()
                .map_err(|source| ApiError::InvalidEvent { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let accepted = state.service.process_events(events).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            status: "accepted".to_string(),
            accepted,
            message: format!("{accepted} event(s) queued for processing"),
        }),
    ))
}

/// Handler for `GET /events`.
pub async fn get_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let topic = params.topic.filter(|t| !t.trim().is_empty());
    let data = state.service.get_events(topic.clone()).await?;

    if let Some(topic) = topic {
        if data.is_empty() {
            return Err(ApiError::NotFound(format!(
                "no events found for topic '{topic}'"
            )));
        }
    }

    Ok(Json(EventsResponse {
        status: "success".to_string(),
        count: data.len(),
        data,
    }))
}

/// Handler for `GET /stats`.
pub async fn get_stats_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.service.get_stats().await?;
    let uptime = (state.started_at.elapsed().as_secs_f64() * 100.0).round() / 100.0;

    Ok(Json(StatsResponse {
        status: "success".to_string(),
        stats: StatsBody {
            received: stats.received,
            unique_processed: stats.unique_processed,
            duplicate_dropped: stats.duplicate_dropped,
            topics: stats.topics,
            uptime,
        },
    }))
}
