use aggregator_db::{create_pool, DbRuntimeSettings};
use aggregator_ingest::{IngestConfig, IngestionService, RetryPolicy};
use aggregator_server::{
    api::{EventsResponse, PublishResponse, StatsResponse},
    app, AppState,
};
use aggregator_store::{EventStore, SqliteEventStore, StoreError};
use aggregator_types::{Event, InsertOutcome, Stats};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Fails every operation with a non-retryable error.
struct BrokenStore;

impl EventStore for BrokenStore {
    fn try_insert(&self, _event: &Event) -> Result<InsertOutcome, StoreError> {
        Err(StoreError::Corrupt("counter row 'received' is missing".to_string()))
    }

    fn query(&self, _topic: Option<&str>) -> Result<Vec<Event>, StoreError> {
        Err(StoreError::Corrupt("secret table detail".to_string()))
    }

    fn stats(&self) -> Result<Stats, StoreError> {
        Err(StoreError::Corrupt("secret table detail".to_string()))
    }
}

fn ingest_config() -> IngestConfig {
    IngestConfig {
        queue_capacity: 64,
        retry: RetryPolicy::new(3, Duration::from_millis(5)),
    }
}

fn setup_with(store: Arc<dyn EventStore>) -> (Router, Arc<IngestionService>) {
    let service = Arc::new(IngestionService::new(store, ingest_config()));
    (app(AppState::new(service.clone())), service)
}

fn setup() -> (Router, Arc<IngestionService>) {
    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 1,
        },
    )
    .unwrap();
    let store = SqliteEventStore::open(pool).unwrap();
    setup_with(Arc::new(store))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn publish(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/publish")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn order(event_id: &str) -> Value {
    json!({
        "topic": "order.placed",
        "event_id": event_id,
        "timestamp": "2023-10-23T10:00:00Z",
        "source": "checkout",
        "payload": {"amount": 10}
    })
}

#[tokio::test]
async fn root_returns_banner() {
    let (app, _) = setup();
    let (status, json) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["message"].as_str().unwrap().contains("running"));
}

#[tokio::test]
async fn health_reports_consumer_state() {
    let (app, service) = setup();
    service.start().await;

    let (status, json) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["consumer"]["fatal_errors"], 0);
    assert!(json["consumer"]["state"].is_string());

    let (status, _) = send(&app, publish(json!({ "events": [order("A1"), order("A1")] }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    service.stop().await;

    let (_, json) = send(&app, get("/health")).await;
    assert_eq!(json["consumer"]["state"], "stopped");
    assert_eq!(json["consumer"]["inserted"], 1);
    assert_eq!(json["consumer"]["duplicates"], 1);
    assert_eq!(json["consumer"]["dropped"], 0);
}

#[tokio::test]
async fn publish_then_stats_counts_the_duplicate() {
    let (app, service) = setup();

    let (status, json) = send(&app, publish(json!({ "events": [order("A1"), order("A1")] }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let resp: PublishResponse = serde_json::from_value(json).unwrap();
    assert_eq!(resp.accepted, 2);
    assert_eq!(resp.status, "accepted");

    service.stop().await;

    let (status, json) = send(&app, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    let resp: StatsResponse = serde_json::from_value(json).unwrap();
    assert_eq!(resp.status, "success");
    assert_eq!(resp.stats.received, 2);
    assert_eq!(resp.stats.unique_processed, 1);
    assert_eq!(resp.stats.duplicate_dropped, 1);
    assert_eq!(resp.stats.topics, vec!["order.placed"]);
    assert!(resp.stats.uptime >= 0.0);

    let (status, json) = send(&app, get("/events?topic=order.placed")).await;
    assert_eq!(status, StatusCode::OK);
    let resp: EventsResponse = serde_json::from_value(json).unwrap();
    assert_eq!(resp.count, 1);
    assert_eq!(resp.data[0].event_id, "A1");
    assert_eq!(resp.data[0].source, "checkout");
}

#[tokio::test]
async fn publish_fills_in_missing_id_and_timestamp() {
    let (app, service) = setup();
    let body = json!({ "events": [{"topic": "t", "source": "s", "payload": {}}] });

    let (status, _) = send(&app, publish(body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    service.stop().await;

    let (_, json) = send(&app, get("/events")).await;
    let resp: EventsResponse = serde_json::from_value(json).unwrap();
    assert_eq!(resp.count, 1);
    assert_eq!(resp.data[0].event_id.len(), 36, "expected a generated uuid");
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let (app, _) = setup();
    let (status, json) = send(&app, publish(json!({ "events": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "no events provided");
}

#[tokio::test]
async fn invalid_event_rejects_the_whole_batch() {
    let (app, service) = setup();
    let mut bad = order("A2");
    bad["payload"] = json!([1, 2, 3]);

    let (status, json) = send(&app, publish(json!({ "events": [order("A1"), bad] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["index"], 1);
    assert_eq!(json["error"], "payload must be a JSON object");

    service.stop().await;
    let (_, json) = send(&app, get("/stats")).await;
    assert_eq!(json["stats"]["received"], 0, "nothing from the batch is queued");
}

#[tokio::test]
async fn naive_timestamp_is_rejected() {
    let (app, _) = setup();
    let mut event = order("A1");
    event["timestamp"] = json!("2023-10-23T10:00:00");

    let (status, json) = send(&app, publish(json!({ "events": [event] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["index"], 0);
}

#[tokio::test]
async fn blank_topic_is_rejected() {
    let (app, _) = setup();
    let mut event = order("A1");
    event["topic"] = json!("   ");

    let (status, json) = send(&app, publish(json!({ "events": [event] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"], "topic cannot be empty");
}

#[tokio::test]
async fn malformed_body_is_a_json_error() {
    let (app, _) = setup();
    let request = Request::builder()
        .method("POST")
        .uri("/publish")
        .header("content-type", "application/json")
        .body(Body::from("{\"events\": ["))
        .unwrap();

    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, _) = send(&app, publish(json!({ "events": [{"topic": "t"}] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "missing fields");
}

#[tokio::test]
async fn null_event_id_is_rejected() {
    let (app, _) = setup();
    let mut event = order("A1");
    event["event_id"] = Value::Null;

    let (status, json) = send(&app, publish(json!({ "events": [event] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn offset_without_colon_is_accepted() {
    let (app, service) = setup();
    let mut event = order("A1");
    event["timestamp"] = json!("2023-10-23T12:00:00+0200");

    let (status, _) = send(&app, publish(json!({ "events": [event] }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    service.stop().await;

    let (_, json) = send(&app, get("/events?topic=order.placed")).await;
    assert_eq!(json["data"][0]["timestamp"], "2023-10-23T10:00:00Z");
}

#[tokio::test]
async fn unknown_topic_is_not_found() {
    let (app, _) = setup();
    let (status, json) = send(&app, get("/events?topic=nonexistent")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "no events found for topic 'nonexistent'");
}

#[tokio::test]
async fn unfiltered_events_on_empty_store_is_ok() {
    let (app, _) = setup();
    let (status, json) = send(&app, get("/events")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 0);
    assert_eq!(json["data"], json!([]));
}

#[tokio::test]
async fn store_failures_are_not_echoed_to_callers() {
    let (app, _) = setup_with(Arc::new(BrokenStore));

    for uri in ["/events", "/stats"] {
        let (status, json) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json, json!({ "error": "internal server error" }));
    }
}

#[tokio::test]
async fn fatal_consumer_errors_degrade_health() {
    let (app, service) = setup_with(Arc::new(BrokenStore));

    let (status, _) = send(&app, publish(json!({ "events": [order("A1")] }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    service.stop().await;

    let (status, json) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["consumer"]["state"], "stopped");
    assert_eq!(json["consumer"]["dropped"], 1);
    assert_eq!(json["consumer"]["fatal_errors"], 1);
}
