//! Shared fixtures for ingestion tests.

#![allow(dead_code)]

use aggregator_db::{create_pool, DbRuntimeSettings};
use aggregator_ingest::RetryPolicy;
use aggregator_store::{EventStore, SqliteEventStore, StoreError};
use aggregator_types::{Event, InsertOutcome, Stats};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// A store over a single-connection in-memory database.
pub fn memory_store() -> SqliteEventStore {
    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 1,
        },
    )
    .expect("failed to create pool");
    SqliteEventStore::open(pool).expect("failed to open store")
}

/// Retry policy with the standard budget and a short delay.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
}

pub fn event(topic: &str, event_id: &str) -> Event {
    Event::new(topic, "svc", payload(json!({"amt": 10}))).with_event_id(event_id)
}

pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("test payload must be an object, got {other}"),
    }
}

pub fn busy() -> StoreError {
    StoreError::Database(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    ))
}

/// Fails the first `failures` inserts with `SQLITE_BUSY`, then delegates.
pub struct FlakyStore {
    inner: SqliteEventStore,
    failures_left: AtomicU32,
    pub attempts: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: memory_store(),
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }
}

impl EventStore for FlakyStore {
    fn try_insert(&self, event: &Event) -> Result<InsertOutcome, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(busy());
        }
        self.inner.try_insert(event)
    }

    fn query(&self, topic: Option<&str>) -> Result<Vec<Event>, StoreError> {
        self.inner.query(topic)
    }

    fn stats(&self) -> Result<Stats, StoreError> {
        self.inner.stats()
    }
}

/// Always fails inserts with a non-retryable error.
pub struct CorruptStore {
    pub attempts: AtomicU32,
}

impl EventStore for CorruptStore {
    fn try_insert(&self, _event: &Event) -> Result<InsertOutcome, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Corrupt("events table is unreadable".to_string()))
    }

    fn query(&self, _topic: Option<&str>) -> Result<Vec<Event>, StoreError> {
        Err(StoreError::Corrupt("events table is unreadable".to_string()))
    }

    fn stats(&self) -> Result<Stats, StoreError> {
        Ok(Stats::default())
    }
}

/// Blocks every insert until the test hands out a permit.
pub struct GatedStore {
    inner: SqliteEventStore,
    permits: Mutex<mpsc::Receiver<()>>,
}

impl GatedStore {
    pub fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let store = Self {
            inner: memory_store(),
            permits: Mutex::new(rx),
        };
        (store, tx)
    }
}

impl EventStore for GatedStore {
    fn try_insert(&self, event: &Event) -> Result<InsertOutcome, StoreError> {
        let permits = self.permits.lock().expect("permit lock poisoned");
        permits
            .recv()
            .map_err(|_| StoreError::Corrupt("gate closed".to_string()))?;
        drop(permits);
        self.inner.try_insert(event)
    }

    fn query(&self, topic: Option<&str>) -> Result<Vec<Event>, StoreError> {
        self.inner.query(topic)
    }

    fn stats(&self) -> Result<Stats, StoreError> {
        self.inner.stats()
    }
}

/// Adds a fixed delay to every insert.
pub struct SlowStore {
    inner: SqliteEventStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: memory_store(),
            delay,
        }
    }
}

impl EventStore for SlowStore {
    fn try_insert(&self, event: &Event) -> Result<InsertOutcome, StoreError> {
        std::thread::sleep(self.delay);
        self.inner.try_insert(event)
    }

    fn query(&self, topic: Option<&str>) -> Result<Vec<Event>, StoreError> {
        self.inner.query(topic)
    }

    fn stats(&self) -> Result<Stats, StoreError> {
        self.inner.stats()
    }
}

pub fn shared<S: EventStore>(store: S) -> Arc<S> {
    Arc::new(store)
}
