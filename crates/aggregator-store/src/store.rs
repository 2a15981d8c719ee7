//! The [`EventStore`] contract and its SQLite implementation.

use aggregator_db::DbPool;
use aggregator_types::{Event, InsertOutcome, Stats};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::StoreError;

const RECEIVED: &str = "received";
const UNIQUE_PROCESSED: &str = "unique_processed";
const DUPLICATE_DROPPED: &str = "duplicate_dropped";

/// Durable keyed storage with atomic insert-if-absent and persisted counters.
///
/// Implementations are synchronous; async callers run them on the blocking
/// thread pool.
pub trait EventStore: Send + Sync + 'static {
    /// Persists `event` unless its `(topic, event_id)` is already present.
    ///
    /// In the same durability unit, increments `received` and exactly one of
    /// `unique_processed` or `duplicate_dropped`. On error nothing is
    /// persisted and no counter moves.
    fn try_insert(&self, event: &Event) -> Result<InsertOutcome, StoreError>;

    /// Returns persisted events in insertion order, optionally restricted to
    /// one topic.
    fn query(&self, topic: Option<&str>) -> Result<Vec<Event>, StoreError>;

    /// Returns the current counters and the sorted set of distinct topics.
    fn stats(&self) -> Result<Stats, StoreError>;
}

/// [`EventStore`] backed by a pooled SQLite database.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: DbPool,
}

impl SqliteEventStore {
    /// Wraps `pool` and brings its schema up to date.
    ///
    /// Safe to call against an already-initialized database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Migration` if the schema cannot be created; this
    /// is fatal and should abort startup.
    pub fn open(pool: DbPool) -> Result<Self, StoreError> {
        {
            let conn = pool.get()?;
            let applied = aggregator_db::run_migrations(&conn)?;
            if applied > 0 {
                tracing::info!(count = applied, "applied event store migrations");
            }
        }
        Ok(Self { pool })
    }

    /// Returns the underlying connection pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl EventStore for SqliteEventStore {
    fn try_insert(&self, event: &Event) -> Result<InsertOutcome, StoreError> {
        let payload = serde_json::to_string(&event.payload)?;
        let timestamp = event.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true);

        let mut conn = self.pool.get()?;
        // IMMEDIATE takes the write lock up front so the insert and both
        // counter bumps commit or roll back together.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO events (topic, event_id, timestamp, source, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![event.topic, event.event_id, timestamp, event.source, payload],
        );

        let outcome = match inserted {
            Ok(_) => InsertOutcome::Inserted,
            Err(e) if is_unique_violation(&e) => InsertOutcome::Duplicate,
            Err(e) => return Err(e.into()),
        };

        increment(&tx, RECEIVED)?;
        increment(
            &tx,
            match outcome {
                InsertOutcome::Inserted => UNIQUE_PROCESSED,
                InsertOutcome::Duplicate => DUPLICATE_DROPPED,
            },
        )?;
        tx.commit()?;

        Ok(outcome)
    }

    fn query(&self, topic: Option<&str>) -> Result<Vec<Event>, StoreError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT topic, event_id, timestamp, source, payload
             FROM events
             WHERE ?1 IS NULL OR topic = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![topic], |row| {
            Ok(StoredRow {
                topic: row.get(0)?,
                event_id: row.get(1)?,
                timestamp: row.get(2)?,
                source: row.get(3)?,
                payload: row.get(4)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }

        tracing::trace!(
            topic = topic.unwrap_or("<all>"),
            count = events.len(),
            "queried events"
        );

        Ok(events)
    }

    fn stats(&self) -> Result<Stats, StoreError> {
        let mut conn = self.pool.get()?;
        // A single read transaction sees one WAL snapshot, so counters and
        // topics agree with each other.
        let tx = conn.transaction()?;

        let received = read_counter(&tx, RECEIVED)?;
        let unique_processed = read_counter(&tx, UNIQUE_PROCESSED)?;
        let duplicate_dropped = read_counter(&tx, DUPLICATE_DROPPED)?;

        let topics = {
            let mut stmt = tx.prepare("SELECT DISTINCT topic FROM events ORDER BY topic ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        tx.commit()?;

        Ok(Stats {
            received,
            unique_processed,
            duplicate_dropped,
            topics,
        })
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn increment(tx: &Transaction<'_>, key: &str) -> Result<(), StoreError> {
    let updated = tx.execute(
        "UPDATE stats SET value = value + 1 WHERE key = ?1",
        params![key],
    )?;
    if updated != 1 {
        return Err(StoreError::Corrupt(format!("missing counter '{key}'")));
    }
    Ok(())
}

fn read_counter(tx: &Transaction<'_>, key: &str) -> Result<u64, StoreError> {
    let value: Option<i64> = tx
        .query_row(
            "SELECT value FROM stats WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    let value = value.ok_or_else(|| StoreError::Corrupt(format!("missing counter '{key}'")))?;
    u64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("counter '{key}' is negative: {value}")))
}

/// A row of the `events` table before decoding.
struct StoredRow {
    topic: String,
    event_id: String,
    timestamp: String,
    source: String,
    payload: String,
}

impl StoredRow {
    fn into_event(self) -> Result<Event, StoreError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| {
                StoreError::Corrupt(format!(
                    "event {}:{} has unreadable timestamp '{}': {e}",
                    self.topic, self.event_id, self.timestamp
                ))
            })?
            .with_timezone(&Utc);

        let serde_json::Value::Object(payload) = serde_json::from_str(&self.payload)? else {
            return Err(StoreError::Corrupt(format!(
                "event {}:{} payload is not a JSON object",
                self.topic, self.event_id
            )));
        };

        Ok(Event {
            topic: self.topic,
            event_id: self.event_id,
            timestamp,
            source: self.source,
            payload,
        })
    }
}
