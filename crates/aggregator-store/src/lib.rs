//! Durable event storage for the aggregator.
//!
//! The store is the deduplication authority. Every write goes through
//! [`EventStore::try_insert`], which inserts the event, relies on the
//! `UNIQUE(topic, event_id)` constraint to detect duplicates, and bumps the
//! matching counters, all inside one SQLite transaction. There is no
//! separate "is this a duplicate?" lookup, so concurrent writers cannot race
//! between a check and an insert.
//!
//! Reads go through [`EventStore::query`] (events in insertion order,
//! optionally filtered by topic) and [`EventStore::stats`] (counters and
//! distinct topics under one read transaction).
//!
//! # Usage
//!
//! ```rust,ignore
//! use aggregator_store::{EventStore, SqliteEventStore};
//!
//! let store = SqliteEventStore::open(pool)?;
//! match store.try_insert(&event)? {
//!     InsertOutcome::Inserted => { /* first seen */ }
//!     InsertOutcome::Duplicate => { /* already persisted */ }
//! }
//! let stats = store.stats()?;
//! ```

mod error;
mod store;

pub use error::StoreError;
pub use store::{EventStore, SqliteEventStore};
