//! Derived ingestion counters.

use serde::{Deserialize, Serialize};

/// Running counters and distinct topics, as read from the event store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Persistence attempts that reached the store, duplicate or not.
    pub received: u64,
    /// Events actually inserted (first-seen).
    pub unique_processed: u64,
    /// Events rejected because their identity key was already present.
    pub duplicate_dropped: u64,
    /// Distinct topics among persisted events, sorted ascending.
    pub topics: Vec<String>,
}

impl Stats {
    /// Returns `true` when `received == unique_processed + duplicate_dropped`.
    pub fn is_conserved(&self) -> bool {
        self.received == self.unique_processed + self.duplicate_dropped
    }
}
