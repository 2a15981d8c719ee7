//! Shared types for the event aggregator.
//!
//! This crate provides the domain model used across all aggregator crates:
//! the validated [`Event`], its wire form [`EventInput`], the derived
//! [`Stats`] projection, and the [`InsertOutcome`] reported by the store.
//!
//! Validation lives here too, so every layer above the HTTP boundary only
//! ever sees events that already passed it.

mod event;
mod stats;

pub use event::{parse_timestamp, Event, EventInput, ValidationError};
pub use stats::Stats;

use serde::{Deserialize, Serialize};

/// Result of a single insert-if-absent attempt against the event store.
///
/// A duplicate is a normal outcome, not an error: it means the identity key
/// `(topic, event_id)` was already persisted and nothing new was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    /// The event was first-seen and is now persisted.
    Inserted,
    /// An event with the same identity key already exists.
    Duplicate,
}

impl InsertOutcome {
    /// Returns the canonical string label for this outcome.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for InsertOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
