//! The unit of ingestion and its wire representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while turning wire input into a validated [`Event`].
///
/// Validation happens before an event reaches the ingestion queue, so none
/// of these are ever retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required string field was empty or whitespace-only.
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),

    /// The timestamp was unparseable or carried no UTC offset.
    #[error("invalid timestamp '{0}': expected ISO 8601 with a UTC offset or 'Z' suffix")]
    InvalidTimestamp(String),

    /// The payload was valid JSON but not an object.
    #[error("payload must be a JSON object")]
    PayloadNotObject,

    /// A publish request carried no events.
    #[error("no events provided")]
    EmptyBatch,
}

/// A validated event, ready to be queued and persisted.
///
/// `(topic, event_id)` is the identity key used for deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Logical stream name, e.g. `order.placed`.
    pub topic: String,
    /// Caller-supplied or generated identifier, unique within `topic`.
    pub event_id: String,
    /// Event creation time, normalised to UTC.
    pub timestamp: DateTime<Utc>,
    /// Name of the producer, e.g. `order_service`.
    pub source: String,
    /// Arbitrary JSON object carried with the event.
    pub payload: Map<String, Value>,
}

impl Event {
    /// Creates an event with a generated UUID v4 identifier and the current
    /// time as its timestamp.
    pub fn new(
        topic: impl Into<String>,
        source: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    /// Replaces the generated identifier with a caller-chosen one.
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Replaces the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Wire form of an event as accepted by `POST /publish`.
///
/// `event_id` and `timestamp` may be omitted, in which case they default to
/// a generated UUID and "now" when the input is validated. An explicit
/// `null` is a type error, not an omission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInput {
    /// Topic name.
    pub topic: String,
    /// Optional identifier; generated when absent.
    #[serde(
        default,
        deserialize_with = "present_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub event_id: Option<String>,
    /// Optional ISO 8601 timestamp; "now" when absent.
    #[serde(
        default,
        deserialize_with = "present_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
    /// Producer name.
    pub source: String,
    /// Event body. Must be a JSON object.
    pub payload: Value,
}

impl EventInput {
    /// Validates the input and fills in defaulted fields.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if `topic`, `source` or a supplied
    /// `event_id` is blank, if the timestamp cannot be parsed as an
    /// offset-aware instant, or if `payload` is not a JSON object.
    pub fn validate(self) -> Result<Event, ValidationError> {
        if self.topic.trim().is_empty() {
            return Err(ValidationError::EmptyField("topic"));
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::EmptyField("source"));
        }

        let event_id = match self.event_id {
            Some(id) if id.trim().is_empty() => {
                return Err(ValidationError::EmptyField("event_id"))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let timestamp = match self.timestamp.as_deref() {
            Some(raw) => parse_timestamp(raw)?,
            None => Utc::now(),
        };

        let Value::Object(payload) = self.payload else {
            return Err(ValidationError::PayloadNotObject);
        };

        Ok(Event {
            topic: self.topic,
            event_id,
            timestamp,
            source: self.source,
            payload,
        })
    }
}

/// Only called for fields that are present, so `null` fails as a string.
fn present_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(Some)
}

/// Offset-aware ISO 8601 layouts tried after RFC 3339. `%#z` takes `Z`,
/// `+HH:MM`, `+HHMM` and `+HH`; `%.f` takes an optional fraction.
const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M%#z",
    "%Y-%m-%d %H:%M%#z",
];

/// Parses an offset-aware ISO 8601 timestamp and normalises it to UTC.
///
/// Accepts any timezone-aware representation: RFC 3339
/// (`2023-10-23T10:00:00Z`, `2023-10-23T12:00:00+02:00`), a space instead of
/// `T`, offsets written `+0200` or `+02`, and times without seconds. Naive
/// timestamps are rejected rather than guessed at.
///
/// # Errors
///
/// Returns `ValidationError::InvalidTimestamp` if the input cannot be parsed.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = raw.trim();
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .or_else(|| {
            TIMESTAMP_FORMATS
                .iter()
                .find_map(|format| DateTime::parse_from_str(trimmed, format).ok())
        })
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ValidationError::InvalidTimestamp(raw.to_string()))
}
