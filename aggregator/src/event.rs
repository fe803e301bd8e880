use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::AppError;

const MAX_IDENTIFIER_LEN: usize = 255;

/// An event as submitted by a producer. Parsing this type is total: either
/// the whole batch becomes a valid `Vec<Event>` or the request is rejected
/// before any state is touched.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub topic: String,
    pub event_id: String,
    pub timestamp: String,
    pub source: String,
    #[serde(default = "Value::default")]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub events: Vec<RawEvent>,
}

/// A validated, parsed event ready to flow into the queue or the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub event_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: String,
    pub payload: Value,
}

impl Event {
    pub fn parse(raw: RawEvent) -> Result<Self, AppError> {
        let topic = non_empty("topic", raw.topic)?;
        let event_id = non_empty("event_id", raw.event_id)?;
        let source = non_empty("source", raw.source)?;

        let timestamp = OffsetDateTime::parse(
            &raw.timestamp,
            &time::format_description::well_known::Rfc3339,
        )
        .map_err(|_| {
            AppError::Validation(format!(
                "timestamp '{}' is not a valid ISO-8601 timestamp with offset",
                raw.timestamp
            ))
        })?;

        Ok(Event {
            topic,
            event_id,
            timestamp,
            source,
            payload: raw.payload,
        })
    }
}

fn non_empty(field: &str, value: String) -> Result<String, AppError> {
    if value.is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(AppError::Validation(format!(
            "{field} must be at most {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    Ok(value)
}

/// Parse and validate an entire batch. Fails on the first invalid event so
/// that a malformed batch never partially mutates state.
pub fn parse_batch(request: PublishRequest) -> Result<Vec<Event>, AppError> {
    if request.events.is_empty() {
        return Err(AppError::Validation("events must not be empty".to_string()));
    }

    request.events.into_iter().map(Event::parse).collect()
}

/// An event as returned by the store, carrying its assigned sequence number
/// and the time the store recorded it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredEvent {
    pub seq: i64,
    pub topic: String,
    pub event_id: String,
    #[serde(with = "time::serde::rfc3339", rename = "timestamp")]
    pub event_time: OffsetDateTime,
    pub source: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}
