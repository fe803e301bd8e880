//! `POST /publish`: validates a batch, then routes it to the queued or
//! atomic path depending on `?atomic=`.
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::event::{parse_batch, PublishRequest};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct PublishQuery {
    #[serde(default)]
    pub atomic: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PublishResponse {
    Queued { accepted: i64, queued: i64 },
    Atomic { accepted: i64, inserted: i64, duplicate: i64 },
}

pub async fn publish(
    State(state): State<AppState>,
    Query(query): Query<PublishQuery>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, AppError> {
    let events = parse_batch(request)?;
    let accepted = events.len() as i64;

    if query.atomic {
        let (inserted, duplicate) = state.store.apply_batch(&events).await?;
        return Ok(Json(PublishResponse::Atomic {
            accepted,
            inserted,
            duplicate,
        }));
    }

    state.store.increment_received(accepted).await?;
    for event in &events {
        state
            .queue
            .enqueue(event.clone())
            .await
            .map_err(|error| AppError::QueueUnavailable(error.to_string()))?;
    }

    Ok(Json(PublishResponse::Queued {
        accepted,
        queued: accepted,
    }))
}
