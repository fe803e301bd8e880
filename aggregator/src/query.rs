//! Read-only projections of the `DedupStore` plus queue depth and process
//! health. Handlers here do little more than shape a store query into the
//! wire JSON response.
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::event::StoredEvent;
use crate::router::AppState;

const DEFAULT_EVENTS_LIMIT: i64 = 100;
const MAX_EVENTS_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub topic: String,
    pub limit: Option<i64>,
}

/// `GET /events?topic=...&limit=...`. `limit=0` yields an empty array; a
/// negative limit is a validation error; an oversize limit is silently
/// capped rather than rejected.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<StoredEvent>>, AppError> {
    let limit = match query.limit {
        None => DEFAULT_EVENTS_LIMIT,
        Some(limit) if limit < 0 => {
            return Err(AppError::Validation("limit must not be negative".to_string()));
        }
        Some(limit) => limit.min(MAX_EVENTS_LIMIT),
    };

    let events = state.store.events_by_topic(&query.topic, limit).await?;
    Ok(Json(events))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
    pub dedup_rate_percent: f64,
    pub topics: Vec<String>,
    pub uptime_seconds: i64,
}

/// A pure function of the current counters, computed fresh on every call
/// rather than cached.
pub fn dedup_rate_percent(received: i64, duplicate_dropped: i64) -> f64 {
    duplicate_dropped as f64 / received.max(1) as f64 * 100.0
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let counters = state.store.counters().await?;
    let topics = state.store.topics().await?;
    let uptime_seconds = (state.timesource.now() - state.started_at).whole_seconds();

    Ok(Json(StatsResponse {
        received: counters.received,
        unique_processed: counters.unique_processed,
        duplicate_dropped: counters.duplicate_dropped,
        dedup_rate_percent: dedup_rate_percent(counters.received, counters.duplicate_dropped),
        topics,
        uptime_seconds,
    }))
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub queue_size: i64,
}

pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStatsResponse>, AppError> {
    let queue_size = state.queue.size().await?;
    Ok(Json(QueueStatsResponse { queue_size }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// `GET /health`: `"healthy"` only while every registered component
/// (HTTP listener, each worker) has reported within its deadline.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health.get_status();
    let body = HealthResponse {
        status: if status.healthy { "healthy" } else { "degraded" },
    };
    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// `POST /metrics/reset`: operational aid, zeroes the counters without
/// touching stored events.
pub async fn reset_metrics(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.store.reset_metrics().await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_rate_is_zero_with_no_traffic() {
        assert_eq!(dedup_rate_percent(0, 0), 0.0);
    }

    #[test]
    fn dedup_rate_is_a_pure_function_of_counters() {
        assert_eq!(dedup_rate_percent(100, 30), 30.0);
        assert_eq!(dedup_rate_percent(3, 1), 100.0 / 3.0);
    }
}
