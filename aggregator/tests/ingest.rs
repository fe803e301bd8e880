//! Router-level HTTP tests exercising `/publish`, `/events`, and `/stats`
//! end-to-end against a scratch Postgres database, via
//! `tower::ServiceExt::oneshot` rather than a real listener.
use std::sync::Arc;

use aggregator::queue::{EventQueue, InMemoryEventQueue};
use aggregator::router::{router, AppState};
use aggregator::store::DedupStore;
use aggregator::time::SystemTime;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;

fn test_state(pool: PgPool) -> AppState {
    AppState {
        store: DedupStore::from_pool(pool),
        queue: Arc::new(InMemoryEventQueue::new()),
        timesource: Arc::new(SystemTime),
        started_at: time::OffsetDateTime::now_utc(),
        health: health::HealthRegistry::new("liveness"),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[sqlx::test(migrations = "./migrations")]
async fn publish_atomic_mode_dedups_within_a_batch(pool: PgPool) {
    let app = router(test_state(pool), false);

    let payload = json!({
        "events": [
            {"topic": "batch-topic", "event_id": "batch-001", "timestamp": "2024-12-12T10:00:00Z", "source": "demo", "payload": {}},
            {"topic": "batch-topic", "event_id": "batch-002", "timestamp": "2024-12-12T10:00:00Z", "source": "demo", "payload": {}},
            {"topic": "batch-topic", "event_id": "batch-003", "timestamp": "2024-12-12T10:00:00Z", "source": "demo", "payload": {}},
            {"topic": "batch-topic", "event_id": "batch-001", "timestamp": "2024-12-12T10:00:00Z", "source": "demo", "payload": {}}
        ]
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/publish?atomic=true")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["accepted"], 4);
    assert_eq!(body["inserted"], 3);
    assert_eq!(body["duplicate"], 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn publish_empty_batch_is_rejected_without_mutating_state(pool: PgPool) {
    let state = test_state(pool);
    let app = router(state.clone(), false);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/publish")
                .header("content-type", "application/json")
                .body(Body::from(json!({"events": []}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let counters = state.store.counters().await.unwrap();
    assert_eq!(counters.received, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn publish_queued_mode_then_stats_reflects_received(pool: PgPool) {
    let state = test_state(pool);
    let app = router(state.clone(), false);

    let payload = json!({
        "events": [
            {"topic": "demo-topic", "event_id": "event-001", "timestamp": "2024-12-12T10:00:00Z", "source": "demo", "payload": {"m": "hi"}}
        ]
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/publish")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["queued"], 1);

    let counters = state.store.counters().await.unwrap();
    assert_eq!(counters.received, 1);
    assert_eq!(state.queue.size().await.unwrap(), 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn events_endpoint_returns_empty_array_for_limit_zero(pool: PgPool) {
    let state = test_state(pool);
    state
        .store
        .apply_event(&aggregator::event::Event {
            topic: "demo-topic".to_string(),
            event_id: "event-001".to_string(),
            timestamp: time::OffsetDateTime::now_utc(),
            source: "demo".to_string(),
            payload: json!({}),
        })
        .await
        .unwrap();
    let app = router(state, false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/events?topic=demo-topic&limit=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Vec<Value> = serde_json::from_slice(
        &response.into_body().collect().await.unwrap().to_bytes(),
    )
    .unwrap();
    assert!(body.is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn health_reports_degraded_when_no_component_has_reported(pool: PgPool) {
    let app = router(test_state(pool), false);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
}
