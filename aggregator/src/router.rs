//! Router assembly: wires the HTTP surface onto shared state (`State`
//! struct + `with_state`, `TraceLayer`, a conditionally-mounted
//! `/metrics`).
use std::future::ready;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;

use crate::ingest;
use crate::metrics::{setup_metrics_recorder, track_metrics};
use crate::query;
use crate::queue::EventQueue;
use crate::store::DedupStore;
use crate::time::TimeSource;
use health::HealthRegistry;

#[derive(Clone)]
pub struct AppState {
    pub store: DedupStore,
    pub queue: Arc<dyn EventQueue>,
    pub timesource: Arc<dyn TimeSource>,
    pub started_at: OffsetDateTime,
    pub health: HealthRegistry,
}

async fn index() -> &'static str {
    "aggregator"
}

pub fn router(state: AppState, export_prometheus: bool) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/publish", post(ingest::publish))
        .route("/events", get(query::events))
        .route("/stats", get(query::stats))
        .route("/queue/stats", get(query::queue_stats))
        .route("/health", get(query::health))
        .route("/metrics/reset", post(query::reset_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    if export_prometheus {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
