//! Process assembly: connects the `DedupStore`, builds the `EventQueue`,
//! spawns the worker pool alongside the HTTP listener, and brings both down
//! together on shutdown (config in, listener in, shutdown future in,
//! `axum::serve` out), with the worker pool spawned side by side with the
//! listener since both run in this single process.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use health::HealthRegistry;

use crate::config::Config;
use crate::queue::{EventQueue, InMemoryEventQueue, PgEventQueue};
use crate::retry::RetryPolicy;
use crate::router::{self, AppState};
use crate::store::DedupStore;
use crate::time::SystemTime;
use crate::worker::Worker;

const WORKER_HEALTH_DEADLINE: Duration = Duration::seconds(60);
const LISTENER_HEALTH_DEADLINE: Duration = Duration::seconds(30);
const HEARTBEAT_INTERVAL: StdDuration = StdDuration::from_secs(10);

fn build_queue(config: &Config, pool: &sqlx::PgPool, worker_name: &str) -> Arc<dyn EventQueue> {
    Arc::new(PgEventQueue::new(
        pool.clone(),
        &config.queue_key,
        worker_name,
        config.visibility_timeout.0,
    ))
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = DedupStore::connect(&config.database_url)
        .await
        .expect("failed to connect to dedup store");
    store.migrate().await.expect("failed to run migrations");
    let pool = store.pool();

    let health = HealthRegistry::new("liveness");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shared_inmemory = config
        .use_inmemory_queue
        .then(|| Arc::new(InMemoryEventQueue::new()) as Arc<dyn EventQueue>);

    let ingestion_queue = shared_inmemory.clone().unwrap_or_else(|| {
        build_queue(&config, &pool, "ingestion")
    });

    let mut worker_handles = Vec::with_capacity(config.worker_count);
    if config.disable_workers {
        tracing::info!("DISABLE_WORKERS set, not starting the worker pool");
    } else {
        for index in 0..config.worker_count {
            let name = format!("worker-{index}");
            let queue = shared_inmemory.clone().unwrap_or_else(|| {
                build_queue(&config, &pool, &name)
            });
            let worker_store = DedupStore::from_pool(pool.clone());
            let liveness = health.register(name.clone(), WORKER_HEALTH_DEADLINE).await;
            let worker = Worker::new(&name, queue, worker_store, RetryPolicy::default(), liveness);
            let rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                worker.run(rx).await;
            }));
        }
    }

    let listener_liveness = health
        .register("http".to_string(), LISTENER_HEALTH_DEADLINE)
        .await;
    let mut heartbeat_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            listener_liveness.report_healthy().await;
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                _ = heartbeat_shutdown.changed() => {
                    if *heartbeat_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    let state = AppState {
        store,
        queue: ingestion_queue,
        timesource: Arc::new(SystemTime),
        started_at: time::OffsetDateTime::now_utc(),
        health,
    };
    let app = router::router(state, config.export_prometheus);

    tracing::info!(addr = ?listener.local_addr().unwrap(), "listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("server error");

    for handle in worker_handles {
        let _ = handle.await;
    }
}
