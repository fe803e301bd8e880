//! The worker pool: dequeues events from the `EventQueue` and applies them
//! to the `DedupStore`, retrying transient failures with exponential
//! backoff.
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::queue::EventQueue;
use crate::retry::RetryPolicy;
use crate::store::{is_transient, DedupStore};

const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Worker {
    name: String,
    queue: Arc<dyn EventQueue>,
    store: DedupStore,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl Worker {
    pub fn new(
        name: &str,
        queue: Arc<dyn EventQueue>,
        store: DedupStore,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            store,
            retry_policy,
            liveness,
        }
    }

    /// Run until `shutdown` fires. Reports healthy on every poll, whether or
    /// not an entry was found, so an idle worker is never mistaken for a
    /// stalled one.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.liveness.report_healthy().await;

            if *shutdown.borrow() {
                info!(worker = %self.name, "shutting down");
                return;
            }

            tokio::select! {
                entry = self.queue.dequeue(DEQUEUE_TIMEOUT) => {
                    match entry {
                        Ok(Some(entry)) => {
                            self.process(entry.id, entry.event).await;
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!(worker = %self.name, %error, "failed to dequeue, backing off");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Apply one entry, retrying transient `DedupStore` failures per
    /// `retry_policy` before dead-lettering. Exhausted retries are always
    /// logged and counted, never silently dropped.
    async fn process(&self, id: i64, event: crate::event::Event) {
        let mut attempt = 0u32;
        loop {
            match self.store.apply_event(&event).await {
                Ok(outcome) => {
                    metrics::counter!("aggregator_events_applied_total").increment(1);
                    if let Err(error) = self.queue.ack(id).await {
                        error!(worker = %self.name, %error, "failed to ack processed entry");
                    }
                    let _ = outcome;
                    return;
                }
                Err(error) if is_transient(&error) && attempt + 1 < self.retry_policy.max_attempts() => {
                    let delay = self.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        worker = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient failure applying event, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    error!(
                        worker = %self.name,
                        attempt,
                        %error,
                        "giving up on event after exhausting retries, dead-lettering"
                    );
                    metrics::counter!("aggregator_events_dead_lettered_total").increment(1);
                    if let Err(error) = self.queue.ack(id).await {
                        error!(worker = %self.name, %error, "failed to ack dead-lettered entry");
                    }
                    return;
                }
            }
        }
    }
}
