//! The Event Queue: a durable FIFO buffer between ingestion and the worker
//! pool, implemented as a competing-consumers queue over a Postgres table
//! using `FOR UPDATE SKIP LOCKED`, plus an in-memory test double.
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::event::Event;
use crate::store::classify;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub event: Event,
}

/// A durable FIFO queue between ingestion and the worker pool.
///
/// **Delivery semantics:** this queue uses a visibility timeout rather than
/// deleting an entry the instant it is dequeued. A worker must explicitly
/// `ack` an entry after `apply_event` commits; if it crashes first, the
/// entry becomes eligible for redelivery once its lock ages past the
/// visibility timeout. This upgrades delivery to at-least-once including
/// worker crashes, at the cost of the idempotency layer occasionally
/// seeing a legitimate redelivered duplicate (masked by the Dedup Store).
#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn enqueue(&self, event: Event) -> Result<(), AppError>;

    /// Block up to `timeout` for the next entry. Returns `None` on timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueueEntry>, AppError>;

    /// Acknowledge successful processing, permanently removing the entry.
    async fn ack(&self, id: i64) -> Result<(), AppError>;

    async fn size(&self) -> Result<i64, AppError>;
}

pub struct PgEventQueue {
    pool: PgPool,
    queue: String,
    worker: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgEventQueue {
    pub fn new(pool: PgPool, queue: &str, worker: &str, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            queue: queue.to_owned(),
            worker: worker.to_owned(),
            visibility_timeout,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl EventQueue for PgEventQueue {
    async fn enqueue(&self, event: Event) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO queue_entries (queue, topic, event_id, event_time, source, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&self.queue)
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(&event.payload)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueueEntry>, AppError> {
        let deadline = Instant::now() + timeout;
        let visibility_secs = self.visibility_timeout.as_secs_f64();

        loop {
            let row: Option<(i64, String, String, time::OffsetDateTime, String, serde_json::Value)> =
                sqlx::query_as(
                    r#"
                    UPDATE queue_entries
                    SET locked_at = now(), locked_by = $1
                    WHERE id = (
                        SELECT id FROM queue_entries
                        WHERE queue = $2
                          AND (locked_at IS NULL OR locked_at < now() - ($3 || ' seconds')::interval)
                        ORDER BY id
                        FOR UPDATE SKIP LOCKED
                        LIMIT 1
                    )
                    RETURNING id, topic, event_id, event_time, source, payload
                    "#,
                )
                .bind(&self.worker)
                .bind(&self.queue)
                .bind(visibility_secs)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)?;

            if let Some((id, topic, event_id, event_time, source, payload)) = row {
                return Ok(Some(QueueEntry {
                    id,
                    event: Event {
                        topic,
                        event_id,
                        timestamp: event_time,
                        source,
                        payload,
                    },
                }));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(timeout)).await;
        }
    }

    async fn ack(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("DELETE FROM queue_entries WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn size(&self) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM queue_entries WHERE queue = $1")
            .bind(&self.queue)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(row.0)
    }
}

/// An in-memory test double, not required to be durable. No visibility
/// timeout: tests run single-process and don't exercise crash recovery,
/// so a dequeued entry is simply removed.
#[derive(Default)]
pub struct InMemoryEventQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    next_id: Mutex<i64>,
}

impl InMemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn enqueue(&self, event: Event) -> Result<(), AppError> {
        let mut next_id = self.next_id.lock().await;
        *next_id += 1;
        let id = *next_id;
        drop(next_id);

        self.entries.lock().await.push_back(QueueEntry { id, event });
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueueEntry>, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.entries.lock().await.pop_front() {
                return Ok(Some(entry));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10).min(timeout)).await;
        }
    }

    async fn ack(&self, _id: i64) -> Result<(), AppError> {
        // Entries are removed on dequeue in this test double; nothing to do.
        Ok(())
    }

    async fn size(&self) -> Result<i64, AppError> {
        Ok(self.entries.lock().await.len() as i64)
    }
}
