//! The Dedup Store: durable, crash-safe persistence of `StoredEvent`s and
//! `Counters`, keyed uniquely by `(topic, event_id)`.
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;

use crate::error::AppError;
use crate::event::{Event, StoredEvent};

/// The outcome of attempting to insert an event. Not an error channel: a
/// duplicate is a normal, expected result, never a thrown constraint
/// violation the caller has to catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryInsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Counters {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
}

#[derive(Clone)]
pub struct DedupStore {
    pool: PgPool,
}

impl DedupStore {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(|error| AppError::Fatal(error.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| AppError::Fatal(error.to_string()))
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Atomically insert an event if its `(topic, event_id)` key is new.
    /// Two concurrent inserts of the same key serialize on the unique
    /// constraint; exactly one observes `Inserted`.
    async fn try_insert<'e, E>(executor: E, event: &Event) -> Result<TryInsertOutcome, AppError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO events (topic, event_id, event_time, source, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (topic, event_id) DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(&event.payload)
        .fetch_optional(executor)
        .await
        .map_err(classify)?;

        Ok(match row {
            Some(_) => TryInsertOutcome::Inserted,
            None => TryInsertOutcome::Duplicate,
        })
    }

    /// `try_insert` plus an atomic counter delta, committed as one unit.
    pub async fn apply_event(&self, event: &Event) -> Result<TryInsertOutcome, AppError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let outcome = Self::try_insert(&mut *tx, event).await?;

        match outcome {
            TryInsertOutcome::Inserted => {
                sqlx::query("UPDATE metrics SET unique_processed = unique_processed + 1")
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
            }
            TryInsertOutcome::Duplicate => {
                sqlx::query("UPDATE metrics SET duplicate_dropped = duplicate_dropped + 1")
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
            }
        }

        tx.commit().await.map_err(classify)?;
        Ok(outcome)
    }

    /// Apply a whole batch in one transaction (atomic mode), including the
    /// `received` delta for the batch, so `received`, `unique_processed`,
    /// and `duplicate_dropped` all move together in one commit. A
    /// concurrent `/stats` read can never see the processed counters run
    /// ahead of `received`. Within the batch, repeats of the same key are
    /// resolved in input order: the first becomes `Inserted`, the rest
    /// `Duplicate`, regardless of which the caller iterates first.
    pub async fn apply_batch(&self, events: &[Event]) -> Result<(i64, i64), AppError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let mut inserted = 0i64;
        let mut duplicate = 0i64;
        for event in events {
            match Self::try_insert(&mut *tx, event).await? {
                TryInsertOutcome::Inserted => inserted += 1,
                TryInsertOutcome::Duplicate => duplicate += 1,
            }
        }

        sqlx::query(
            "UPDATE metrics SET received = received + $1, unique_processed = unique_processed + $2, duplicate_dropped = duplicate_dropped + $3",
        )
        .bind(events.len() as i64)
        .bind(inserted)
        .bind(duplicate)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok((inserted, duplicate))
    }

    pub async fn increment_received(&self, n: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE metrics SET received = received + $1")
            .bind(n)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    pub async fn events_by_topic(
        &self,
        topic: &str,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, AppError> {
        sqlx::query_as(
            r#"
            SELECT seq, topic, event_id, event_time, source, payload, processed_at
            FROM events
            WHERE topic = $1
            ORDER BY event_time DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    pub async fn counters(&self) -> Result<Counters, AppError> {
        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT received, unique_processed, duplicate_dropped FROM metrics WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(Counters {
            received: row.0,
            unique_processed: row.1,
            duplicate_dropped: row.2,
        })
    }

    pub async fn topics(&self) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT topic FROM events")
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Operational aid: zeroes the counters. Does not delete stored events,
    /// so the counters and the event table go out of sync until the next
    /// time they're both reset together.
    pub async fn reset_metrics(&self) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE metrics SET received = 0, unique_processed = 0, duplicate_dropped = 0",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }
}

/// Classify a `sqlx::Error` by Postgres SQLSTATE: serialization failures
/// and deadlocks are transient and worth retrying, everything else
/// (missing schema, bad credentials, I/O) is treated as fatal.
pub fn classify(error: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(ref db_err) = error {
        if let Some(code) = db_err.code() {
            if code == "40001" || code == "40P01" {
                return AppError::Transient(error.to_string());
            }
        }
    }
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => AppError::Transient(error.to_string()),
        other => AppError::Fatal(other.to_string()),
    }
}

pub fn is_transient(error: &AppError) -> bool {
    matches!(error, AppError::Transient(_))
}
