//! Event Queue integration tests: FIFO ordering, competing consumers, and
//! the visibility-timeout redelivery this implementation chose (see
//! `queue.rs`'s doc comment for the rationale).
use std::time::Duration;

use aggregator::event::Event;
use aggregator::queue::{EventQueue, PgEventQueue};
use sqlx::PgPool;
use time::OffsetDateTime;

fn sample(event_id: &str) -> Event {
    Event {
        topic: "orders".to_string(),
        event_id: event_id.to_string(),
        timestamp: OffsetDateTime::now_utc(),
        source: "test".to_string(),
        payload: serde_json::json!({}),
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn enqueue_dequeue_ack_round_trips_an_entry(pool: PgPool) {
    let queue = PgEventQueue::new(pool, "default", "worker-1", Duration::from_secs(30));

    queue.enqueue(sample("e1")).await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 1);

    let entry = queue
        .dequeue(Duration::from_millis(200))
        .await
        .unwrap()
        .expect("entry should be present");
    assert_eq!(entry.event.event_id, "e1");

    queue.ack(entry.id).await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn dequeue_preserves_fifo_order(pool: PgPool) {
    let queue = PgEventQueue::new(pool, "default", "worker-1", Duration::from_secs(30));

    for id in ["first", "second", "third"] {
        queue.enqueue(sample(id)).await.unwrap();
    }

    for expected in ["first", "second", "third"] {
        let entry = queue
            .dequeue(Duration::from_millis(200))
            .await
            .unwrap()
            .expect("entry should be present");
        assert_eq!(entry.event.event_id, expected);
        queue.ack(entry.id).await.unwrap();
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn dequeue_times_out_when_empty(pool: PgPool) {
    let queue = PgEventQueue::new(pool, "default", "worker-1", Duration::from_secs(30));

    let entry = queue.dequeue(Duration::from_millis(100)).await.unwrap();
    assert!(entry.is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn an_unacked_entry_is_redelivered_after_its_visibility_timeout(pool: PgPool) {
    let visibility_timeout = Duration::from_millis(150);
    let queue = PgEventQueue::new(pool, "default", "worker-1", visibility_timeout);

    queue.enqueue(sample("crash-prone")).await.unwrap();

    // First worker dequeues but crashes before acking.
    let first = queue
        .dequeue(Duration::from_millis(200))
        .await
        .unwrap()
        .expect("entry should be present");
    assert_eq!(first.event.event_id, "crash-prone");

    // Immediately after, the entry is locked and invisible to others.
    let immediate_retry = queue.dequeue(Duration::from_millis(50)).await.unwrap();
    assert!(immediate_retry.is_none());

    // Once the visibility timeout elapses, a surviving worker redelivers it.
    tokio::time::sleep(visibility_timeout).await;
    let redelivered = queue
        .dequeue(Duration::from_millis(200))
        .await
        .unwrap()
        .expect("entry should be redelivered");
    assert_eq!(redelivered.event.event_id, "crash-prone");

    queue.ack(redelivered.id).await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn two_queue_keys_do_not_see_each_others_entries(pool: PgPool) {
    let queue_a = PgEventQueue::new(pool.clone(), "queue-a", "worker-a", Duration::from_secs(30));
    let queue_b = PgEventQueue::new(pool, "queue-b", "worker-b", Duration::from_secs(30));

    queue_a.enqueue(sample("only-in-a")).await.unwrap();

    assert_eq!(queue_a.size().await.unwrap(), 1);
    assert_eq!(queue_b.size().await.unwrap(), 0);
    assert!(queue_b.dequeue(Duration::from_millis(50)).await.unwrap().is_none());
}
