//! Integration tests for the Postgres stores.
//!
//! These tests need a disposable database; they reset the schema.
//! Run with: DATABASE_URL=postgres://... cargo test --test postgres_backend -- --ignored --test-threads=1

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lesson_forge::cache::ProducerMetadata;
use lesson_forge::coordinator::WorkerStore;
use lesson_forge::queue::{ItemOutcome, RetryBackoff};
use lesson_forge::storage::{Database, MigrationRunner};
use lesson_forge::{CacheStore, ContentIdentity, QueueError, QueueStatus, QueueStore};
use uuid::Uuid;

async fn fresh_database() -> Database {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL environment variable must be set for Postgres tests");
    let db = Database::connect(&url).await.expect("Should connect");
    MigrationRunner::new(db.pool().clone())
        .reset_database()
        .await
        .expect("Should reset schema");
    db.run_migrations().await.expect("Should migrate");
    db
}

fn identity(skill: &str) -> ContentIdentity {
    ContentIdentity::new("5", "Math", skill)
}

#[tokio::test]
#[ignore]
async fn test_migrations_are_idempotent() {
    let db = fresh_database().await;
    assert_eq!(db.run_migrations().await.expect("Should re-run"), 0);

    let states = MigrationRunner::new(db.pool().clone())
        .status()
        .await
        .expect("Should read status");
    assert!(!states.is_empty());
    assert!(states.iter().all(|s| s.applied_at.is_some()));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_migrations_apply_once() {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL environment variable must be set for Postgres tests");
    let db = Database::connect(&url).await.expect("Should connect");
    MigrationRunner::new(db.pool().clone())
        .reset_database()
        .await
        .expect("Should reset schema");

    let runs = futures::future::join_all((0..4).map(|_| {
        let runner = MigrationRunner::new(db.pool().clone());
        async move { runner.run_migrations().await.expect("Should migrate") }
    }))
    .await;

    let states = MigrationRunner::new(db.pool().clone()).status().await.unwrap();
    assert_eq!(runs.iter().sum::<usize>(), states.len());
}

#[tokio::test]
#[ignore]
async fn test_enqueue_coalesces_on_open_identity() {
    let db = fresh_database().await;
    let queue = db.queue(RetryBackoff::default());
    let now = Utc::now();

    let first = queue.enqueue(&identity("fractions"), 100, 3, now).await.unwrap();
    let second = queue.enqueue(&identity("fractions"), 10, 3, now).await.unwrap();

    assert!(!first.coalesced);
    assert!(second.coalesced);
    assert_eq!(first.item_id, second.item_id);
    let item = queue.get(first.item_id).await.unwrap().unwrap();
    assert_eq!(item.priority, 100);
}

#[tokio::test]
#[ignore]
async fn test_concurrent_leases_skip_locked_rows() {
    let db = fresh_database().await;
    let queue = db.queue(RetryBackoff::default());
    let now = Utc::now();
    for n in 0..20 {
        queue
            .enqueue(&identity(&format!("skill-{}", n)), 10, 0, now)
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let worker = Uuid::new_v4();
                let mut leased = Vec::new();
                while let Some(item) = queue.lease(worker, now).await.unwrap() {
                    leased.push(item.id);
                }
                leased
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
#[ignore]
async fn test_retry_then_fail() {
    let db = fresh_database().await;
    let queue = db.queue(RetryBackoff::new(Duration::ZERO, Duration::ZERO));
    let now = Utc::now();
    let worker = Uuid::new_v4();
    let enqueued = queue.enqueue(&identity("area"), 10, 1, now).await.unwrap();

    for expected in [QueueStatus::Pending, QueueStatus::Failed] {
        let item = queue.lease(worker, now).await.unwrap().unwrap();
        let item = queue
            .complete(item.id, worker, &ItemOutcome::transient("503"), now)
            .await
            .unwrap();
        assert_eq!(item.status, expected);
    }

    assert!(queue.lease(worker, now).await.unwrap().is_none());
    let latest = queue.latest_for(&identity("area").key()).await.unwrap().unwrap();
    assert_eq!(latest.id, enqueued.item_id);
}

#[tokio::test]
#[ignore]
async fn test_complete_requires_current_holder() {
    let db = fresh_database().await;
    let queue = db.queue(RetryBackoff::default());
    let now = Utc::now();
    let previous = Uuid::new_v4();
    let current = Uuid::new_v4();
    let enqueued = queue.enqueue(&identity("volume"), 10, 3, now).await.unwrap();

    queue.lease(previous, now).await.unwrap().unwrap();
    assert!(queue.requeue(enqueued.item_id, previous, now).await.unwrap());
    queue.lease(current, now).await.unwrap().unwrap();

    let result = queue
        .complete(enqueued.item_id, previous, &ItemOutcome::fatal("late"), now)
        .await;
    assert!(matches!(result, Err(QueueError::LeaseNotHeld { .. })));

    let item = queue.get(enqueued.item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Leased);
    assert_eq!(item.lease_holder, Some(current));
}

#[tokio::test]
#[ignore]
async fn test_cache_hit_count_and_eviction() {
    let db = fresh_database().await;
    let cache = db.cache();
    let t = Utc::now();
    let ttl = Duration::from_secs(60);
    let grace = Duration::from_secs(60);

    cache
        .put(&identity("ratios"), "x".to_string(), ProducerMetadata::new(3), ttl, t)
        .await
        .unwrap();
    for _ in 0..3 {
        assert!(cache.lookup(&identity("ratios"), t).await.unwrap().is_hit());
    }
    let entry = cache.peek(&identity("ratios").key()).await.unwrap().unwrap();
    assert_eq!(entry.hit_count, 3);
    assert!(entry.verify());

    let expired = t + chrono::Duration::seconds(61);
    assert_eq!(cache.evict_expired(grace, expired).await.unwrap(), 0);
    assert!(!cache.lookup(&identity("ratios"), expired).await.unwrap().is_hit());
    assert_eq!(
        cache
            .evict_expired(grace, expired + chrono::Duration::seconds(120))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
#[ignore]
async fn test_stale_workers_marked_offline() {
    let db = fresh_database().await;
    let workers = db.workers();
    let t0 = Utc::now();

    let stale = workers.register("worker-0", t0).await.unwrap();
    let fresh = workers.register("worker-1", t0).await.unwrap();
    let item = Uuid::new_v4();
    workers.mark_busy(stale.id, item, t0).await.unwrap();
    workers
        .heartbeat(fresh.id, t0 + chrono::Duration::seconds(120))
        .await
        .unwrap();

    let marked = workers
        .mark_stale_offline(t0 + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(marked.len(), 1);
    assert_eq!(marked[0].id, stale.id);
    assert_eq!(marked[0].current_item, Some(item));

    let record = workers.get(stale.id).await.unwrap().unwrap();
    assert_eq!(record.current_item, None);
}
