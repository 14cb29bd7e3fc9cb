//! Generation queue properties against the in-memory backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lesson_forge::queue::{ItemOutcome, MemoryQueue, QueueStatus, QueueStore, RetryBackoff};
use lesson_forge::{ContentIdentity, QueueError};
use uuid::Uuid;

fn identity(skill: &str) -> ContentIdentity {
    ContentIdentity::new("5", "Math", skill)
}

fn immediate_retries() -> Arc<MemoryQueue> {
    Arc::new(MemoryQueue::new(RetryBackoff::new(
        Duration::ZERO,
        Duration::ZERO,
    )))
}

#[tokio::test]
async fn test_duplicate_enqueues_coalesce() {
    let queue = immediate_retries();
    let now = Utc::now();

    let first = queue.enqueue(&identity("fractions"), 100, 3, now).await.unwrap();
    let second = queue.enqueue(&identity("fractions"), 10, 3, now).await.unwrap();
    let third = queue.enqueue(&identity("fractions"), 50, 3, now).await.unwrap();

    assert!(!first.coalesced);
    assert!(second.coalesced && third.coalesced);
    assert_eq!(second.item_id, first.item_id);
    assert_eq!(third.item_id, first.item_id);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);

    // Coalescing keeps the numerically larger priority.
    let item = queue.get(first.item_id).await.unwrap().unwrap();
    assert_eq!(item.priority, 100);
}

#[tokio::test]
async fn test_concurrent_enqueues_create_one_item() {
    let queue = immediate_retries();
    let now = Utc::now();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(&identity("ratios"), 10, 3, now).await })
        })
        .collect();

    let mut ids = HashSet::new();
    let mut created = 0;
    for handle in handles {
        let enqueued = handle.await.unwrap().unwrap();
        ids.insert(enqueued.item_id);
        if !enqueued.coalesced {
            created += 1;
        }
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);
}

#[tokio::test]
async fn test_concurrent_leases_are_exclusive() {
    let queue = immediate_retries();
    let now = Utc::now();
    for n in 0..64 {
        queue
            .enqueue(&identity(&format!("skill-{}", n)), 10, 0, now)
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let worker = Uuid::new_v4();
                let mut leased = Vec::new();
                while let Some(item) = queue.lease(worker, now).await.unwrap() {
                    assert_eq!(item.lease_holder, Some(worker));
                    leased.push(item.id);
                    tokio::task::yield_now().await;
                }
                leased
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "item {} leased twice", id);
        }
    }

    assert_eq!(seen.len(), 64);
    assert_eq!(queue.stats().await.unwrap().leased, 64);
}

#[tokio::test]
async fn test_lease_order_is_priority_then_age() {
    let queue = immediate_retries();
    let now = Utc::now();

    let low = queue.enqueue(&identity("a"), 100, 0, now).await.unwrap();
    let older = queue
        .enqueue(&identity("b"), 10, 0, now + chrono::Duration::seconds(1))
        .await
        .unwrap();
    let newer = queue
        .enqueue(&identity("c"), 10, 0, now + chrono::Duration::seconds(2))
        .await
        .unwrap();

    let later = now + chrono::Duration::seconds(10);
    let worker = Uuid::new_v4();
    let order: Vec<Uuid> = [
        queue.lease(worker, later).await.unwrap(),
        queue.lease(worker, later).await.unwrap(),
        queue.lease(worker, later).await.unwrap(),
    ]
    .into_iter()
    .map(|item| item.unwrap().id)
    .collect();

    assert_eq!(order, vec![older.item_id, newer.item_id, low.item_id]);
}

#[tokio::test]
async fn test_retry_bound() {
    let queue = immediate_retries();
    let now = Utc::now();
    let worker = Uuid::new_v4();

    let enqueued = queue.enqueue(&identity("decimals"), 10, 2, now).await.unwrap();

    for attempt in 0..3 {
        let item = queue
            .lease(worker, now)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("attempt {} was not leasable", attempt));
        assert_eq!(item.id, enqueued.item_id);
        assert_eq!(item.retry_count, attempt);

        let item = queue
            .complete(item.id, worker, &ItemOutcome::transient("timeout"), now)
            .await
            .unwrap();
        let expected = if attempt < 2 {
            QueueStatus::Pending
        } else {
            QueueStatus::Failed
        };
        assert_eq!(item.status, expected);
    }

    assert!(queue.lease(worker, now).await.unwrap().is_none());
    let item = queue.get(enqueued.item_id).await.unwrap().unwrap();
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_backoff_delays_next_lease() {
    let queue = Arc::new(MemoryQueue::new(RetryBackoff::new(
        Duration::from_secs(30),
        Duration::from_secs(300),
    )));
    let now = Utc::now();
    let worker = Uuid::new_v4();

    queue.enqueue(&identity("area"), 10, 3, now).await.unwrap();
    let item = queue.lease(worker, now).await.unwrap().unwrap();
    queue
        .complete(item.id, worker, &ItemOutcome::transient("503"), now)
        .await
        .unwrap();

    assert!(queue
        .lease(worker, now + chrono::Duration::seconds(29))
        .await
        .unwrap()
        .is_none());
    assert!(queue
        .lease(worker, now + chrono::Duration::seconds(30))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_completion_by_previous_holder_is_rejected() {
    let queue = immediate_retries();
    let now = Utc::now();
    let previous = Uuid::new_v4();
    let current = Uuid::new_v4();

    let enqueued = queue.enqueue(&identity("angles"), 10, 3, now).await.unwrap();
    queue.lease(previous, now).await.unwrap().unwrap();
    assert!(queue.requeue(enqueued.item_id, previous, now).await.unwrap());
    queue.lease(current, now).await.unwrap().unwrap();

    let result = queue
        .complete(enqueued.item_id, previous, &ItemOutcome::fatal("late"), now)
        .await;
    assert!(matches!(result, Err(QueueError::LeaseNotHeld { .. })));

    let item = queue
        .complete(enqueued.item_id, current, &ItemOutcome::success(Uuid::new_v4(), 10), now)
        .await
        .unwrap();
    assert_eq!(item.status, QueueStatus::Completed);
}

#[tokio::test]
async fn test_cancel_only_pending() {
    let queue = immediate_retries();
    let now = Utc::now();

    let pending = queue.enqueue(&identity("x"), 10, 0, now).await.unwrap();
    let cancelled = queue.cancel(pending.item_id, now).await.unwrap();
    assert_eq!(cancelled.status, QueueStatus::Cancelled);

    // The identity is free again once its item is closed.
    let fresh = queue.enqueue(&identity("x"), 10, 0, now).await.unwrap();
    assert!(!fresh.coalesced);
    assert_ne!(fresh.item_id, pending.item_id);

    queue.lease(Uuid::new_v4(), now).await.unwrap().unwrap();
    assert!(queue.cancel(fresh.item_id, now).await.is_err());
}
