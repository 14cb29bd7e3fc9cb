//! Generation queue.
//!
//! The queue is the ordered backlog of content waiting to be produced. Items
//! are keyed by content identity, and at most one item per identity is open
//! (`pending` or `leased`) at any time: enqueueing a duplicate coalesces into
//! the open item instead of creating a second one.
//!
//! # Backends
//!
//! - [`MemoryQueue`]: per-item mutexes with `try_lock` claiming
//! - [`crate::storage::PgQueue`]: `FOR UPDATE SKIP LOCKED` leasing
//!
//! Both backends implement [`QueueStore`] and share the state transitions in
//! [`QueueItem`], so they behave identically for the same inputs.
//!
//! # Example
//!
//! ```rust,ignore
//! use lesson_forge::identity::ContentIdentity;
//! use lesson_forge::queue::{ItemOutcome, MemoryQueue, QueueStore, RetryBackoff};
//! use chrono::Utc;
//!
//! let queue = MemoryQueue::new(RetryBackoff::default());
//! let identity = ContentIdentity::new("5", "Math", "fractions");
//!
//! let enqueued = queue.enqueue(&identity, 10, 3, Utc::now()).await?;
//! let item = queue.lease(worker_id, Utc::now()).await?.expect("one pending item");
//! queue.complete(item.id, worker_id, &ItemOutcome::success(entry_id, 1200), Utc::now()).await?;
//! ```

pub mod item;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueError;
use crate::identity::ContentIdentity;

pub use item::{Enqueued, ItemOutcome, QueueItem, QueueStats, QueueStatus, RetryBackoff};
pub use memory::MemoryQueue;

/// Storage contract for the generation queue.
///
/// Every mutating call takes the current time explicitly so that retry
/// schedules and lease timestamps are deterministic under test.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Adds work for an identity, coalescing into the open item if one exists.
    ///
    /// A coalesced `pending` item takes the numeric maximum of its priority
    /// and `priority`. A `leased` item is returned unchanged.
    async fn enqueue(
        &self,
        identity: &ContentIdentity,
        priority: i32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, QueueError>;

    /// Claims the best leasable item for `worker_id`.
    ///
    /// Items are ordered by priority ascending, then `not_before` ascending.
    /// Candidates being claimed concurrently are skipped, never awaited.
    async fn lease(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError>;

    /// Records the outcome of an item leased by `holder`.
    ///
    /// The holder is checked atomically with the update, so a worker whose
    /// lease was reclaimed gets `QueueError::LeaseNotHeld` even if another
    /// worker has since leased the item.
    async fn complete(
        &self,
        item_id: Uuid,
        holder: Uuid,
        outcome: &ItemOutcome,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError>;

    /// Cancels a pending item.
    async fn cancel(&self, item_id: Uuid, now: DateTime<Utc>) -> Result<QueueItem, QueueError>;

    /// Returns an item leased by `holder` to `pending` without using a retry.
    ///
    /// Returns `false` if the item is no longer leased by `holder`.
    async fn requeue(
        &self,
        item_id: Uuid,
        holder: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    /// Fetches an item by id.
    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>, QueueError>;

    /// Fetches the open item for an identity key, if any.
    async fn find_open(&self, identity_key: &str) -> Result<Option<QueueItem>, QueueError>;

    /// Fetches the most recently created item for an identity key.
    async fn latest_for(&self, identity_key: &str) -> Result<Option<QueueItem>, QueueError>;

    /// Counts items per status.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Items that reached `completed` or `failed` in `[from, to)`.
    async fn finished_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError>;

    /// Deletes terminal items last updated before `older_than`.
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError>;
}
