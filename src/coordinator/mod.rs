//! Worker coordination.
//!
//! This module tracks the workers that run the content producer and hands
//! them exclusive leases on queue items:
//!
//! - **WorkerStore**: registry of worker records (memory or Postgres)
//! - **WorkerCoordinator**: register, heartbeat, lease, report, reconcile
//! - **WorkerPool**: local async workers driving the coordinator
//!
//! # Architecture
//!
//! ```text
//!    ┌─────────────┐   lease / report   ┌──────────────────┐
//!    │ WorkerPool  │ ─────────────────▶ │ WorkerCoordinator│
//!    │ (N tasks)   │ ◀───────────────── │                  │
//!    └──────┬──────┘      QueueItem     └────┬────────┬────┘
//!           │ produce + put                  │        │
//!           ▼                                ▼        ▼
//!    ┌─────────────┐                   ┌─────────┐ ┌──────────┐
//!    │ CacheStore  │                   │ Queue   │ │ Workers  │
//!    └─────────────┘                   └─────────┘ └──────────┘
//! ```
//!
//! A worker owns at most one item at a time (`current_item`). If its
//! heartbeat goes stale, reconciliation marks it offline and returns that
//! item to `pending`.

pub mod memory;
pub mod pool;
pub mod service;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoordinatorError;

pub use memory::MemoryWorkerStore;
pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
pub use service::WorkerCoordinator;
pub use worker::{WorkerRecord, WorkerStatus};

/// Storage contract for worker records.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Registers a worker by name, or resets an existing one to `idle`.
    async fn register(&self, name: &str, now: DateTime<Utc>)
        -> Result<WorkerRecord, CoordinatorError>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkerRecord>, CoordinatorError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<WorkerRecord>, CoordinatorError>;

    /// All workers, ordered by name.
    async fn list(&self) -> Result<Vec<WorkerRecord>, CoordinatorError>;

    /// Refreshes the heartbeat of a known worker.
    async fn heartbeat(&self, id: Uuid, now: DateTime<Utc>)
        -> Result<WorkerRecord, CoordinatorError>;

    /// Marks a worker busy on `item_id`. Fails for `offline`/`error` workers.
    async fn mark_busy(
        &self,
        id: Uuid,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError>;

    /// Counts an outcome, clears the current item and returns a busy worker to idle.
    async fn record_outcome(
        &self,
        id: Uuid,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError>;

    async fn set_status(
        &self,
        id: Uuid,
        status: WorkerStatus,
    ) -> Result<WorkerRecord, CoordinatorError>;

    /// Marks live workers with a heartbeat older than `cutoff` offline.
    ///
    /// Returns their records as they were before the change, so the caller
    /// can see which items they held.
    async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, CoordinatorError>;
}
