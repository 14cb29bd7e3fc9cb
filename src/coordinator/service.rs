//! Lease and liveness bookkeeping on top of the queue and worker stores.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoordinatorError, QueueError};
use crate::metrics::MetricsCollector;
use crate::queue::{ItemOutcome, QueueItem, QueueStatus, QueueStore};

use super::worker::{WorkerRecord, WorkerStatus};
use super::WorkerStore;

/// Hands out leases to registered workers and recovers stranded ones.
pub struct WorkerCoordinator {
    queue: Arc<dyn QueueStore>,
    workers: Arc<dyn WorkerStore>,
    staleness: chrono::Duration,
    metrics: MetricsCollector,
}

impl WorkerCoordinator {
    /// Creates a coordinator.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the leases are taken from
    /// * `workers` - Worker registry
    /// * `staleness` - Heartbeat age after which a worker is considered dead
    pub fn new(
        queue: Arc<dyn QueueStore>,
        workers: Arc<dyn WorkerStore>,
        staleness: Duration,
    ) -> Self {
        Self {
            queue,
            workers,
            staleness: chrono::Duration::from_std(staleness)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the queue this coordinator leases from.
    pub fn queue(&self) -> &Arc<dyn QueueStore> {
        &self.queue
    }

    /// Registers a worker by name. Re-registration resets it to `idle`.
    pub async fn register(&self, name: &str) -> Result<WorkerRecord, CoordinatorError> {
        self.register_at(name, Utc::now()).await
    }

    pub async fn register_at(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError> {
        let previous = self.workers.find_by_name(name).await?;
        let worker = self.workers.register(name, now).await?;

        // A worker that restarts before reconciliation notices it leaves its lease behind.
        if let Some(WorkerRecord {
            id,
            current_item: Some(item_id),
            ..
        }) = previous
        {
            if self.queue.requeue(item_id, id, now).await? {
                warn!(worker_id = %id, item_id = %item_id, "Requeued lease held by re-registered worker");
            }
        }

        info!(worker_id = %worker.id, name = %worker.name, "Worker registered");
        Ok(worker)
    }

    /// Refreshes a worker's heartbeat.
    pub async fn heartbeat(&self, worker_id: Uuid) -> Result<WorkerRecord, CoordinatorError> {
        self.heartbeat_at(worker_id, Utc::now()).await
    }

    pub async fn heartbeat_at(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError> {
        self.workers.heartbeat(worker_id, now).await
    }

    /// Leases the next item to a worker.
    ///
    /// Returns `Ok(None)` when nothing is leasable. On success the worker is
    /// `busy` on the item with a refreshed heartbeat.
    ///
    /// # Errors
    ///
    /// - `WorkerNotFound` for unknown workers
    /// - `WorkerUnavailable` for `offline` or `error` workers
    /// - `WorkerBusy` if the worker already holds an item
    pub async fn lease(&self, worker_id: Uuid) -> Result<Option<QueueItem>, CoordinatorError> {
        self.lease_at(worker_id, Utc::now()).await
    }

    pub async fn lease_at(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, CoordinatorError> {
        let worker = self
            .workers
            .get(worker_id)
            .await?
            .ok_or(CoordinatorError::WorkerNotFound(worker_id))?;

        if !worker.status.accepts_work() {
            return Err(CoordinatorError::WorkerUnavailable {
                id: worker_id,
                status: worker.status.to_string(),
            });
        }
        if let Some(item) = worker.current_item {
            return Err(CoordinatorError::WorkerBusy {
                worker: worker_id,
                item,
            });
        }

        let Some(item) = self.queue.lease(worker_id, now).await? else {
            self.workers.heartbeat(worker_id, now).await?;
            return Ok(None);
        };

        if let Err(e) = self.workers.mark_busy(worker_id, item.id, now).await {
            // The worker changed state between the check and the claim.
            self.queue.requeue(item.id, worker_id, now).await?;
            return Err(e);
        }

        self.metrics.record_lease();
        debug!(worker_id = %worker_id, item_id = %item.id, identity = %item.identity_key, "Leased item");
        Ok(Some(item))
    }

    /// Records the outcome of a leased item and frees the worker.
    ///
    /// # Errors
    ///
    /// Returns `LeaseNotHeld` if the item is not currently leased by the worker,
    /// which happens when reconciliation reclaimed it in the meantime.
    pub async fn report_outcome(
        &self,
        worker_id: Uuid,
        item_id: Uuid,
        outcome: ItemOutcome,
    ) -> Result<QueueItem, CoordinatorError> {
        self.report_outcome_at(worker_id, item_id, outcome, Utc::now())
            .await
    }

    pub async fn report_outcome_at(
        &self,
        worker_id: Uuid,
        item_id: Uuid,
        outcome: ItemOutcome,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, CoordinatorError> {
        let updated = match self.queue.complete(item_id, worker_id, &outcome, now).await {
            Ok(item) => item,
            Err(QueueError::LeaseNotHeld { .. }) | Err(QueueError::InvalidTransition { .. }) => {
                return Err(CoordinatorError::LeaseNotHeld {
                    worker: worker_id,
                    item: item_id,
                });
            }
            Err(e) => return Err(e.into()),
        };
        self.workers
            .record_outcome(worker_id, outcome.is_success(), now)
            .await?;

        match updated.status {
            QueueStatus::Completed => {
                self.metrics.record_outcome(
                    "completed",
                    updated.duration_ms.map(|ms| ms as f64 / 1000.0),
                );
                debug!(worker_id = %worker_id, item_id = %item_id, "Item completed");
            }
            QueueStatus::Pending => {
                self.metrics.record_outcome("retry", None);
                info!(
                    worker_id = %worker_id,
                    item_id = %item_id,
                    retry_count = updated.retry_count,
                    not_before = %updated.not_before,
                    error = ?updated.last_error,
                    "Item failed, scheduled for retry"
                );
            }
            _ => {
                self.metrics.record_outcome("failed", None);
                warn!(
                    worker_id = %worker_id,
                    item_id = %item_id,
                    identity = %updated.identity_key,
                    retry_count = updated.retry_count,
                    error = ?updated.last_error,
                    "Item failed permanently"
                );
            }
        }

        Ok(updated)
    }

    /// Marks workers with stale heartbeats offline and requeues their items.
    ///
    /// Returns the ids of reclaimed items.
    pub async fn reconcile(&self) -> Result<Vec<Uuid>, CoordinatorError> {
        self.reconcile_at(Utc::now()).await
    }

    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, CoordinatorError> {
        let cutoff = now - self.staleness;
        let stale = self.workers.mark_stale_offline(cutoff).await?;

        let mut reclaimed = Vec::new();
        for worker in &stale {
            warn!(
                worker_id = %worker.id,
                name = %worker.name,
                last_heartbeat = %worker.last_heartbeat,
                "Worker heartbeat stale, marked offline"
            );

            if let Some(item_id) = worker.current_item {
                if self.queue.requeue(item_id, worker.id, now).await? {
                    info!(worker_id = %worker.id, item_id = %item_id, "Reclaimed stranded lease");
                    reclaimed.push(item_id);
                }
            }
        }

        if !reclaimed.is_empty() {
            self.metrics.record_reclaimed(reclaimed.len());
        }
        self.refresh_worker_gauge().await?;
        Ok(reclaimed)
    }

    /// Takes a worker out of rotation and returns its item to the queue.
    pub async fn quarantine(&self, worker_id: Uuid) -> Result<WorkerRecord, CoordinatorError> {
        let now = Utc::now();
        let previous = self
            .workers
            .get(worker_id)
            .await?
            .ok_or(CoordinatorError::WorkerNotFound(worker_id))?;

        let worker = self.workers.set_status(worker_id, WorkerStatus::Error).await?;
        if let Some(item_id) = previous.current_item {
            self.queue.requeue(item_id, worker_id, now).await?;
        }

        warn!(worker_id = %worker_id, name = %worker.name, "Worker quarantined");
        Ok(worker)
    }

    /// Marks a worker offline without waiting for staleness, e.g. on clean shutdown.
    pub async fn deregister(&self, worker_id: Uuid) -> Result<WorkerRecord, CoordinatorError> {
        let now = Utc::now();
        let previous = self
            .workers
            .get(worker_id)
            .await?
            .ok_or(CoordinatorError::WorkerNotFound(worker_id))?;

        let worker = self
            .workers
            .set_status(worker_id, WorkerStatus::Offline)
            .await?;
        if let Some(item_id) = previous.current_item {
            self.queue.requeue(item_id, worker_id, now).await?;
        }
        Ok(worker)
    }

    /// Lists all workers.
    pub async fn workers(&self) -> Result<Vec<WorkerRecord>, CoordinatorError> {
        self.workers.list().await
    }

    /// Fetches one worker.
    pub async fn worker(&self, worker_id: Uuid) -> Result<Option<WorkerRecord>, CoordinatorError> {
        self.workers.get(worker_id).await
    }

    async fn refresh_worker_gauge(&self) -> Result<(), CoordinatorError> {
        let active = self
            .workers
            .list()
            .await?
            .iter()
            .filter(|w| w.status.accepts_work())
            .count();
        self.metrics.update_workers(active);
        Ok(())
    }
}
