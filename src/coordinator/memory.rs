//! In-memory worker registry.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoordinatorError;

use super::worker::{WorkerRecord, WorkerStatus};
use super::WorkerStore;

/// Worker registry held in process memory.
#[derive(Default)]
pub struct MemoryWorkerStore {
    workers: RwLock<HashMap<Uuid, WorkerRecord>>,
}

impl MemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: Uuid, f: F) -> Result<WorkerRecord, CoordinatorError>
    where
        F: FnOnce(&mut WorkerRecord) -> Result<(), CoordinatorError>,
    {
        let mut workers = self.workers.write().map_err(|_| CoordinatorError::LockPoisoned)?;
        let worker = workers
            .get_mut(&id)
            .ok_or(CoordinatorError::WorkerNotFound(id))?;
        f(worker)?;
        Ok(worker.clone())
    }
}

#[async_trait]
impl WorkerStore for MemoryWorkerStore {
    async fn register(&self, name: &str, now: DateTime<Utc>) -> Result<WorkerRecord, CoordinatorError> {
        let mut workers = self.workers.write().map_err(|_| CoordinatorError::LockPoisoned)?;
        if let Some(worker) = workers.values_mut().find(|w| w.name == name) {
            worker.reset(now);
            return Ok(worker.clone());
        }

        let worker = WorkerRecord::new(name, now);
        workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkerRecord>, CoordinatorError> {
        let workers = self.workers.read().map_err(|_| CoordinatorError::LockPoisoned)?;
        Ok(workers.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<WorkerRecord>, CoordinatorError> {
        let workers = self.workers.read().map_err(|_| CoordinatorError::LockPoisoned)?;
        Ok(workers.values().find(|w| w.name == name).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, CoordinatorError> {
        let workers = self.workers.read().map_err(|_| CoordinatorError::LockPoisoned)?;
        let mut all: Vec<WorkerRecord> = workers.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> Result<WorkerRecord, CoordinatorError> {
        self.update(id, |worker| {
            worker.last_heartbeat = now;
            Ok(())
        })
    }

    async fn mark_busy(
        &self,
        id: Uuid,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError> {
        self.update(id, |worker| worker.assign(item_id, now))
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError> {
        self.update(id, |worker| {
            worker.record_outcome(success, now);
            Ok(())
        })
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: WorkerStatus,
    ) -> Result<WorkerRecord, CoordinatorError> {
        self.update(id, |worker| {
            worker.set_status(status);
            Ok(())
        })
    }

    async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, CoordinatorError> {
        let mut workers = self.workers.write().map_err(|_| CoordinatorError::LockPoisoned)?;
        let mut stale = Vec::new();
        for worker in workers.values_mut() {
            if worker.is_stale(cutoff) {
                stale.push(worker.clone());
                worker.set_status(WorkerStatus::Offline);
            }
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_idempotent_by_name() {
        let store = MemoryWorkerStore::new();
        let now = Utc::now();

        let first = store.register("w1", now).await.unwrap();
        store.mark_busy(first.id, Uuid::new_v4(), now).await.unwrap();
        store.set_status(first.id, WorkerStatus::Offline).await.unwrap();

        let again = store.register("w1", now).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.status, WorkerStatus::Idle);
        assert!(again.current_item.is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker() {
        let store = MemoryWorkerStore::new();
        let id = Uuid::new_v4();
        let result = store.heartbeat(id, Utc::now()).await;
        assert!(matches!(result, Err(CoordinatorError::WorkerNotFound(missing)) if missing == id));
    }

    #[tokio::test]
    async fn test_mark_stale_offline_returns_prior_state() {
        let store = MemoryWorkerStore::new();
        let now = Utc::now();
        let w = store.register("w1", now).await.unwrap();
        let item = Uuid::new_v4();
        store.mark_busy(w.id, item, now).await.unwrap();
        store.register("w2", now + chrono::Duration::minutes(9)).await.unwrap();

        let stale = store
            .mark_stale_offline(now + chrono::Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].current_item, Some(item));
        let after = store.get(w.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkerStatus::Offline);
        assert!(after.current_item.is_none());
    }
}
