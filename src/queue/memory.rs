//! In-memory generation queue.
//!
//! Items live in per-item mutexes inside a `RwLock`-guarded map. Leasing
//! takes each candidate's mutex with `try_lock` and skips the ones another
//! caller holds. The open-identity index is the only structure touched by
//! every enqueue; it is never locked while an item mutex is held except in
//! `enqueue`, which always takes index, then map, then item.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::identity::ContentIdentity;

use super::item::{Enqueued, ItemOutcome, QueueItem, QueueStats, QueueStatus, RetryBackoff};
use super::QueueStore;

type ItemCell = Arc<Mutex<QueueItem>>;

/// Generation queue held in process memory.
pub struct MemoryQueue {
    items: RwLock<HashMap<Uuid, ItemCell>>,
    open_index: Mutex<HashMap<String, Uuid>>,
    backoff: RetryBackoff,
}

impl MemoryQueue {
    /// Creates an empty queue using the given retry schedule.
    pub fn new(backoff: RetryBackoff) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            open_index: Mutex::new(HashMap::new()),
            backoff,
        }
    }

    fn cell(&self, item_id: Uuid) -> Result<ItemCell, QueueError> {
        let items = self.items.read().map_err(|_| QueueError::LockPoisoned)?;
        items
            .get(&item_id)
            .cloned()
            .ok_or(QueueError::ItemNotFound(item_id))
    }

    fn snapshot(&self, item_id: Uuid) -> Result<Option<QueueItem>, QueueError> {
        let items = self.items.read().map_err(|_| QueueError::LockPoisoned)?;
        match items.get(&item_id) {
            Some(cell) => {
                let item = cell.lock().map_err(|_| QueueError::LockPoisoned)?;
                Ok(Some(item.clone()))
            }
            None => Ok(None),
        }
    }

    fn collect<F>(&self, mut keep: F) -> Result<Vec<QueueItem>, QueueError>
    where
        F: FnMut(&QueueItem) -> bool,
    {
        let items = self.items.read().map_err(|_| QueueError::LockPoisoned)?;
        let mut out = Vec::new();
        for cell in items.values() {
            let item = cell.lock().map_err(|_| QueueError::LockPoisoned)?;
            if keep(&item) {
                out.push(item.clone());
            }
        }
        Ok(out)
    }

    /// Drops the index entry for `key` if it still points at `item_id`.
    fn release_identity(&self, key: &str, item_id: Uuid) -> Result<(), QueueError> {
        let mut index = self.open_index.lock().map_err(|_| QueueError::LockPoisoned)?;
        if index.get(key) == Some(&item_id) {
            index.remove(key);
        }
        Ok(())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(RetryBackoff::default())
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn enqueue(
        &self,
        identity: &ContentIdentity,
        priority: i32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, QueueError> {
        let key = identity.key();
        let mut index = self.open_index.lock().map_err(|_| QueueError::LockPoisoned)?;

        if let Some(existing_id) = index.get(&key).copied() {
            let existing = {
                let items = self.items.read().map_err(|_| QueueError::LockPoisoned)?;
                items.get(&existing_id).cloned()
            };
            if let Some(cell) = existing {
                let mut item = cell.lock().map_err(|_| QueueError::LockPoisoned)?;
                if item.status.is_open() {
                    if item.coalesce_priority(priority, now) {
                        debug!(item_id = %existing_id, priority, "Raised priority of coalesced item");
                    }
                    return Ok(Enqueued {
                        item_id: existing_id,
                        coalesced: true,
                    });
                }
            }
        }

        let item = QueueItem::new(identity.clone(), priority, max_retries, now);
        let item_id = item.id;
        {
            let mut items = self.items.write().map_err(|_| QueueError::LockPoisoned)?;
            items.insert(item_id, Arc::new(Mutex::new(item)));
        }
        index.insert(key, item_id);

        Ok(Enqueued {
            item_id,
            coalesced: false,
        })
    }

    async fn lease(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError> {
        let mut candidates = Vec::new();
        {
            let items = self.items.read().map_err(|_| QueueError::LockPoisoned)?;
            for cell in items.values() {
                match cell.try_lock() {
                    Ok(item) => {
                        if item.is_leasable(now) {
                            candidates.push((
                                item.priority,
                                item.not_before,
                                item.created_at,
                                Arc::clone(cell),
                            ));
                        }
                    }
                    Err(TryLockError::WouldBlock) => continue,
                    Err(TryLockError::Poisoned(_)) => return Err(QueueError::LockPoisoned),
                }
            }
        }

        candidates.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        for (_, _, _, cell) in candidates {
            let mut item = match cell.try_lock() {
                Ok(item) => item,
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => return Err(QueueError::LockPoisoned),
            };
            // Another caller may have claimed it between the scan and now.
            if !item.is_leasable(now) {
                continue;
            }
            item.mark_leased(worker_id, now);
            return Ok(Some(item.clone()));
        }

        Ok(None)
    }

    async fn complete(
        &self,
        item_id: Uuid,
        holder: Uuid,
        outcome: &ItemOutcome,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let cell = self.cell(item_id)?;
        let updated = {
            let mut item = cell.lock().map_err(|_| QueueError::LockPoisoned)?;
            item.apply_outcome(holder, outcome, &self.backoff, now)?;
            item.clone()
        };

        if !updated.status.is_open() {
            self.release_identity(&updated.identity_key, item_id)?;
        }
        Ok(updated)
    }

    async fn cancel(&self, item_id: Uuid, now: DateTime<Utc>) -> Result<QueueItem, QueueError> {
        let cell = self.cell(item_id)?;
        let updated = {
            let mut item = cell.lock().map_err(|_| QueueError::LockPoisoned)?;
            item.cancel(now)?;
            item.clone()
        };

        self.release_identity(&updated.identity_key, item_id)?;
        Ok(updated)
    }

    async fn requeue(
        &self,
        item_id: Uuid,
        holder: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let cell = self.cell(item_id)?;
        let mut item = cell.lock().map_err(|_| QueueError::LockPoisoned)?;
        Ok(item.release_lease(holder, now))
    }

    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>, QueueError> {
        self.snapshot(item_id)
    }

    async fn find_open(&self, identity_key: &str) -> Result<Option<QueueItem>, QueueError> {
        let item_id = {
            let index = self.open_index.lock().map_err(|_| QueueError::LockPoisoned)?;
            index.get(identity_key).copied()
        };
        match item_id {
            Some(id) => Ok(self.snapshot(id)?.filter(|item| item.status.is_open())),
            None => Ok(None),
        }
    }

    async fn latest_for(&self, identity_key: &str) -> Result<Option<QueueItem>, QueueError> {
        let matching = self.collect(|item| item.identity_key == identity_key)?;
        Ok(matching.into_iter().max_by_key(|item| item.created_at))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let items = self.items.read().map_err(|_| QueueError::LockPoisoned)?;
        let mut stats = QueueStats::default();
        for cell in items.values() {
            let item = cell.lock().map_err(|_| QueueError::LockPoisoned)?;
            stats.add(item.status, 1);
        }
        Ok(stats)
    }

    async fn finished_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError> {
        self.collect(|item| {
            matches!(item.status, QueueStatus::Completed | QueueStatus::Failed)
                && item
                    .finished_at
                    .map(|at| at >= from && at < to)
                    .unwrap_or(false)
        })
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut items = self.items.write().map_err(|_| QueueError::LockPoisoned)?;
        let before = items.len();
        let mut poisoned = false;
        items.retain(|_, cell| match cell.lock() {
            Ok(item) => item.status.is_open() || item.updated_at >= older_than,
            Err(_) => {
                poisoned = true;
                true
            }
        });
        if poisoned {
            return Err(QueueError::LockPoisoned);
        }
        Ok((before - items.len()) as u64)
    }
}
