//! Worker records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoordinatorError;

/// Liveness state of a worker.
///
/// `idle → busy` on lease, `busy → idle` on report, `idle|busy → offline`
/// when the heartbeat goes stale, `offline → idle` on re-registration.
/// `error` is set by an operator and is never leased to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Error => "error",
        }
    }

    /// Returns whether the worker may receive leases.
    pub fn accepts_work(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "offline" => Ok(WorkerStatus::Offline),
            "error" => Ok(WorkerStatus::Error),
            other => Err(CoordinatorError::CorruptRow(format!(
                "unknown worker status '{}'",
                other
            ))),
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: Uuid,
    /// Unique, stable name. Registration is idempotent by name.
    pub name: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Item the worker currently holds a lease on.
    pub current_item: Option<Uuid>,
    /// Successful productions reported.
    pub processed_count: u64,
    /// Failed productions reported.
    pub failed_count: u64,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: WorkerStatus::Idle,
            last_heartbeat: now,
            current_item: None,
            processed_count: 0,
            failed_count: 0,
            registered_at: now,
        }
    }

    /// Resets a returning worker to `idle`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = WorkerStatus::Idle;
        self.current_item = None;
        self.last_heartbeat = now;
    }

    /// Assigns a leased item.
    pub fn assign(&mut self, item_id: Uuid, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        if !self.status.accepts_work() {
            return Err(CoordinatorError::WorkerUnavailable {
                id: self.id,
                status: self.status.to_string(),
            });
        }
        self.status = WorkerStatus::Busy;
        self.current_item = Some(item_id);
        self.last_heartbeat = now;
        Ok(())
    }

    /// Counts a reported outcome and frees the worker.
    pub fn record_outcome(&mut self, success: bool, now: DateTime<Utc>) {
        if success {
            self.processed_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.current_item = None;
        self.last_heartbeat = now;
        if self.status == WorkerStatus::Busy {
            self.status = WorkerStatus::Idle;
        }
    }

    /// Sets a status, dropping the current item for non-working states.
    pub fn set_status(&mut self, status: WorkerStatus) {
        self.status = status;
        if !status.accepts_work() {
            self.current_item = None;
        }
    }

    /// Returns whether the heartbeat is older than `cutoff` on a live worker.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.accepts_work() && self.last_heartbeat < cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        for status in [
            WorkerStatus::Idle,
            WorkerStatus::Busy,
            WorkerStatus::Offline,
            WorkerStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<WorkerStatus>().ok(), Some(status));
        }
        assert!("zombie".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn test_assign_rejects_unavailable_workers() {
        let now = Utc::now();
        let mut worker = WorkerRecord::new("w1", now);
        worker.set_status(WorkerStatus::Error);

        let result = worker.assign(Uuid::new_v4(), now);
        assert!(matches!(result, Err(CoordinatorError::WorkerUnavailable { .. })));
    }

    #[test]
    fn test_outcome_returns_worker_to_idle() {
        let now = Utc::now();
        let mut worker = WorkerRecord::new("w1", now);
        worker.assign(Uuid::new_v4(), now).unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);

        worker.record_outcome(false, now);
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.failed_count, 1);
        assert_eq!(worker.processed_count, 0);
        assert!(worker.current_item.is_none());
    }

    #[test]
    fn test_staleness_ignores_offline_workers() {
        let now = Utc::now();
        let mut worker = WorkerRecord::new("w1", now);
        let later = now + chrono::Duration::minutes(10);

        assert!(worker.is_stale(later));
        worker.set_status(WorkerStatus::Offline);
        assert!(!worker.is_stale(later));
    }
}
