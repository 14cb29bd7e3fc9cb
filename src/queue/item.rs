//! Queue item definitions.
//!
//! This module defines the core types stored in the generation queue:
//!
//! - `QueueItem`: one unit of generation work for a content identity
//! - `QueueStatus`: lifecycle state of an item
//! - `ItemOutcome`: what a worker reports after invoking the producer
//! - `RetryBackoff`: delay schedule applied to failed attempts

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProducerError, QueueError};
use crate::identity::ContentIdentity;

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting to be leased.
    Pending,
    /// Exclusively held by a worker.
    Leased,
    /// Produced and cached.
    Completed,
    /// Retry budget exhausted or fatal failure.
    Failed,
    /// Withdrawn before it was leased.
    Cancelled,
}

impl QueueStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Leased,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::Cancelled,
    ];

    /// Returns the storage representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Leased => "leased",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    /// Returns whether the item still occupies its identity slot.
    ///
    /// At most one open item exists per identity.
    pub fn is_open(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Leased)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "leased" => Ok(QueueStatus::Leased),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "cancelled" => Ok(QueueStatus::Cancelled),
            other => Err(QueueError::CorruptRow(format!(
                "unknown queue status '{}'",
                other
            ))),
        }
    }
}

/// Exponential retry schedule: `base * 2^(retry - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl RetryBackoff {
    /// Creates a new schedule.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Returns the delay before attempt number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(3600),
        }
    }
}

/// Result reported for a leased item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum ItemOutcome {
    /// The producer returned content and it was written to the cache.
    Success {
        cache_entry_id: Uuid,
        duration_ms: u64,
    },
    /// The producer failed. Fatal failures skip the retry budget.
    Failure { error: String, fatal: bool },
}

impl ItemOutcome {
    /// A successful production linked to its cache entry.
    pub fn success(cache_entry_id: Uuid, duration_ms: u64) -> Self {
        ItemOutcome::Success {
            cache_entry_id,
            duration_ms,
        }
    }

    /// A failure that may be retried.
    pub fn transient(error: impl Into<String>) -> Self {
        ItemOutcome::Failure {
            error: error.into(),
            fatal: false,
        }
    }

    /// A failure that is never retried.
    pub fn fatal(error: impl Into<String>) -> Self {
        ItemOutcome::Failure {
            error: error.into(),
            fatal: true,
        }
    }

    /// Returns whether this outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }
}

impl From<&ProducerError> for ItemOutcome {
    fn from(err: &ProducerError) -> Self {
        if err.is_retryable() {
            ItemOutcome::transient(err.to_string())
        } else {
            ItemOutcome::fatal(err.to_string())
        }
    }
}

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique identifier for this item.
    pub id: Uuid,
    /// Content to produce.
    pub identity: ContentIdentity,
    /// Canonical key of `identity`.
    pub identity_key: String,
    /// Lower values are leased first.
    pub priority: i32,
    /// Current lifecycle state.
    pub status: QueueStatus,
    /// Failed attempts that were sent back to `pending`.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Earliest time the item may be leased.
    pub not_before: DateTime<Utc>,
    /// Worker holding (or last holding) the lease.
    pub lease_holder: Option<Uuid>,
    /// When the current lease started.
    pub leased_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the item reached `completed` or `failed`.
    pub finished_at: Option<DateTime<Utc>>,
    /// Cache entry written by the successful attempt.
    pub cache_entry_id: Option<Uuid>,
    /// Producer latency of the successful attempt.
    pub duration_ms: Option<u64>,
}

impl QueueItem {
    /// Creates a new pending item, leasable immediately.
    pub fn new(
        identity: ContentIdentity,
        priority: i32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let identity_key = identity.key();
        Self {
            id: Uuid::new_v4(),
            identity,
            identity_key,
            priority,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries,
            not_before: now,
            lease_holder: None,
            leased_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            cache_entry_id: None,
            duration_ms: None,
        }
    }

    /// Returns whether the item can be leased at `now`.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending && self.not_before <= now
    }

    /// Moves a pending item to `leased` for `worker_id`.
    pub fn mark_leased(&mut self, worker_id: Uuid, now: DateTime<Utc>) {
        self.status = QueueStatus::Leased;
        self.lease_holder = Some(worker_id);
        self.leased_at = Some(now);
        self.updated_at = now;
    }

    /// Raises the priority of a coalesced duplicate to the numeric maximum.
    ///
    /// Returns whether the priority changed.
    pub fn coalesce_priority(&mut self, requested: i32, now: DateTime<Utc>) -> bool {
        if self.status != QueueStatus::Pending || requested <= self.priority {
            return false;
        }
        self.priority = requested;
        self.updated_at = now;
        true
    }

    /// Applies the outcome reported by `holder` to a leased item.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidTransition` if the item is not leased, and
    /// `QueueError::LeaseNotHeld` if another worker holds the lease.
    pub fn apply_outcome(
        &mut self,
        holder: Uuid,
        outcome: &ItemOutcome,
        backoff: &RetryBackoff,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if self.status != QueueStatus::Leased {
            return Err(self.invalid("only leased items can be completed"));
        }
        if self.lease_holder != Some(holder) {
            return Err(QueueError::LeaseNotHeld {
                id: self.id,
                holder,
            });
        }

        match outcome {
            ItemOutcome::Success {
                cache_entry_id,
                duration_ms,
            } => {
                self.status = QueueStatus::Completed;
                self.cache_entry_id = Some(*cache_entry_id);
                self.duration_ms = Some(*duration_ms);
                self.finished_at = Some(now);
                self.last_error = None;
            }
            ItemOutcome::Failure { error, fatal } => {
                self.last_error = Some(error.clone());
                if !*fatal && self.retry_count < self.max_retries {
                    self.retry_count += 1;
                    self.status = QueueStatus::Pending;
                    self.lease_holder = None;
                    self.leased_at = None;
                    let delay = chrono::Duration::milliseconds(
                        i64::try_from(backoff.delay_for(self.retry_count).as_millis())
                            .unwrap_or(i64::MAX),
                    );
                    let retry_at = now
                        .checked_add_signed(delay)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    if retry_at > self.not_before {
                        self.not_before = retry_at;
                    }
                } else {
                    self.status = QueueStatus::Failed;
                    self.finished_at = Some(now);
                }
            }
        }

        self.updated_at = now;
        Ok(())
    }

    /// Withdraws a pending item.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        if self.status != QueueStatus::Pending {
            return Err(self.invalid("only pending items can be cancelled"));
        }
        self.status = QueueStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    /// Returns a leased item to `pending` without consuming a retry.
    ///
    /// Returns `false` when the item is no longer leased by `holder`.
    pub fn release_lease(&mut self, holder: Uuid, now: DateTime<Utc>) -> bool {
        if self.status != QueueStatus::Leased || self.lease_holder != Some(holder) {
            return false;
        }
        self.status = QueueStatus::Pending;
        self.lease_holder = None;
        self.leased_at = None;
        self.updated_at = now;
        true
    }

    fn invalid(&self, reason: &str) -> QueueError {
        QueueError::InvalidTransition {
            id: self.id,
            from: self.status.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    /// Item now representing the identity.
    pub item_id: Uuid,
    /// True when an existing open item absorbed the request.
    pub coalesced: bool,
}

/// Item counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Adds one item of the given status.
    pub fn add(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Leased => self.leased += count,
            QueueStatus::Completed => self.completed += count,
            QueueStatus::Failed => self.failed += count,
            QueueStatus::Cancelled => self.cancelled += count,
        }
    }

    /// Returns the count for one status.
    pub fn get(&self, status: QueueStatus) -> u64 {
        match status {
            QueueStatus::Pending => self.pending,
            QueueStatus::Leased => self.leased,
            QueueStatus::Completed => self.completed,
            QueueStatus::Failed => self.failed,
            QueueStatus::Cancelled => self.cancelled,
        }
    }

    /// Items still waiting for or undergoing production.
    pub fn depth(&self) -> u64 {
        self.pending + self.leased
    }

    /// All items.
    pub fn total(&self) -> u64 {
        self.depth() + self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKER: Uuid = Uuid::from_u128(0x5eed);

    fn leased_item(max_retries: u32, now: DateTime<Utc>) -> QueueItem {
        let mut item = QueueItem::new(ContentIdentity::new("5", "Math", "S1"), 10, max_retries, now);
        item.mark_leased(WORKER, now);
        item
    }

    #[test]
    fn test_status_roundtrip() {
        for status in QueueStatus::ALL {
            assert_eq!(status.as_str().parse::<QueueStatus>().ok(), Some(status));
        }
        assert!("running".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = RetryBackoff::new(Duration::from_secs(30), Duration::from_secs(100));
        assert_eq!(backoff.delay_for(0), Duration::ZERO);
        assert_eq!(backoff.delay_for(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(100));
        assert_eq!(backoff.delay_for(64), Duration::from_secs(100));
    }

    #[test]
    fn test_success_completes_item() {
        let now = Utc::now();
        let mut item = leased_item(3, now);
        let entry = Uuid::new_v4();

        item.apply_outcome(WORKER, &ItemOutcome::success(entry, 250), &RetryBackoff::default(), now)
            .expect("leased item accepts outcome");

        assert_eq!(item.status, QueueStatus::Completed);
        assert_eq!(item.cache_entry_id, Some(entry));
        assert_eq!(item.duration_ms, Some(250));
        assert_eq!(item.finished_at, Some(now));
    }

    #[test]
    fn test_transient_failure_schedules_retry() {
        let now = Utc::now();
        let mut item = leased_item(2, now);
        let backoff = RetryBackoff::new(Duration::from_secs(10), Duration::from_secs(60));

        item.apply_outcome(WORKER, &ItemOutcome::transient("timeout"), &backoff, now)
            .expect("leased item accepts outcome");

        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.not_before, now + chrono::Duration::seconds(10));
        assert_eq!(item.last_error.as_deref(), Some("timeout"));
        assert!(item.lease_holder.is_none());
        assert!(!item.is_leasable(now));
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let now = Utc::now();
        let backoff = RetryBackoff::default();
        let mut item = leased_item(2, now);

        for attempt in 0..3 {
            item.apply_outcome(WORKER, &ItemOutcome::transient("boom"), &backoff, now)
                .expect("leased item accepts outcome");
            if attempt < 2 {
                assert_eq!(item.status, QueueStatus::Pending);
                item.mark_leased(WORKER, item.not_before);
            }
        }

        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 2);
        assert!(item.finished_at.is_some());
    }

    #[test]
    fn test_fatal_failure_skips_retries() {
        let now = Utc::now();
        let mut item = leased_item(5, now);

        item.apply_outcome(WORKER, &ItemOutcome::fatal("policy"), &RetryBackoff::default(), now)
            .expect("leased item accepts outcome");

        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn test_outcome_on_pending_item_is_rejected() {
        let now = Utc::now();
        let mut item = QueueItem::new(ContentIdentity::new("5", "Math", "S1"), 10, 3, now);
        let result = item.apply_outcome(
            WORKER,
            &ItemOutcome::success(Uuid::new_v4(), 1),
            &RetryBackoff::default(),
            now,
        );
        assert!(matches!(result, Err(QueueError::InvalidTransition { .. })));
    }

    #[test]
    fn test_outcome_from_other_holder_is_rejected() {
        let now = Utc::now();
        let mut item = leased_item(3, now);
        let stale = Uuid::new_v4();

        let result = item.apply_outcome(stale, &ItemOutcome::fatal("late"), &RetryBackoff::default(), now);

        assert!(matches!(result, Err(QueueError::LeaseNotHeld { holder, .. }) if holder == stale));
        assert_eq!(item.status, QueueStatus::Leased);
        assert_eq!(item.lease_holder, Some(WORKER));
    }

    #[test]
    fn test_backoff_past_calendar_end_saturates() {
        let now = Utc::now();
        let mut item = leased_item(3, now);
        let backoff = RetryBackoff::new(Duration::from_secs(u64::MAX / 4), Duration::MAX);

        item.apply_outcome(WORKER, &ItemOutcome::transient("slow"), &backoff, now)
            .expect("leased item accepts outcome");

        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.not_before, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_coalesce_priority_takes_numeric_max() {
        let now = Utc::now();
        let mut item = QueueItem::new(ContentIdentity::new("5", "Math", "S1"), 10, 3, now);

        assert!(!item.coalesce_priority(5, now));
        assert_eq!(item.priority, 10);
        assert!(item.coalesce_priority(50, now));
        assert_eq!(item.priority, 50);
    }

    #[test]
    fn test_release_lease_requires_holder() {
        let now = Utc::now();
        let mut item = QueueItem::new(ContentIdentity::new("5", "Math", "S1"), 10, 3, now);
        let worker = Uuid::new_v4();
        item.mark_leased(worker, now);

        assert!(!item.release_lease(Uuid::new_v4(), now));
        assert!(item.release_lease(worker, now));
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn test_outcome_from_producer_error() {
        let outcome = ItemOutcome::from(&ProducerError::Timeout { seconds: 5 });
        assert!(matches!(outcome, ItemOutcome::Failure { fatal: false, .. }));

        let outcome = ItemOutcome::from(&ProducerError::Fatal("bad".to_string()));
        assert!(matches!(outcome, ItemOutcome::Failure { fatal: true, .. }));
    }
}
