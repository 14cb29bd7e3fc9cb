//! Content cache.
//!
//! Keyed store of produced artifacts with expiry and hit-count bookkeeping.
//! A lookup is served only while the entry is valid and unexpired; it never
//! triggers production. Removal is two-phase: expired or invalidated entries
//! first lose their validity flag, and are deleted only once a grace period
//! has elapsed since.
//!
//! # Backends
//!
//! - [`MemoryCache`]: in-process map
//! - [`crate::storage::PgCache`]: `content_cache` table

pub mod entry;
pub mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CacheError;
use crate::identity::ContentIdentity;

pub use entry::{
    CacheEntry, CacheFilter, CacheLookup, CacheStats, ContentHash, MissReason, ProducerMetadata,
};
pub use memory::MemoryCache;

/// Storage contract for the content cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Serves a valid, unexpired entry and bumps its hit count by one.
    async fn lookup(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup, CacheError>;

    /// Reads an entry without touching hit bookkeeping.
    async fn peek(&self, identity_key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Upserts the artifact for an identity.
    ///
    /// Payload, fingerprint, expiry and metadata are replaced; hit count and
    /// creation time are kept; validity is restored.
    async fn put(
        &self,
        identity: &ContentIdentity,
        artifact: String,
        metadata: ProducerMetadata,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError>;

    /// Clears the validity flag of one entry. Returns whether it was valid.
    async fn invalidate(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool, CacheError>;

    /// Clears the validity flag of every valid entry matching `filter`.
    async fn invalidate_where(
        &self,
        filter: &CacheFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, CacheError>;

    /// Runs both eviction phases and returns the number of deleted rows.
    async fn evict_expired(&self, grace: Duration, now: DateTime<Utc>) -> Result<u64, CacheError>;

    /// Counts entries matching `filter` that a lookup at `now` would serve.
    async fn count_valid(
        &self,
        filter: &CacheFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, CacheError>;

    /// Current statistics.
    async fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats, CacheError>;
}

/// Process-local lookup and eviction counters shared by the backends.
#[derive(Debug, Default)]
pub struct LookupCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LookupCounters {
    /// Counts one lookup result.
    pub fn record(&self, lookup: &CacheLookup) {
        if lookup.is_hit() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Fills the counter fields of `stats`.
    pub fn fill(&self, stats: &mut CacheStats) {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        stats.lookups = stats.hits + stats.misses;
        stats.evictions = self.evictions.load(Ordering::Relaxed);
    }
}

/// Expiry of an entry written at `now`, rejecting zero and unrepresentable TTLs.
pub(crate) fn expiry_for(ttl: Duration, now: DateTime<Utc>) -> Result<DateTime<Utc>, CacheError> {
    if ttl.is_zero() {
        return Err(CacheError::InvalidTtl("ttl must be greater than 0".to_string()));
    }
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| CacheError::InvalidTtl(format!("ttl of {:?} is out of range", ttl)))
}

/// Converts an eviction grace period to a chrono duration.
pub(crate) fn grace_to_chrono(grace: Duration) -> Result<chrono::Duration, CacheError> {
    chrono::Duration::from_std(grace).map_err(|e| CacheError::InvalidTtl(e.to_string()))
}
