//! In-memory content cache.
//!
//! Entries sit behind per-entry mutexes inside a `RwLock`-guarded map, so
//! lookups on different keys only share the read lock. Puts of new keys and
//! eviction take the write lock.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::CacheError;
use crate::identity::ContentIdentity;

use super::entry::{CacheEntry, CacheFilter, CacheLookup, CacheStats, ProducerMetadata};
use super::{expiry_for, grace_to_chrono, CacheStore, LookupCounters};

/// Content cache held in process memory.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Mutex<CacheEntry>>>,
    counters: LookupCounters,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `f` to every entry under the read lock.
    fn for_each<F>(&self, mut f: F) -> Result<(), CacheError>
    where
        F: FnMut(&mut CacheEntry),
    {
        let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
        for cell in entries.values() {
            let mut entry = cell.lock().map_err(|_| CacheError::LockPoisoned)?;
            f(&mut *entry);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn lookup(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup, CacheError> {
        let key = identity.key();
        let result = {
            let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
            match entries.get(&key) {
                Some(cell) => {
                    let mut entry = cell.lock().map_err(|_| CacheError::LockPoisoned)?;
                    if entry.is_servable(now) {
                        entry.record_hit(now);
                    }
                    CacheLookup::classify(Some(&*entry), now)
                }
                None => CacheLookup::classify(None, now),
            }
        };

        self.counters.record(&result);
        Ok(result)
    }

    async fn peek(&self, identity_key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
        match entries.get(identity_key) {
            Some(cell) => {
                let entry = cell.lock().map_err(|_| CacheError::LockPoisoned)?;
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        identity: &ContentIdentity,
        artifact: String,
        metadata: ProducerMetadata,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError> {
        let expires_at = expiry_for(ttl, now)?;
        let key = identity.key();

        // Existing keys only need the read lock.
        {
            let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
            if let Some(cell) = entries.get(&key) {
                let mut entry = cell.lock().map_err(|_| CacheError::LockPoisoned)?;
                entry.replace(artifact, metadata, expires_at, now);
                return Ok(entry.clone());
            }
        }

        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        // A concurrent put may have inserted the key after the read lock dropped.
        if let Some(cell) = entries.get(&key) {
            let mut entry = cell.lock().map_err(|_| CacheError::LockPoisoned)?;
            entry.replace(artifact, metadata, expires_at, now);
            return Ok(entry.clone());
        }

        let entry = CacheEntry::new(identity.clone(), artifact, metadata, expires_at, now);
        entries.insert(key, Mutex::new(entry.clone()));
        Ok(entry)
    }

    async fn invalidate(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
        match entries.get(&identity.key()) {
            Some(cell) => {
                let mut entry = cell.lock().map_err(|_| CacheError::LockPoisoned)?;
                Ok(entry.invalidate(now))
            }
            None => Ok(false),
        }
    }

    async fn invalidate_where(
        &self,
        filter: &CacheFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, CacheError> {
        let mut count = 0;
        self.for_each(|entry| {
            if filter.matches(&entry.identity) && entry.invalidate(now) {
                count += 1;
            }
        })?;
        Ok(count)
    }

    async fn evict_expired(&self, grace: Duration, now: DateTime<Utc>) -> Result<u64, CacheError> {
        let grace = grace_to_chrono(grace)?;
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;

        let mut marked = 0u64;
        let mut doomed = Vec::new();
        for (key, cell) in entries.iter() {
            let mut entry = cell.lock().map_err(|_| CacheError::LockPoisoned)?;
            if entry.is_valid && entry.expires_at <= now {
                let expired_at = entry.expires_at;
                entry.invalidate(expired_at);
                marked += 1;
            }
            if let Some(invalidated_at) = entry.invalidated_at {
                if !entry.is_valid && now - invalidated_at > grace {
                    doomed.push(key.clone());
                }
            }
        }

        for key in &doomed {
            entries.remove(key);
        }

        let removed = doomed.len() as u64;
        self.counters.record_evictions(removed);
        debug!(marked, removed, "Cache eviction sweep finished");
        Ok(removed)
    }

    async fn count_valid(
        &self,
        filter: &CacheFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, CacheError> {
        let mut count = 0;
        self.for_each(|entry| {
            if entry.is_servable(now) && filter.matches(&entry.identity) {
                count += 1;
            }
        })?;
        Ok(count)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        self.for_each(|entry| {
            stats.entries += 1;
            if entry.is_servable(now) {
                stats.valid_entries += 1;
            }
        })?;
        self.counters.fill(&mut stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MissReason;

    fn identity() -> ContentIdentity {
        ContentIdentity::new("5", "Math", "S1")
    }

    #[tokio::test]
    async fn test_hit_within_ttl_miss_after() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        cache
            .put(&identity(), "A".to_string(), ProducerMetadata::new(10), Duration::from_secs(60), t)
            .await
            .unwrap();

        let hit = cache.lookup(&identity(), t + chrono::Duration::seconds(59)).await.unwrap();
        assert_eq!(hit.entry().map(|e| e.artifact.as_str()), Some("A"));

        let miss = cache.lookup(&identity(), t + chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(miss, CacheLookup::Miss(MissReason::Expired));
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_is_rejected() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        let result = cache
            .put(
                &identity(),
                "A".to_string(),
                ProducerMetadata::new(10),
                Duration::from_secs(10_000_000_000_000),
                t,
            )
            .await;

        assert!(matches!(result, Err(CacheError::InvalidTtl(_))));
        assert!(cache.peek(&identity().key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hit_count_increments_once_per_hit() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        cache
            .put(&identity(), "A".to_string(), ProducerMetadata::default(), Duration::from_secs(60), t)
            .await
            .unwrap();

        for expected in 1..=3u64 {
            let result = cache.lookup(&identity(), t).await.unwrap();
            assert_eq!(result.entry().map(|e| e.hit_count), Some(expected));
        }

        let peeked = cache.peek(&identity().key()).await.unwrap().unwrap();
        assert_eq!(peeked.hit_count, 3);
        assert_eq!(peeked.last_accessed_at, Some(t));
    }

    #[tokio::test]
    async fn test_put_is_idempotent_by_identity() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        let first = cache
            .put(&identity(), "A".to_string(), ProducerMetadata::default(), Duration::from_secs(60), t)
            .await
            .unwrap();
        cache.lookup(&identity(), t).await.unwrap();

        let second = cache
            .put(&identity(), "B".to_string(), ProducerMetadata::default(), Duration::from_secs(60), t)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.artifact, "B");
        assert_eq!(second.hit_count, 1);
        assert_eq!(cache.stats(t).await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let cache = MemoryCache::new();
        let result = cache
            .put(&identity(), "A".to_string(), ProducerMetadata::default(), Duration::ZERO, Utc::now())
            .await;
        assert!(matches!(result, Err(CacheError::InvalidTtl(_))));
    }

    #[tokio::test]
    async fn test_two_phase_eviction_respects_grace() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        let ttl = Duration::from_secs(60);
        let grace = Duration::from_secs(3600);
        cache
            .put(&identity(), "A".to_string(), ProducerMetadata::default(), ttl, t)
            .await
            .unwrap();

        let expired_at = t + chrono::Duration::seconds(60);

        // Phase 1 only: marked invalid, row kept.
        let removed = cache.evict_expired(grace, expired_at).await.unwrap();
        assert_eq!(removed, 0);
        let entry = cache.peek(&identity().key()).await.unwrap().unwrap();
        assert!(!entry.is_valid);
        assert_eq!(entry.invalidated_at, Some(expired_at));

        let at_grace = expired_at + chrono::Duration::seconds(3600);
        assert_eq!(cache.evict_expired(grace, at_grace).await.unwrap(), 0);

        let after_grace = at_grace + chrono::Duration::seconds(1);
        assert_eq!(cache.evict_expired(grace, after_grace).await.unwrap(), 1);
        assert!(cache.peek(&identity().key()).await.unwrap().is_none());
        assert_eq!(cache.stats(after_grace).await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_first_sweep_long_after_expiry_removes_entry() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        cache
            .put(&identity(), "A".to_string(), ProducerMetadata::default(), Duration::from_secs(60), t)
            .await
            .unwrap();

        let much_later = t + chrono::Duration::days(3);
        let removed = cache
            .evict_expired(Duration::from_secs(3600), much_later)
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_invalidate_keeps_row_and_put_restores() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        let ttl = Duration::from_secs(600);
        cache
            .put(&identity(), "A".to_string(), ProducerMetadata::default(), ttl, t)
            .await
            .unwrap();

        assert!(cache.invalidate(&identity(), t).await.unwrap());
        assert!(!cache.invalidate(&identity(), t).await.unwrap());
        assert_eq!(
            cache.lookup(&identity(), t).await.unwrap(),
            CacheLookup::Miss(MissReason::Invalidated)
        );

        cache
            .put(&identity(), "A2".to_string(), ProducerMetadata::default(), ttl, t)
            .await
            .unwrap();
        assert!(cache.lookup(&identity(), t).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_invalidate_where_and_count_valid() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        let ttl = Duration::from_secs(600);
        for variant in ["v1", "v2", "v3"] {
            let id = identity().with_variant(variant);
            cache
                .put(&id, variant.to_string(), ProducerMetadata::default(), ttl, t)
                .await
                .unwrap();
        }
        let science = ContentIdentity::new("5", "Science", "S1");
        cache
            .put(&science, "S".to_string(), ProducerMetadata::default(), ttl, t)
            .await
            .unwrap();

        let math = CacheFilter::variants_of(&identity());
        assert_eq!(cache.count_valid(&math, t).await.unwrap(), 3);

        let invalidated = cache
            .invalidate_where(&CacheFilter::new().with_subject("Math"), t)
            .await
            .unwrap();
        assert_eq!(invalidated, 3);
        assert_eq!(cache.count_valid(&math, t).await.unwrap(), 0);
        assert_eq!(cache.count_valid(&CacheFilter::new(), t).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let cache = MemoryCache::new();
        let t = Utc::now();
        cache.lookup(&identity(), t).await.unwrap();
        cache
            .put(&identity(), "A".to_string(), ProducerMetadata::default(), Duration::from_secs(60), t)
            .await
            .unwrap();
        cache.lookup(&identity(), t).await.unwrap();

        let stats = cache.stats(t).await.unwrap();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.valid_entries, 1);
    }
}
