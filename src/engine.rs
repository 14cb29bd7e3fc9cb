//! Request-time façade over the queue, cache and background components.
//!
//! [`Engine`] owns one instance of every component and wires them to the
//! same stores. Callers that serve learners go through [`Engine::lookup`];
//! operators go through the enqueue, eviction and status methods; the
//! runtime starts the worker pool and the maintenance loops from here.
//!
//! # Example
//!
//! ```rust,ignore
//! use lesson_forge::{ContentIdentity, Engine, EngineConfig, MissPolicy};
//!
//! let engine = Engine::in_memory(EngineConfig::default());
//! let identity = ContentIdentity::new("5", "Math", "fractions");
//! match engine.lookup(&identity, MissPolicy::Enqueue).await? {
//!     LookupOutcome::Hit(entry) => serve(entry.artifact),
//!     LookupOutcome::Pending { item_id, .. } => show_placeholder(item_id),
//!     other => log_unexpected(other),
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{
    CacheEntry, CacheFilter, CacheLookup, CacheStore, MemoryCache, MissReason, ProducerMetadata,
};
use crate::config::EngineConfig;
use crate::coordinator::{
    MemoryWorkerStore, WorkerCoordinator, WorkerPool, WorkerPoolConfig, WorkerStore,
};
use crate::error::{EngineError, ProducerError};
use crate::identity::ContentIdentity;
use crate::metrics::{MetricsAggregator, MetricsCollector};
use crate::producer::{ContentProducer, ProducedContent};
use crate::queue::{Enqueued, MemoryQueue, QueueItem, QueueStatus, QueueStore, RetryBackoff};
use crate::scheduler::PreGenerationScheduler;
use crate::storage::Database;

/// Maintenance loops never tick faster than this.
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// What a lookup does when the cache cannot serve the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissPolicy {
    /// Queue the identity at user priority and return immediately.
    #[default]
    Enqueue,
    /// Call the producer inline and cache the result.
    Produce,
    /// Report the miss and do nothing else.
    None,
}

/// Result of a request-time lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LookupOutcome {
    /// Served from the cache.
    Hit(CacheEntry),
    /// Produced inline and written to the cache.
    Produced(CacheEntry),
    /// Queued for background production.
    Pending { item_id: Uuid, coalesced: bool },
    /// The most recent attempt for this identity failed terminally.
    Failed { item_id: Uuid, error: Option<String> },
    /// Not cached, and the policy asked for nothing more.
    Miss { reason: MissReason },
}

impl LookupOutcome {
    /// Returns the servable entry, if any.
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            LookupOutcome::Hit(entry) | LookupOutcome::Produced(entry) => Some(entry),
            _ => None,
        }
    }
}

/// Availability of an identity as seen from above the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContentStatus {
    Available {
        entry_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    NotYetAvailable {
        item_id: Uuid,
        queue_status: QueueStatus,
        retry_count: u32,
    },
    GenerationFailed {
        item_id: Uuid,
        error: Option<String>,
    },
    Unknown,
}

/// Pre-generation queue and content cache engine.
pub struct Engine {
    config: EngineConfig,
    queue: Arc<dyn QueueStore>,
    cache: Arc<dyn CacheStore>,
    coordinator: Arc<WorkerCoordinator>,
    scheduler: Arc<PreGenerationScheduler>,
    aggregator: Arc<MetricsAggregator>,
    producer: Option<Arc<dyn ContentProducer>>,
    metrics: MetricsCollector,
}

impl Engine {
    /// Builds an engine over the given stores.
    pub fn new(
        queue: Arc<dyn QueueStore>,
        cache: Arc<dyn CacheStore>,
        workers: Arc<dyn WorkerStore>,
        config: EngineConfig,
    ) -> Self {
        let coordinator = Arc::new(WorkerCoordinator::new(
            Arc::clone(&queue),
            workers,
            config.lease_staleness,
        ));
        let aggregator = Arc::new(MetricsAggregator::new(
            Arc::clone(&queue),
            config.metrics_bucket,
            config.metrics_retention,
        ));
        let scheduler = Arc::new(
            PreGenerationScheduler::new(Arc::clone(&queue), Arc::clone(&cache), &config)
                .with_aggregator(Arc::clone(&aggregator)),
        );

        Self {
            config,
            queue,
            cache,
            coordinator,
            scheduler,
            aggregator,
            producer: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Builds an engine whose state lives in process memory.
    pub fn in_memory(config: EngineConfig) -> Self {
        let backoff = RetryBackoff::new(config.backoff_base, config.backoff_max);
        Self::new(
            Arc::new(MemoryQueue::new(backoff)),
            Arc::new(MemoryCache::default()),
            Arc::new(MemoryWorkerStore::default()),
            config,
        )
    }

    /// Builds an engine over an already migrated Postgres database.
    pub fn postgres(db: &Database, config: EngineConfig) -> Self {
        let backoff = RetryBackoff::new(config.backoff_base, config.backoff_max);
        Self::new(db.queue(backoff), db.cache(), db.workers(), config)
    }

    /// Connects to `config.database_url`, applies migrations and builds the engine.
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        let db = Database::connect(config.require_database_url()?).await?;
        db.run_migrations().await?;
        Ok(Self::postgres(&db, config))
    }

    /// Sets the producer used for inline production and by the worker pool.
    pub fn with_producer(mut self, producer: Arc<dyn ContentProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn QueueStore> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<WorkerCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Arc<PreGenerationScheduler> {
        &self.scheduler
    }

    pub fn aggregator(&self) -> &Arc<MetricsAggregator> {
        &self.aggregator
    }

    /// Serves `identity` from the cache, applying `policy` on a miss.
    pub async fn lookup(
        &self,
        identity: &ContentIdentity,
        policy: MissPolicy,
    ) -> Result<LookupOutcome, EngineError> {
        self.lookup_at(identity, policy, Utc::now()).await
    }

    pub async fn lookup_at(
        &self,
        identity: &ContentIdentity,
        policy: MissPolicy,
        now: DateTime<Utc>,
    ) -> Result<LookupOutcome, EngineError> {
        let lookup = self.cache.lookup(identity, now).await?;
        self.metrics.record_lookup(lookup.is_hit());
        self.aggregator.record_lookup(identity, lookup.is_hit(), now);

        let reason = match lookup {
            CacheLookup::Hit(entry) => return Ok(LookupOutcome::Hit(entry)),
            CacheLookup::Miss(reason) => reason,
        };
        debug!(identity = %identity, reason = ?reason, policy = ?policy, "Cache miss");

        match policy {
            MissPolicy::None => Ok(LookupOutcome::Miss { reason }),
            MissPolicy::Enqueue => self.enqueue_missing(identity, now).await,
            MissPolicy::Produce => self.produce_inline(identity, now).await,
        }
    }

    /// Queues a missed identity unless its latest attempt already failed.
    async fn enqueue_missing(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<LookupOutcome, EngineError> {
        let key = identity.key();
        if self.queue.find_open(&key).await?.is_none() {
            if let Some(item) = self.queue.latest_for(&key).await? {
                if item.status == QueueStatus::Failed {
                    return Ok(LookupOutcome::Failed {
                        item_id: item.id,
                        error: item.last_error,
                    });
                }
            }
        }

        let enqueued = self
            .enqueue_at(
                identity,
                self.config.user_priority,
                self.config.default_max_retries,
                now,
            )
            .await?;
        Ok(LookupOutcome::Pending {
            item_id: enqueued.item_id,
            coalesced: enqueued.coalesced,
        })
    }

    async fn produce_inline(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<LookupOutcome, EngineError> {
        let producer = self.producer.as_ref().ok_or(EngineError::NoProducer)?;

        let started = Instant::now();
        let produced = match tokio::time::timeout(
            self.config.producer_timeout,
            producer.produce(identity),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProducerError::Timeout {
                seconds: self.config.producer_timeout.as_secs(),
            }),
        };

        match produced {
            Ok(content) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.metrics
                    .record_outcome("completed", Some(duration_ms as f64 / 1000.0));
                let entry = self.put_with_duration(identity, content, duration_ms, now).await?;
                Ok(LookupOutcome::Produced(entry))
            }
            Err(e) if e.is_retryable() => {
                warn!(identity = %identity, error = %e, "Inline production failed, queueing");
                self.metrics.record_outcome("retry", None);
                self.enqueue_missing(identity, now).await
            }
            Err(e) => {
                self.metrics.record_outcome("failed", None);
                Err(e.into())
            }
        }
    }

    /// Submits `identity` for background production.
    pub async fn enqueue(
        &self,
        identity: &ContentIdentity,
        priority: i32,
        max_retries: u32,
    ) -> Result<Enqueued, EngineError> {
        self.enqueue_at(identity, priority, max_retries, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        identity: &ContentIdentity,
        priority: i32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, EngineError> {
        let enqueued = self.queue.enqueue(identity, priority, max_retries, now).await?;
        self.metrics.record_enqueue(enqueued.coalesced);
        if !enqueued.coalesced {
            self.aggregator.record_enqueue(identity, now);
            debug!(item_id = %enqueued.item_id, identity = %identity, priority, "Enqueued");
        }
        Ok(enqueued)
    }

    /// Writes content produced outside the worker pool.
    pub async fn put(
        &self,
        identity: &ContentIdentity,
        content: ProducedContent,
    ) -> Result<CacheEntry, EngineError> {
        self.put_with_duration(identity, content, 0, Utc::now()).await
    }

    async fn put_with_duration(
        &self,
        identity: &ContentIdentity,
        content: ProducedContent,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, EngineError> {
        let metadata = ProducerMetadata {
            duration_ms,
            producer_variant: content.producer_variant,
        };
        let ttl = self.config.ttl_for(identity.category());
        Ok(self
            .cache
            .put(identity, content.artifact, metadata, ttl, now)
            .await?)
    }

    /// Invalidates one identity. Returns whether a valid entry was affected.
    pub async fn invalidate(&self, identity: &ContentIdentity) -> Result<bool, EngineError> {
        Ok(self.cache.invalidate(identity, Utc::now()).await?)
    }

    /// Invalidates every valid entry matching `filter`.
    pub async fn invalidate_where(&self, filter: &CacheFilter) -> Result<u64, EngineError> {
        let count = self.cache.invalidate_where(filter, Utc::now()).await?;
        info!(count, filter = ?filter, "Invalidated cache entries");
        Ok(count)
    }

    /// Runs one eviction sweep with the configured grace period.
    pub async fn evict_expired(&self) -> Result<u64, EngineError> {
        self.evict_expired_at(Utc::now()).await
    }

    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> Result<u64, EngineError> {
        let removed = self
            .cache
            .evict_expired(self.config.eviction_grace, now)
            .await?;
        self.metrics.record_evictions(removed);
        self.aggregator.record_evictions(removed, now);
        if removed > 0 {
            info!(removed, "Evicted cache entries");
        }
        Ok(removed)
    }

    /// Cancels a pending queue item.
    pub async fn cancel(&self, item_id: Uuid) -> Result<QueueItem, EngineError> {
        let item = self.queue.cancel(item_id, Utc::now()).await?;
        info!(item_id = %item_id, identity = %item.identity_key, "Cancelled queue item");
        Ok(item)
    }

    /// Reports whether `identity` can be served, is being produced, or failed.
    pub async fn content_status(
        &self,
        identity: &ContentIdentity,
    ) -> Result<ContentStatus, EngineError> {
        self.content_status_at(identity, Utc::now()).await
    }

    pub async fn content_status_at(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<ContentStatus, EngineError> {
        let key = identity.key();

        if let Some(entry) = self.cache.peek(&key).await? {
            if entry.is_servable(now) {
                return Ok(ContentStatus::Available {
                    entry_id: entry.id,
                    expires_at: entry.expires_at,
                });
            }
        }

        if let Some(item) = self.queue.find_open(&key).await? {
            return Ok(ContentStatus::NotYetAvailable {
                item_id: item.id,
                queue_status: item.status,
                retry_count: item.retry_count,
            });
        }

        match self.queue.latest_for(&key).await? {
            Some(item) if item.status == QueueStatus::Failed => {
                Ok(ContentStatus::GenerationFailed {
                    item_id: item.id,
                    error: item.last_error,
                })
            }
            _ => Ok(ContentStatus::Unknown),
        }
    }

    /// Records a learner visit and queues predicted next content.
    pub async fn record_visit(
        &self,
        session: &str,
        identity: &ContentIdentity,
    ) -> Result<Vec<Uuid>, EngineError> {
        let now = Utc::now();
        let enqueued = self.scheduler.record_visit_at(session, identity, now).await?;
        Ok(enqueued)
    }

    /// Refreshes the queue depth and cache size gauges.
    pub async fn refresh_gauges(&self) -> Result<(), EngineError> {
        let queue = self.queue.stats().await?;
        self.metrics.update_queue_depth(&queue);
        let cache = self.cache.stats(Utc::now()).await?;
        self.metrics
            .update_cache_entries(cache.entries, cache.valid_entries);
        Ok(())
    }

    /// Builds a worker pool driven by this engine's coordinator and producer.
    pub fn worker_pool(&self) -> Result<WorkerPool, EngineError> {
        let producer = self.producer.clone().ok_or(EngineError::NoProducer)?;
        Ok(WorkerPool::new(
            WorkerPoolConfig::from(&self.config),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.cache),
            producer,
        ))
    }

    /// Starts a worker pool. The caller owns its shutdown.
    pub async fn start_workers(&self) -> Result<WorkerPool, EngineError> {
        let mut pool = self.worker_pool()?;
        pool.start().await?;
        Ok(pool)
    }

    /// Spawns the reconciliation, eviction, metrics and warming loops.
    ///
    /// Every loop exits when `shutdown` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = Arc::clone(self);
        handles.push(tokio::spawn(every(
            self.config.reconcile_interval,
            shutdown.subscribe(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    if let Err(e) = engine.coordinator.reconcile().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
            },
        )));

        let engine = Arc::clone(self);
        handles.push(tokio::spawn(every(
            self.config.eviction_interval,
            shutdown.subscribe(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    if let Err(e) = engine.evict_expired().await {
                        error!(error = %e, "Eviction sweep failed");
                    }
                    if let Err(e) = engine.purge_history().await {
                        error!(error = %e, "Queue history purge failed");
                    }
                }
            },
        )));

        // Ticks several times per bucket so closing lags the boundary by little.
        let engine = Arc::clone(self);
        handles.push(tokio::spawn(every(
            self.config.metrics_bucket / 4,
            shutdown.subscribe(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    if let Err(e) = engine.aggregator.tick(Utc::now()).await {
                        error!(error = %e, "Metrics aggregation failed");
                    }
                    if let Err(e) = engine.refresh_gauges().await {
                        warn!(error = %e, "Failed to refresh gauges");
                    }
                }
            },
        )));

        handles.push(tokio::spawn(
            Arc::clone(&self.scheduler).run(shutdown.subscribe()),
        ));

        info!(loops = handles.len(), "Maintenance loops started");
        handles
    }

    /// Deletes finished queue items older than the metrics history and the
    /// eviction grace period. A failed identity becomes requestable again
    /// once its item is purged.
    async fn purge_history(&self) -> Result<u64, EngineError> {
        let history = u32::try_from(self.config.metrics_retention)
            .ok()
            .and_then(|n| self.config.metrics_bucket.checked_mul(n))
            .unwrap_or(Duration::MAX);
        let keep = history.max(self.config.eviction_grace);
        let Some(cutoff) = chrono::Duration::from_std(keep)
            .ok()
            .and_then(|keep| Utc::now().checked_sub_signed(keep))
        else {
            return Ok(0);
        };
        let purged = self.queue.purge_finished(cutoff).await?;
        if purged > 0 {
            debug!(purged, "Purged finished queue items");
        }
        Ok(purged)
    }
}

/// Runs `task` every `interval` until shutdown.
async fn every<F, Fut>(interval: Duration, mut shutdown: broadcast::Receiver<()>, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval.max(MIN_MAINTENANCE_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => task().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProducer {
        calls: AtomicUsize,
        result: fn() -> Result<ProducedContent, ProducerError>,
    }

    impl FixedProducer {
        fn new(result: fn() -> Result<ProducedContent, ProducerError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result,
            })
        }
    }

    #[async_trait]
    impl ContentProducer for FixedProducer {
        async fn produce(
            &self,
            _identity: &ContentIdentity,
        ) -> Result<ProducedContent, ProducerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn identity() -> ContentIdentity {
        ContentIdentity::new("5", "Math", "fractions")
    }

    #[tokio::test]
    async fn test_lookup_miss_without_side_effects() {
        let engine = Engine::in_memory(EngineConfig::default());

        let outcome = engine.lookup(&identity(), MissPolicy::None).await.unwrap();
        assert_eq!(
            outcome,
            LookupOutcome::Miss {
                reason: MissReason::Absent
            }
        );
        assert_eq!(engine.queue().stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_lookup_enqueues_at_user_priority() {
        let engine = Engine::in_memory(EngineConfig::default());

        let first = engine.lookup(&identity(), MissPolicy::Enqueue).await.unwrap();
        let second = engine.lookup(&identity(), MissPolicy::Enqueue).await.unwrap();

        let LookupOutcome::Pending { item_id, coalesced } = first else {
            panic!("expected pending, got {:?}", first);
        };
        assert!(!coalesced);
        assert_eq!(
            second,
            LookupOutcome::Pending {
                item_id,
                coalesced: true
            }
        );

        let item = engine.queue().get(item_id).await.unwrap().unwrap();
        assert_eq!(item.priority, engine.config().user_priority);
    }

    #[tokio::test]
    async fn test_lookup_hits_after_put() {
        let engine = Engine::in_memory(EngineConfig::default());
        engine
            .put(&identity(), ProducedContent::new("{\"body\":\"halves\"}"))
            .await
            .unwrap();

        let outcome = engine.lookup(&identity(), MissPolicy::Enqueue).await.unwrap();
        let entry = outcome.entry().expect("hit");
        assert_eq!(entry.artifact, "{\"body\":\"halves\"}");
        assert_eq!(entry.hit_count, 1);
    }

    #[tokio::test]
    async fn test_produce_policy_caches_result() {
        let producer = FixedProducer::new(|| Ok(ProducedContent::new("lesson").with_variant("m1")));
        let engine = Engine::in_memory(EngineConfig::default()).with_producer(producer.clone());

        let outcome = engine.lookup(&identity(), MissPolicy::Produce).await.unwrap();
        let LookupOutcome::Produced(entry) = outcome else {
            panic!("expected produced");
        };
        assert_eq!(entry.metadata.producer_variant.as_deref(), Some("m1"));

        let again = engine.lookup(&identity(), MissPolicy::Produce).await.unwrap();
        assert!(matches!(again, LookupOutcome::Hit(_)));
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_produce_policy_queues_transient_failure() {
        let producer = FixedProducer::new(|| Err(ProducerError::Transient("429".to_string())));
        let engine = Engine::in_memory(EngineConfig::default()).with_producer(producer);

        let outcome = engine.lookup(&identity(), MissPolicy::Produce).await.unwrap();
        assert!(matches!(outcome, LookupOutcome::Pending { .. }));
    }

    #[tokio::test]
    async fn test_produce_policy_surfaces_fatal_failure() {
        let producer = FixedProducer::new(|| Err(ProducerError::Fatal("policy".to_string())));
        let engine = Engine::in_memory(EngineConfig::default()).with_producer(producer);

        let err = engine
            .lookup(&identity(), MissPolicy::Produce)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Producer(ProducerError::Fatal(_))));
        assert_eq!(engine.queue().stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_produce_policy_requires_producer() {
        let engine = Engine::in_memory(EngineConfig::default());
        let err = engine
            .lookup(&identity(), MissPolicy::Produce)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoProducer));
        assert!(matches!(engine.worker_pool(), Err(EngineError::NoProducer)));
    }

    #[tokio::test]
    async fn test_content_status_follows_item_lifecycle() {
        let engine = Engine::in_memory(EngineConfig::default());
        assert_eq!(
            engine.content_status(&identity()).await.unwrap(),
            ContentStatus::Unknown
        );

        let enqueued = engine.enqueue(&identity(), 10, 0).await.unwrap();
        assert!(matches!(
            engine.content_status(&identity()).await.unwrap(),
            ContentStatus::NotYetAvailable {
                queue_status: QueueStatus::Pending,
                ..
            }
        ));

        let worker = engine.coordinator().register("w").await.unwrap();
        engine.coordinator().lease(worker.id).await.unwrap().unwrap();
        engine
            .coordinator()
            .report_outcome(
                worker.id,
                enqueued.item_id,
                crate::queue::ItemOutcome::fatal("rejected"),
            )
            .await
            .unwrap();

        let status = engine.content_status(&identity()).await.unwrap();
        let ContentStatus::GenerationFailed { item_id, error } = status else {
            panic!("expected failure, got {:?}", status);
        };
        assert_eq!(item_id, enqueued.item_id);
        assert_eq!(error.as_deref(), Some("rejected"));

        // A failed identity is reported rather than silently retried.
        let outcome = engine.lookup(&identity(), MissPolicy::Enqueue).await.unwrap();
        assert!(matches!(outcome, LookupOutcome::Failed { .. }));

        engine
            .put(&identity(), ProducedContent::new("manual"))
            .await
            .unwrap();
        assert!(matches!(
            engine.content_status(&identity()).await.unwrap(),
            ContentStatus::Available { .. }
        ));
    }

    #[tokio::test]
    async fn test_evict_expired_uses_grace() {
        let config = EngineConfig::default()
            .with_default_ttl(Duration::from_secs(60))
            .with_eviction_grace(Duration::from_secs(60));
        let engine = Engine::in_memory(config);
        let now = Utc::now();
        engine
            .put_with_duration(&identity(), ProducedContent::new("x"), 0, now)
            .await
            .unwrap();

        assert_eq!(
            engine
                .evict_expired_at(now + chrono::Duration::seconds(90))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            engine
                .evict_expired_at(now + chrono::Duration::seconds(180))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_item() {
        let engine = Engine::in_memory(EngineConfig::default());
        let enqueued = engine.enqueue(&identity(), 10, 3).await.unwrap();

        let item = engine.cancel(enqueued.item_id).await.unwrap();
        assert_eq!(item.status, QueueStatus::Cancelled);
        assert_eq!(
            engine.content_status(&identity()).await.unwrap(),
            ContentStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_shutdown() {
        let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
        let (tx, _rx) = broadcast::channel(1);

        let handles = engine.spawn_maintenance(&tx);
        assert_eq!(handles.len(), 4);

        tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
