//! Worker pool for producing content from the generation queue.
//!
//! This module provides a pool of workers that lease items through the
//! [`WorkerCoordinator`]. Each worker runs as an independent async task:
//! it registers, heartbeats on an interval, leases, invokes the producer
//! with a timeout, writes successful artifacts to the cache, and reports
//! the outcome.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Per-worker heartbeat task
//! - Pool statistics tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, ProducerMetadata};
use crate::config::EngineConfig;
use crate::error::{CoordinatorError, ProducerError};
use crate::producer::ContentProducer;
use crate::queue::{ItemOutcome, QueueItem};

use super::service::WorkerCoordinator;
use super::worker::WorkerStatus;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Coordinator error outside an individual worker.
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Worker names are `<prefix>-<index>`; registration is idempotent by name.
    pub name_prefix: String,
    /// How often to poll for new items when the queue is empty.
    pub poll_interval: Duration,
    /// How often each worker heartbeats.
    pub heartbeat_interval: Duration,
    /// Maximum time allowed for a single producer call.
    pub producer_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// TTL for categories without an override.
    pub default_ttl: Duration,
    /// TTL overrides keyed by content category.
    pub category_ttls: HashMap<String, Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            name_prefix: "worker".to_string(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            producer_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(60),
            default_ttl: Duration::from_secs(30 * 24 * 3600),
            category_ttls: HashMap::new(),
        }
    }
}

impl From<&EngineConfig> for WorkerPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            name_prefix: "worker".to_string(),
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            producer_timeout: config.producer_timeout,
            shutdown_timeout: config.shutdown_timeout,
            default_ttl: config.default_ttl,
            category_ttls: config.category_ttls.clone(),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the worker name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the producer timeout.
    pub fn with_producer_timeout(mut self, timeout: Duration) -> Self {
        self.producer_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn ttl_for(&self, category: &str) -> Duration {
        self.category_ttls
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently producing.
    pub active_workers: usize,
    /// Items produced and cached.
    pub items_completed: u64,
    /// Items whose attempt failed (retried or terminal).
    pub items_failed: u64,
    /// Average attempt duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts processed.
    pub fn total_processed(&self) -> u64 {
        self.items_completed + self.items_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.items_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    items_completed: AtomicU64,
    items_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            items_completed: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.items_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.items_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.items_completed.load(Ordering::SeqCst);
        let failed = self.items_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            items_completed: completed,
            items_failed: failed,
            average_duration,
        }
    }
}

/// Worker pool that runs local workers against the coordinator.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    coordinator: Arc<WorkerCoordinator>,
    cache: Arc<dyn CacheStore>,
    producer: Arc<dyn ContentProducer>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Arguments
    ///
    /// * `config` - Pool configuration
    /// * `coordinator` - Coordinator that hands out leases
    /// * `cache` - Cache receiving produced artifacts
    /// * `producer` - Content producer invoked for each item
    pub fn new(
        config: WorkerPoolConfig,
        coordinator: Arc<WorkerCoordinator>,
        cache: Arc<dyn CacheStore>,
        producer: Arc<dyn ContentProducer>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            coordinator,
            cache,
            producer,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Recover leases stranded by a previous run of this process.
        let reclaimed = self.coordinator.reconcile().await?;
        if !reclaimed.is_empty() {
            info!(recovered = reclaimed.len(), "Recovered stranded leases");
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                name: format!("{}-{}", self.config.name_prefix, i),
                coordinator: Arc::clone(&self.coordinator),
                cache: Arc::clone(&self.cache),
                producer: Arc::clone(&self.producer),
                shutdown_rx: self.shutdown_tx.subscribe(),
                config: self.config.clone(),
                stats: Arc::clone(&self.stats),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current item before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let shutdown_future = futures::future::join_all(handles);

        match tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task panicked during shutdown");
                    }
                }
                self.is_running.store(false, Ordering::SeqCst);
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that produces leased items.
struct Worker {
    name: String,
    coordinator: Arc<WorkerCoordinator>,
    cache: Arc<dyn CacheStore>,
    producer: Arc<dyn ContentProducer>,
    shutdown_rx: broadcast::Receiver<()>,
    config: WorkerPoolConfig,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop.
    async fn run(mut self) {
        let mut worker_id = match self.coordinator.register(&self.name).await {
            Ok(record) => record.id,
            Err(e) => {
                error!(worker = %self.name, error = %e, "Worker registration failed");
                return;
            }
        };

        let heartbeat = self.spawn_heartbeat(worker_id);
        info!(worker_id = %worker_id, worker = %self.name, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %worker_id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.coordinator.lease(worker_id).await {
                Ok(Some(item)) => {
                    self.process_item(worker_id, item).await;
                }
                Ok(None) => {
                    debug!(worker_id = %worker_id, "No items available");
                    if self.idle().await {
                        break;
                    }
                }
                Err(CoordinatorError::WorkerUnavailable { status, .. })
                    if status == WorkerStatus::Offline.as_str() =>
                {
                    // Reconciliation declared us dead; come back under the same name.
                    warn!(worker_id = %worker_id, "Worker marked offline, re-registering");
                    match self.coordinator.register(&self.name).await {
                        Ok(record) => worker_id = record.id,
                        Err(e) => {
                            error!(worker = %self.name, error = %e, "Re-registration failed");
                            if self.idle().await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Failed to lease item");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }

        heartbeat.abort();
        if let Err(e) = self.coordinator.deregister(worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "Failed to deregister worker");
        }
        info!(worker_id = %worker_id, "Worker stopped");
    }

    /// Waits one poll interval. Returns `true` if shutdown was signalled.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }

    fn spawn_heartbeat(&self, worker_id: Uuid) -> JoinHandle<()> {
        let coordinator = Arc::clone(&self.coordinator);
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.heartbeat(worker_id).await {
                    warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
                }
            }
        })
    }

    /// Produces one leased item and reports the outcome.
    async fn process_item(&self, worker_id: Uuid, item: QueueItem) {
        let item_id = item.id;
        let start_time = Instant::now();

        info!(
            worker_id = %worker_id,
            item_id = %item_id,
            identity = %item.identity_key,
            attempt = item.retry_count + 1,
            "Processing item"
        );

        self.stats.increment_active();
        let outcome = self.produce(&item).await;
        let duration = start_time.elapsed();
        self.stats.decrement_active();

        if outcome.is_success() {
            self.stats.record_completion(duration);
        } else {
            self.stats.record_failure(duration);
        }

        if let Err(e) = self
            .coordinator
            .report_outcome(worker_id, item_id, outcome)
            .await
        {
            error!(
                worker_id = %worker_id,
                item_id = %item_id,
                error = %e,
                "Failed to report outcome"
            );
        }
    }

    async fn produce(&self, item: &QueueItem) -> ItemOutcome {
        // Coalesced or warming work may target content that is already servable.
        match self.cache.peek(&item.identity_key).await {
            Ok(Some(entry)) if entry.is_servable(Utc::now()) => {
                debug!(item_id = %item.id, "Content already cached, skipping production");
                return ItemOutcome::success(entry.id, 0);
            }
            Ok(_) => {}
            Err(e) => warn!(item_id = %item.id, error = %e, "Cache peek failed"),
        }

        let started = Instant::now();
        let produced = tokio::time::timeout(
            self.config.producer_timeout,
            self.producer.produce(&item.identity),
        )
        .await;

        let content = match produced {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                warn!(item_id = %item.id, producer = self.producer.name(), error = %e, "Producer failed");
                return ItemOutcome::from(&e);
            }
            Err(_) => {
                let err = ProducerError::Timeout {
                    seconds: self.config.producer_timeout.as_secs(),
                };
                warn!(item_id = %item.id, error = %err, "Producer timed out");
                return ItemOutcome::from(&err);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let metadata = ProducerMetadata {
            duration_ms,
            producer_variant: content.producer_variant,
        };
        let ttl = self.config.ttl_for(item.identity.category());

        match self
            .cache
            .put(&item.identity, content.artifact, metadata, ttl, Utc::now())
            .await
        {
            Ok(entry) => ItemOutcome::success(entry.id, duration_ms),
            Err(e) => ItemOutcome::transient(format!("cache write failed: {}", e)),
        }
    }
}
