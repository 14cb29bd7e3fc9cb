//! Pre-generation scheduling.
//!
//! The scheduler decides what to produce before anyone asks for it. It has
//! two sources of work:
//!
//! - **Warming**: standing rules that keep a minimum number of cached
//!   variants per grade, subject and skill
//! - **Navigation**: observed A→B transitions; a visit to A enqueues B once
//!   the transition has been seen often enough
//!
//! Both paths only ever call `QueueStore::enqueue`, at the low-urgency
//! warming priority, so user-triggered requests always lease first. Neither
//! path resubmits an identity whose most recent item ended in `failed`.
//!
//! # Example
//!
//! ```rust,ignore
//! use lesson_forge::scheduler::PreGenerationScheduler;
//!
//! let scheduler = Arc::new(PreGenerationScheduler::new(queue, cache, &config));
//! let report = scheduler.warm().await?;
//! println!("enqueued {} variants", report.enqueued.len());
//!
//! // Runs warming passes until shutdown is signalled
//! tokio::spawn(scheduler.clone().run(shutdown_rx));
//! ```

pub mod navigation;
pub mod warming;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::{EngineConfig, WarmingRule};
use crate::error::SchedulerError;
use crate::identity::ContentIdentity;
use crate::metrics::{MetricsAggregator, MetricsCollector};
use crate::queue::{QueueStatus, QueueStore};

pub use navigation::{NavigationTracker, Prediction};
pub use warming::{variant_name, Warmer, WarmingReport};

/// Enqueues content ahead of demand.
pub struct PreGenerationScheduler {
    queue: Arc<dyn QueueStore>,
    cache: Arc<dyn CacheStore>,
    warmer: Warmer,
    rules: Vec<WarmingRule>,
    navigation: NavigationTracker,
    priority: i32,
    max_retries: u32,
    interval: Duration,
    metrics: MetricsCollector,
    aggregator: Option<Arc<MetricsAggregator>>,
}

impl PreGenerationScheduler {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        cache: Arc<dyn CacheStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            warmer: Warmer::new(
                Arc::clone(&queue),
                Arc::clone(&cache),
                config.warming_priority,
                config.default_max_retries,
            ),
            queue,
            cache,
            rules: config.warming_rules.clone(),
            navigation: NavigationTracker::new(
                config.navigation_window,
                config.navigation_threshold,
            ),
            priority: config.warming_priority,
            max_retries: config.default_max_retries,
            interval: config.warming_interval,
            metrics: MetricsCollector::new(),
            aggregator: None,
        }
    }

    /// Reports scheduler enqueues to the bucketed rollups.
    pub fn with_aggregator(mut self, aggregator: Arc<MetricsAggregator>) -> Self {
        self.warmer = self.warmer.with_aggregator(Arc::clone(&aggregator));
        self.aggregator = Some(aggregator);
        self
    }

    pub fn rules(&self) -> &[WarmingRule] {
        &self.rules
    }

    pub fn navigation(&self) -> &NavigationTracker {
        &self.navigation
    }

    /// Runs one warming pass over every configured rule.
    pub async fn warm(&self) -> Result<WarmingReport, SchedulerError> {
        self.warm_at(Utc::now()).await
    }

    pub async fn warm_at(&self, now: DateTime<Utc>) -> Result<WarmingReport, SchedulerError> {
        let report = self.warmer.warm(&self.rules, now).await?;
        for _ in &report.enqueued {
            self.metrics.record_enqueue(false);
        }
        Ok(report)
    }

    /// Records a content visit and enqueues predicted successors that are
    /// not already cached.
    ///
    /// Returns the ids of newly created queue items.
    pub async fn record_visit(
        &self,
        session: &str,
        identity: &ContentIdentity,
    ) -> Result<Vec<Uuid>, SchedulerError> {
        self.record_visit_at(session, identity, Utc::now()).await
    }

    pub async fn record_visit_at(
        &self,
        session: &str,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, SchedulerError> {
        let predictions = self.navigation.record_visit(session, identity, now)?;

        let mut enqueued = Vec::new();
        for prediction in predictions {
            let target = prediction.identity;
            let key = target.key();
            if let Some(entry) = self.cache.peek(&key).await? {
                if entry.is_servable(now) {
                    continue;
                }
            }
            if self.queue.find_open(&key).await?.is_none() {
                if let Some(latest) = self.queue.latest_for(&key).await? {
                    if latest.status == QueueStatus::Failed {
                        debug!(identity = %target, item_id = %latest.id, "Skipping failed prediction");
                        continue;
                    }
                }
            }

            let result = self
                .queue
                .enqueue(&target, self.priority, self.max_retries, now)
                .await?;
            self.metrics.record_enqueue(result.coalesced);
            if !result.coalesced {
                if let Some(aggregator) = &self.aggregator {
                    aggregator.record_enqueue(&target, now);
                }
                debug!(
                    from = %identity,
                    identity = %target,
                    transitions = prediction.count,
                    "Enqueued predicted content"
                );
                enqueued.push(result.item_id);
            }
        }

        Ok(enqueued)
    }

    /// Runs warming passes on the configured interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(rules = self.rules.len(), interval = ?self.interval, "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            match self.warm_at(now).await {
                Ok(report) => info!(
                    rules = report.rules,
                    identities = report.identities,
                    satisfied = report.satisfied,
                    already_queued = report.already_queued,
                    failed = report.failed,
                    enqueued = report.enqueued.len(),
                    "Warming pass complete"
                ),
                Err(e) => error!(error = %e, "Warming pass failed"),
            }

            match self.navigation.prune_sessions(now) {
                Ok(0) => {}
                Ok(pruned) => debug!(pruned, "Pruned idle navigation sessions"),
                Err(e) => error!(error = %e, "Failed to prune navigation sessions"),
            }
        }

        info!("Scheduler stopped");
    }
}
