//! Warming passes.
//!
//! A warming rule asks for a minimum number of cached variants (`v1..vN`)
//! of each identity it covers. A pass counts what is already servable,
//! skips variants that are already queued or whose last attempt failed, and
//! enqueues the rest.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{CacheFilter, CacheStore};
use crate::config::WarmingRule;
use crate::error::SchedulerError;
use crate::identity::ContentIdentity;
use crate::metrics::MetricsAggregator;
use crate::queue::{QueueStatus, QueueStore};

/// Name of the `n`th warming variant (1-based).
pub fn variant_name(n: u32) -> String {
    format!("v{}", n)
}

/// Summary of one warming pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmingReport {
    /// Rules evaluated.
    pub rules: usize,
    /// Base identities (rule × skill) evaluated.
    pub identities: usize,
    /// Base identities that already had enough valid variants.
    pub satisfied: usize,
    /// Variants already waiting in the queue.
    pub already_queued: usize,
    /// Variants skipped because their last attempt failed terminally.
    pub failed: usize,
    /// Newly created queue items.
    pub enqueued: Vec<Uuid>,
}

impl WarmingReport {
    fn merge(&mut self, other: WarmingReport) {
        self.rules += other.rules;
        self.identities += other.identities;
        self.satisfied += other.satisfied;
        self.already_queued += other.already_queued;
        self.failed += other.failed;
        self.enqueued.extend(other.enqueued);
    }
}

/// Evaluates warming rules against the cache and queue.
pub struct Warmer {
    queue: Arc<dyn QueueStore>,
    cache: Arc<dyn CacheStore>,
    priority: i32,
    max_retries: u32,
    aggregator: Option<Arc<MetricsAggregator>>,
}

impl Warmer {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        cache: Arc<dyn CacheStore>,
        priority: i32,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            cache,
            priority,
            max_retries,
            aggregator: None,
        }
    }

    /// Counts newly created items in the aggregator's `enqueued` rollup.
    pub fn with_aggregator(mut self, aggregator: Arc<MetricsAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Runs every rule once.
    pub async fn warm(
        &self,
        rules: &[WarmingRule],
        now: DateTime<Utc>,
    ) -> Result<WarmingReport, SchedulerError> {
        let mut report = WarmingReport::default();
        for rule in rules {
            report.merge(self.warm_rule(rule, now).await?);
        }
        Ok(report)
    }

    /// Runs a single rule.
    pub async fn warm_rule(
        &self,
        rule: &WarmingRule,
        now: DateTime<Utc>,
    ) -> Result<WarmingReport, SchedulerError> {
        let mut report = WarmingReport {
            rules: 1,
            ..Default::default()
        };

        for base in rule.identities() {
            report.identities += 1;
            self.warm_identity(&base, rule.desired_variants, now, &mut report)
                .await?;
        }

        Ok(report)
    }

    async fn warm_identity(
        &self,
        base: &ContentIdentity,
        desired: u32,
        now: DateTime<Utc>,
        report: &mut WarmingReport,
    ) -> Result<(), SchedulerError> {
        let valid = self
            .cache
            .count_valid(&CacheFilter::variants_of(base), now)
            .await?;
        if valid >= u64::from(desired) {
            report.satisfied += 1;
            return Ok(());
        }

        let mut covered: u64 = 0;
        for n in 1..=desired {
            if covered >= u64::from(desired) {
                break;
            }

            let identity = base.clone().with_variant(variant_name(n));
            let key = identity.key();

            if let Some(entry) = self.cache.peek(&key).await? {
                if entry.is_servable(now) {
                    covered += 1;
                    continue;
                }
            }
            if self.queue.find_open(&key).await?.is_some() {
                report.already_queued += 1;
                covered += 1;
                continue;
            }
            if let Some(latest) = self.queue.latest_for(&key).await? {
                if latest.status == QueueStatus::Failed {
                    debug!(identity = %identity, item_id = %latest.id, "Skipping failed warming variant");
                    report.failed += 1;
                    covered += 1;
                    continue;
                }
            }

            let enqueued = self
                .queue
                .enqueue(&identity, self.priority, self.max_retries, now)
                .await?;
            if enqueued.coalesced {
                report.already_queued += 1;
            } else {
                if let Some(aggregator) = &self.aggregator {
                    aggregator.record_enqueue(&identity, now);
                }
                debug!(identity = %identity, item_id = %enqueued.item_id, "Enqueued warming variant");
                report.enqueued.push(enqueued.item_id);
            }
            covered += 1;
        }

        Ok(())
    }
}
