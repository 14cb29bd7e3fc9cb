//! High-level recording interface over the Prometheus statics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use crate::queue::{QueueStats, QueueStatus};

use super::prometheus::{
    ACTIVE_WORKERS, BUCKET_HIT_RATE, CACHE_ENTRIES, CACHE_EVICTIONS_TOTAL, CACHE_LOOKUPS_TOTAL,
    LEASES_TOTAL, OUTCOMES_TOTAL, PRODUCTION_DURATION, QUEUE_DEPTH, QUEUE_ENQUEUED_TOTAL,
    RECLAIMED_LEASES_TOTAL,
};

/// Metrics collector for recording engine operational metrics.
///
/// # Example
///
/// ```ignore
/// use lesson_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_lookup(true);
/// collector.record_outcome("completed", Some(2.5));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a cache lookup result.
    pub fn record_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        if let Some(lookups) = CACHE_LOOKUPS_TOTAL.get() {
            lookups.with_label_values(&[result]).inc();
        }
        tracing::trace!(result = result, "Recorded cache lookup metric");
    }

    /// Update stored and valid cache row counts.
    pub fn update_cache_entries(&self, stored: u64, valid: u64) {
        if let Some(entries) = CACHE_ENTRIES.get() {
            entries.with_label_values(&["stored"]).set(stored as f64);
            entries.with_label_values(&["valid"]).set(valid as f64);
        }
    }

    /// Record rows removed by an eviction sweep.
    pub fn record_evictions(&self, removed: u64) {
        if let Some(evictions) = CACHE_EVICTIONS_TOTAL.get() {
            evictions.inc_by(removed as f64);
        }
        tracing::trace!(removed = removed, "Recorded eviction metric");
    }

    /// Update per-status queue gauges.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        if let Some(depth) = QUEUE_DEPTH.get() {
            for status in QueueStatus::ALL {
                depth
                    .with_label_values(&[status.as_str()])
                    .set(stats.get(status) as f64);
            }
        }
    }

    /// Record an enqueue call.
    pub fn record_enqueue(&self, coalesced: bool) {
        let result = if coalesced { "coalesced" } else { "created" };
        if let Some(enqueued) = QUEUE_ENQUEUED_TOTAL.get() {
            enqueued.with_label_values(&[result]).inc();
        }
    }

    /// Record a lease handed to a worker.
    pub fn record_lease(&self) {
        if let Some(leases) = LEASES_TOTAL.get() {
            leases.inc();
        }
    }

    /// Record a reported outcome.
    ///
    /// # Arguments
    ///
    /// * `result` - "completed", "retry" or "failed"
    /// * `duration_secs` - Producer latency, for successful productions
    pub fn record_outcome(&self, result: &str, duration_secs: Option<f64>) {
        if let Some(outcomes) = OUTCOMES_TOTAL.get() {
            outcomes.with_label_values(&[result]).inc();
        }

        if let (Some(histogram), Some(secs)) = (PRODUCTION_DURATION.get(), duration_secs) {
            histogram.observe(secs);
        }

        tracing::trace!(result = result, duration_secs = ?duration_secs, "Recorded outcome metric");
    }

    /// Update the count of workers able to take work.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    /// Record leases reclaimed by reconciliation.
    pub fn record_reclaimed(&self, count: usize) {
        if let Some(reclaimed) = RECLAIMED_LEASES_TOTAL.get() {
            reclaimed.inc_by(count as f64);
        }
    }

    /// Mirror the hit rate of a closed bucket.
    pub fn record_bucket(&self, dimension: &str, hit_rate: f64) {
        if let Some(gauge) = BUCKET_HIT_RATE.get() {
            gauge.with_label_values(&[dimension]).set(hit_rate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_cache_metrics() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_lookup(true);
        collector.record_lookup(false);
        collector.update_cache_entries(10, 7);
        collector.record_evictions(3);

        assert!(export_metrics().contains("lesson_forge_cache_evictions_total"));
    }

    #[test]
    fn test_update_queue_depth() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        let mut stats = QueueStats::default();
        stats.add(QueueStatus::Pending, 4);
        stats.add(QueueStatus::Failed, 1);
        collector.update_queue_depth(&stats);

        let text = export_metrics();
        assert!(text.contains("status=\"pending\""));
    }

    #[test]
    fn test_record_worker_metrics() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_enqueue(false);
        collector.record_enqueue(true);
        collector.record_lease();
        collector.record_outcome("completed", Some(1.5));
        collector.record_outcome("retry", None);
        collector.update_workers(4);
        collector.record_reclaimed(1);
        collector.record_bucket("all", 0.75);
    }
}
