//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by lesson-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all lesson-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Cache lookups, labeled by result (hit/miss).
pub static CACHE_LOOKUPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Cache rows, labeled by state (stored/valid).
pub static CACHE_ENTRIES: OnceLock<GaugeVec> = OnceLock::new();

/// Cache rows physically removed by eviction.
pub static CACHE_EVICTIONS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Queue items, labeled by status.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Enqueue calls, labeled by result (created/coalesced).
pub static QUEUE_ENQUEUED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Leases handed to workers.
pub static LEASES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Reported outcomes, labeled by result (completed/retry/failed).
pub static OUTCOMES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Producer latency of successful productions in seconds.
pub static PRODUCTION_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of workers able to take work.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Leases reclaimed from workers with stale heartbeats.
pub static RECLAIMED_LEASES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Hit rate of the latest closed metrics bucket, labeled by dimension.
pub static BUCKET_HIT_RATE: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later calls
/// leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Cache metrics
    let cache_lookups_total = CounterVec::new(
        Opts::new("lesson_forge_cache_lookups_total", "Cache lookups by result"),
        &["result"],
    )?;

    let cache_entries = GaugeVec::new(
        Opts::new("lesson_forge_cache_entries", "Cache rows by state"),
        &["state"],
    )?;

    let cache_evictions_total = Counter::new(
        "lesson_forge_cache_evictions_total",
        "Cache rows removed by eviction",
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("lesson_forge_queue_items", "Queue items by status"),
        &["status"],
    )?;

    let queue_enqueued_total = CounterVec::new(
        Opts::new("lesson_forge_enqueued_total", "Enqueue calls by result"),
        &["result"],
    )?;

    let leases_total = Counter::new("lesson_forge_leases_total", "Leases handed to workers")?;

    let outcomes_total = CounterVec::new(
        Opts::new("lesson_forge_outcomes_total", "Reported outcomes by result"),
        &["result"],
    )?;

    let production_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "lesson_forge_production_duration_seconds",
            "Producer latency of successful productions",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )?;

    // Worker metrics
    let active_workers = Gauge::new(
        "lesson_forge_active_workers",
        "Workers able to take work",
    )?;

    let reclaimed_leases_total = Counter::new(
        "lesson_forge_reclaimed_leases_total",
        "Leases reclaimed from stale workers",
    )?;

    // Rollup metrics
    let bucket_hit_rate = GaugeVec::new(
        Opts::new(
            "lesson_forge_bucket_hit_rate",
            "Hit rate of the latest closed metrics bucket",
        ),
        &["dimension"],
    )?;

    registry.register(Box::new(cache_lookups_total.clone()))?;
    registry.register(Box::new(cache_entries.clone()))?;
    registry.register(Box::new(cache_evictions_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(queue_enqueued_total.clone()))?;
    registry.register(Box::new(leases_total.clone()))?;
    registry.register(Box::new(outcomes_total.clone()))?;
    registry.register(Box::new(production_duration.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(reclaimed_leases_total.clone()))?;
    registry.register(Box::new(bucket_hit_rate.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = CACHE_LOOKUPS_TOTAL.set(cache_lookups_total);
    let _ = CACHE_ENTRIES.set(cache_entries);
    let _ = CACHE_EVICTIONS_TOTAL.set(cache_evictions_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = QUEUE_ENQUEUED_TOTAL.set(queue_enqueued_total);
    let _ = LEASES_TOTAL.set(leases_total);
    let _ = OUTCOMES_TOTAL.set(outcomes_total);
    let _ = PRODUCTION_DURATION.set(production_duration);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = RECLAIMED_LEASES_TOTAL.set(reclaimed_leases_total);
    let _ = BUCKET_HIT_RATE.set(bucket_hit_rate);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(lookups) = CACHE_LOOKUPS_TOTAL.get() {
            lookups.with_label_values(&["hit"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("lesson_forge_cache_lookups_total"));
    }
}
