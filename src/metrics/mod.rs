//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for the engine:
//!
//! - **prometheus**: registry and metric statics, text export
//! - **collectors**: [`MetricsCollector`], the recording interface used by
//!   the queue, cache and coordinator paths
//! - **aggregator**: [`MetricsAggregator`], time-bucketed hit/miss and
//!   production rollups per dimension
//!
//! # Example
//!
//! ```ignore
//! use lesson_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Create a collector for recording metrics
//! let collector = MetricsCollector::new();
//! collector.record_lookup(true);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod aggregator;
pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use aggregator::{AggregatorError, MetricsAggregator, MetricsBucket, ALL_DIMENSION};
pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

// Re-export metric constants for direct access when needed
pub use prometheus::{
    ACTIVE_WORKERS, BUCKET_HIT_RATE, CACHE_ENTRIES, CACHE_EVICTIONS_TOTAL, CACHE_LOOKUPS_TOTAL,
    LEASES_TOTAL, OUTCOMES_TOTAL, PRODUCTION_DURATION, QUEUE_DEPTH, QUEUE_ENQUEUED_TOTAL,
    RECLAIMED_LEASES_TOTAL, REGISTRY,
};
