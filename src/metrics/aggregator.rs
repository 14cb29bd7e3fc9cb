//! Time-bucketed rollups of cache and queue activity.
//!
//! Request events land in the open bucket for the instant they happen.
//! [`MetricsAggregator::tick`] closes every bucket whose window has ended,
//! fills in production latency from the queue items that finished inside
//! the window, and freezes the result. Closed buckets are never updated.
//!
//! Every event counts toward the `all` dimension plus the identity's own
//! dimensions (`grade:<g>`, `subject:<s>`).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error::QueueError;
use crate::identity::ContentIdentity;
use crate::queue::{QueueStatus, QueueStore};

use super::collectors::MetricsCollector;

/// Dimension every event contributes to.
pub const ALL_DIMENSION: &str = "all";

/// Errors raised while closing buckets.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Aggregator lock poisoned")]
    LockPoisoned,
}

/// Rollup for one dimension over one time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsBucket {
    pub dimension: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Mean producer latency of items completed in the window.
    pub avg_production_ms: Option<f64>,
    pub completed: u64,
    pub failed: u64,
    pub enqueued: u64,
    /// Rows deleted by eviction sweeps run in the window. `all` only.
    pub evictions: u64,
    pub closed: bool,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    enqueued: u64,
}

#[derive(Debug, Default)]
struct OpenBucket {
    dimensions: HashMap<String, Counters>,
    evictions: u64,
}

#[derive(Debug, Default)]
struct AggregatorState {
    open: BTreeMap<DateTime<Utc>, OpenBucket>,
    closed: HashMap<String, VecDeque<MetricsBucket>>,
    /// End of the most recent window seen by `tick`.
    closed_until: Option<DateTime<Utc>>,
}

/// Accumulates request events and closes them into buckets.
pub struct MetricsAggregator {
    queue: Arc<dyn QueueStore>,
    width: chrono::Duration,
    retention: usize,
    state: Mutex<AggregatorState>,
    collector: MetricsCollector,
}

impl MetricsAggregator {
    /// Creates an aggregator.
    ///
    /// # Arguments
    ///
    /// * `queue` - Source of finished items for latency rollups
    /// * `width` - Bucket width, at least one second
    /// * `retention` - Closed buckets kept per dimension
    pub fn new(queue: Arc<dyn QueueStore>, width: Duration, retention: usize) -> Self {
        let secs = width.as_secs().max(1) as i64;
        Self {
            queue,
            width: chrono::Duration::seconds(secs),
            retention: retention.max(1),
            state: Mutex::new(AggregatorState::default()),
            collector: MetricsCollector::new(),
        }
    }

    /// Start of the bucket containing `at`.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.width.num_seconds();
        let start = at.timestamp().div_euclid(width) * width;
        Utc.timestamp_opt(start, 0).single().unwrap_or(at)
    }

    /// Records a cache lookup.
    pub fn record_lookup(&self, identity: &ContentIdentity, hit: bool, now: DateTime<Utc>) {
        self.with_open(now, |bucket| {
            for dimension in dimensions_of(identity) {
                let counters = bucket.dimensions.entry(dimension).or_default();
                if hit {
                    counters.hits += 1;
                } else {
                    counters.misses += 1;
                }
            }
        });
    }

    /// Records a newly created queue item.
    pub fn record_enqueue(&self, identity: &ContentIdentity, now: DateTime<Utc>) {
        self.with_open(now, |bucket| {
            for dimension in dimensions_of(identity) {
                bucket.dimensions.entry(dimension).or_default().enqueued += 1;
            }
        });
    }

    /// Records the result of an eviction sweep.
    pub fn record_evictions(&self, removed: u64, now: DateTime<Utc>) {
        self.with_open(now, |bucket| bucket.evictions += removed);
    }

    fn with_open(&self, now: DateTime<Utc>, f: impl FnOnce(&mut OpenBucket)) {
        let start = self.bucket_start(now);
        // Observational only; a poisoned lock drops the event.
        if let Ok(mut state) = self.state.lock() {
            // Events stamped inside an already closed window go to the oldest open one.
            let start = match state.closed_until {
                Some(closed_until) if start < closed_until => closed_until,
                _ => start,
            };
            f(state.open.entry(start).or_default());
        }
    }

    /// Closes every bucket whose window ended at or before `now`.
    ///
    /// Returns the newly closed buckets.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<MetricsBucket>, AggregatorError> {
        let current = self.bucket_start(now);

        let elapsed: Vec<(DateTime<Utc>, OpenBucket)> = {
            let mut state = self.state.lock().map_err(|_| AggregatorError::LockPoisoned)?;

            // Quiet windows still close, so production latency is reported for them.
            if let Some(last) = state.closed_until {
                let earliest = current - self.width * self.retention as i32;
                let mut start = last.max(earliest);
                while start < current {
                    state.open.entry(start).or_default();
                    start += self.width;
                }
            }
            if state.closed_until.map_or(true, |last| last < current) {
                state.closed_until = Some(current);
            }

            let keep = state.open.split_off(&current);
            let elapsed = std::mem::replace(&mut state.open, keep);
            elapsed.into_iter().collect()
        };

        let mut closed = Vec::new();
        for (start, bucket) in elapsed {
            closed.extend(self.close(start, bucket).await?);
        }

        if !closed.is_empty() {
            let mut state = self.state.lock().map_err(|_| AggregatorError::LockPoisoned)?;
            for bucket in &closed {
                let history = state.closed.entry(bucket.dimension.clone()).or_default();
                history.push_back(bucket.clone());
                while history.len() > self.retention {
                    history.pop_front();
                }
                self.collector.record_bucket(&bucket.dimension, bucket.hit_rate);
            }
            debug!(buckets = closed.len(), "Closed metrics buckets");
        }

        Ok(closed)
    }

    async fn close(
        &self,
        start: DateTime<Utc>,
        bucket: OpenBucket,
    ) -> Result<Vec<MetricsBucket>, AggregatorError> {
        let end = start + self.width;
        let finished = self.queue.finished_between(start, end).await?;

        #[derive(Default)]
        struct Production {
            completed: u64,
            failed: u64,
            total_ms: u64,
            timed: u64,
        }
        let mut production: HashMap<String, Production> = HashMap::new();
        for item in &finished {
            for dimension in dimensions_of(&item.identity) {
                let entry = production.entry(dimension).or_default();
                match item.status {
                    QueueStatus::Completed => {
                        entry.completed += 1;
                        if let Some(ms) = item.duration_ms {
                            entry.total_ms += ms;
                            entry.timed += 1;
                        }
                    }
                    QueueStatus::Failed => entry.failed += 1,
                    _ => {}
                }
            }
        }

        let mut dimensions: Vec<String> = bucket
            .dimensions
            .keys()
            .chain(production.keys())
            .cloned()
            .collect();
        dimensions.push(ALL_DIMENSION.to_string());
        dimensions.sort();
        dimensions.dedup();

        let buckets = dimensions
            .into_iter()
            .map(|dimension| {
                let counters = bucket.dimensions.get(&dimension).cloned().unwrap_or_default();
                let produced = production.remove(&dimension).unwrap_or_default();
                let requests = counters.hits + counters.misses;
                MetricsBucket {
                    start,
                    end,
                    requests,
                    hits: counters.hits,
                    misses: counters.misses,
                    hit_rate: if requests == 0 {
                        0.0
                    } else {
                        counters.hits as f64 / requests as f64
                    },
                    avg_production_ms: (produced.timed > 0)
                        .then(|| produced.total_ms as f64 / produced.timed as f64),
                    completed: produced.completed,
                    failed: produced.failed,
                    enqueued: counters.enqueued,
                    evictions: if dimension == ALL_DIMENSION {
                        bucket.evictions
                    } else {
                        0
                    },
                    closed: true,
                    dimension,
                }
            })
            .collect();

        Ok(buckets)
    }

    /// Latest closed bucket for a dimension.
    pub fn latest_closed(&self, dimension: &str) -> Option<MetricsBucket> {
        let state = self.state.lock().ok()?;
        state.closed.get(dimension).and_then(|h| h.back().cloned())
    }

    /// Latest closed bucket of every dimension, ordered by dimension.
    pub fn snapshot(&self) -> Vec<MetricsBucket> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut latest: Vec<MetricsBucket> = state
            .closed
            .values()
            .filter_map(|h| h.back().cloned())
            .collect();
        latest.sort_by(|a, b| a.dimension.cmp(&b.dimension));
        latest
    }

    /// Closed history for a dimension, oldest first.
    pub fn history(&self, dimension: &str) -> Vec<MetricsBucket> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.closed.get(dimension).map(|h| h.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Running view of the bucket containing `now`, not yet closed.
    ///
    /// Production counts are only filled in on close.
    pub fn current(&self, dimension: &str, now: DateTime<Utc>) -> Option<MetricsBucket> {
        let start = self.bucket_start(now);
        let state = self.state.lock().ok()?;
        let bucket = state.open.get(&start)?;
        let counters = bucket.dimensions.get(dimension).cloned().unwrap_or_default();
        let requests = counters.hits + counters.misses;
        Some(MetricsBucket {
            dimension: dimension.to_string(),
            start,
            end: start + self.width,
            requests,
            hits: counters.hits,
            misses: counters.misses,
            hit_rate: if requests == 0 {
                0.0
            } else {
                counters.hits as f64 / requests as f64
            },
            avg_production_ms: None,
            completed: 0,
            failed: 0,
            enqueued: counters.enqueued,
            evictions: if dimension == ALL_DIMENSION {
                bucket.evictions
            } else {
                0
            },
            closed: false,
        })
    }
}

fn dimensions_of(identity: &ContentIdentity) -> Vec<String> {
    let mut dimensions = vec![ALL_DIMENSION.to_string()];
    dimensions.extend(identity.dimensions());
    dimensions
}
