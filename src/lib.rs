//! lesson-forge: pre-generation queue and content cache engine.
//!
//! This library keeps AI-generated learning content ready before learners
//! ask for it: a priority queue of generation work, a TTL cache of produced
//! artifacts, a worker coordinator that leases work and recovers stranded
//! leases, a scheduler that warms content ahead of demand, and a metrics
//! aggregator that rolls request events into time buckets.

// Core modules
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod scheduler;
pub mod storage;

// Re-export the types most callers need
pub use cache::{CacheEntry, CacheFilter, CacheStore, MemoryCache};
pub use config::{ConfigError, EngineConfig, WarmingRule};
pub use coordinator::{WorkerCoordinator, WorkerPool, WorkerPoolConfig};
pub use engine::{ContentStatus, Engine, LookupOutcome, MissPolicy};
pub use error::{
    CacheError, CoordinatorError, EngineError, ProducerError, QueueError, SchedulerError,
};
pub use identity::ContentIdentity;
pub use producer::{ContentProducer, HttpProducer, ProducedContent};
pub use queue::{MemoryQueue, QueueItem, QueueStatus, QueueStore};
