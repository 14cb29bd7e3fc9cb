//! Error types for lesson-forge operations.
//!
//! Defines the error types shared across subsystems:
//! - Generation queue operations
//! - Content cache operations
//! - Worker coordination
//! - Content producer failures
//! - Warming and navigation scheduling
//! - The request-time engine façade

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during generation queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue item {0} not found")]
    ItemNotFound(Uuid),

    #[error("Invalid transition for queue item {id} from '{from}': {reason}")]
    InvalidTransition {
        id: Uuid,
        from: String,
        reason: String,
    },

    #[error("Queue item {id} is not leased by {holder}")]
    LeaseNotHeld { id: Uuid, holder: Uuid },

    #[error("Queue lock poisoned")]
    LockPoisoned,

    #[error("Corrupt queue row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during content cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    #[error("Corrupt cache row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during worker coordination.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Worker {0} not found")]
    WorkerNotFound(Uuid),

    #[error("Worker {id} cannot take work while '{status}'")]
    WorkerUnavailable { id: Uuid, status: String },

    #[error("Worker {worker} already holds queue item {item}")]
    WorkerBusy { worker: Uuid, item: Uuid },

    #[error("Worker {worker} does not hold the lease on queue item {item}")]
    LeaseNotHeld { worker: Uuid, item: Uuid },

    #[error("Worker registry lock poisoned")]
    LockPoisoned,

    #[error("Corrupt worker row: {0}")]
    CorruptRow(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors reported by a content producer.
///
/// The engine only needs to know whether another attempt could succeed.
#[derive(Debug, Error)]
pub enum ProducerError {
    /// Network failures, timeouts, provider throttling. Retried with backoff.
    #[error("Transient producer failure: {0}")]
    Transient(String),

    /// Malformed request, content policy rejection. Never retried.
    #[error("Fatal producer failure: {0}")]
    Fatal(String),

    /// The producer did not answer within the configured timeout.
    #[error("Producer timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

impl ProducerError {
    /// Returns whether a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProducerError::Fatal(_))
    }
}

/// Errors raised while warming or predicting content.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Navigation tracker lock poisoned")]
    LockPoisoned,
}

/// Errors surfaced by the request-time engine façade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Producer error: {0}")]
    Producer(#[from] ProducerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::storage::DatabaseError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] crate::coordinator::PoolError),

    #[error("Synchronous production requested but no producer is configured")]
    NoProducer,
}
