//! Database schema constants and SQL queries.
//!
//! This module contains all SQL schema definitions for the PostgreSQL
//! storage backend. Each constant holds exactly one statement so the
//! migration runner can execute and record them individually.

/// SQL schema for creating the generation_queue table.
pub const CREATE_GENERATION_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS generation_queue (
    id UUID PRIMARY KEY,
    identity JSONB NOT NULL,
    identity_key TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status VARCHAR(16) NOT NULL
        CHECK (status IN ('pending', 'leased', 'completed', 'failed', 'cancelled')),
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    not_before TIMESTAMPTZ NOT NULL,
    lease_holder UUID,
    leased_at TIMESTAMPTZ,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    finished_at TIMESTAMPTZ,
    cache_entry_id UUID,
    duration_ms BIGINT
)
"#;

/// At most one open item per identity. Enqueue coalesces against this index.
pub const CREATE_QUEUE_OPEN_IDENTITY_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_generation_queue_open_identity
    ON generation_queue(identity_key)
    WHERE status IN ('pending', 'leased')
"#;

/// Lease scan order.
pub const CREATE_QUEUE_LEASE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_generation_queue_lease
    ON generation_queue(priority, not_before, created_at)
    WHERE status = 'pending'
"#;

pub const CREATE_QUEUE_FINISHED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_generation_queue_finished_at
    ON generation_queue(finished_at)
    WHERE finished_at IS NOT NULL
"#;

/// SQL schema for creating the content_cache table.
pub const CREATE_CONTENT_CACHE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS content_cache (
    id UUID PRIMARY KEY,
    identity_key TEXT NOT NULL UNIQUE,
    identity JSONB NOT NULL,
    tenant TEXT NOT NULL,
    grade TEXT NOT NULL,
    subject TEXT NOT NULL,
    skill TEXT NOT NULL,
    career TEXT NOT NULL DEFAULT '',
    container TEXT NOT NULL,
    variant TEXT NOT NULL DEFAULT '',
    artifact TEXT NOT NULL,
    fingerprint CHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL,
    last_accessed_at TIMESTAMPTZ,
    invalidated_at TIMESTAMPTZ,
    hit_count BIGINT NOT NULL DEFAULT 0,
    is_valid BOOLEAN NOT NULL DEFAULT TRUE,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb
)
"#;

/// Dimension lookups for warming counts and bulk invalidation.
pub const CREATE_CACHE_DIMENSION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_content_cache_dimensions
    ON content_cache(tenant, grade, subject, skill)
"#;

/// Eviction phase one scans valid rows by expiry.
pub const CREATE_CACHE_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_content_cache_expires_at
    ON content_cache(expires_at)
    WHERE is_valid
"#;

/// Eviction phase two scans invalid rows by invalidation time.
pub const CREATE_CACHE_INVALIDATED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_content_cache_invalidated_at
    ON content_cache(invalidated_at)
    WHERE NOT is_valid
"#;

/// SQL schema for creating the workers table.
pub const CREATE_WORKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    id UUID PRIMARY KEY,
    name VARCHAR(255) NOT NULL UNIQUE,
    status VARCHAR(16) NOT NULL
        CHECK (status IN ('idle', 'busy', 'offline', 'error')),
    last_heartbeat TIMESTAMPTZ NOT NULL,
    current_item UUID,
    processed_count BIGINT NOT NULL DEFAULT 0,
    failed_count BIGINT NOT NULL DEFAULT 0,
    registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_WORKERS_HEARTBEAT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_workers_last_heartbeat
    ON workers(last_heartbeat)
    WHERE status IN ('idle', 'busy')
"#;

/// One versioned schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Applied in ascending order; never reused.
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

const fn migration(version: i32, name: &'static str, sql: &'static str) -> Migration {
    Migration { version, name, sql }
}

/// Every migration, in version order.
pub const MIGRATIONS: &[Migration] = &[
    migration(1, "create_generation_queue", CREATE_GENERATION_QUEUE_TABLE),
    migration(2, "queue_open_identity_index", CREATE_QUEUE_OPEN_IDENTITY_INDEX),
    migration(3, "queue_lease_index", CREATE_QUEUE_LEASE_INDEX),
    migration(4, "queue_finished_index", CREATE_QUEUE_FINISHED_INDEX),
    migration(5, "create_content_cache", CREATE_CONTENT_CACHE_TABLE),
    migration(6, "cache_dimension_index", CREATE_CACHE_DIMENSION_INDEX),
    migration(7, "cache_expiry_index", CREATE_CACHE_EXPIRY_INDEX),
    migration(8, "cache_invalidated_index", CREATE_CACHE_INVALIDATED_INDEX),
    migration(9, "create_workers", CREATE_WORKERS_TABLE),
    migration(10, "workers_heartbeat_index", CREATE_WORKERS_HEARTBEAT_INDEX),
];

/// Table names in the schema.
pub mod tables {
    /// Generation queue table name.
    pub const GENERATION_QUEUE: &str = "generation_queue";
    /// Content cache table name.
    pub const CONTENT_CACHE: &str = "content_cache";
    /// Worker registry table name.
    pub const WORKERS: &str = "workers";
    /// Applied migration versions.
    pub const SCHEMA_MIGRATIONS: &str = "schema_migrations";

    /// Engine tables in creation order.
    pub const ALL: [&str; 3] = [GENERATION_QUEUE, CONTENT_CACHE, WORKERS];
}
