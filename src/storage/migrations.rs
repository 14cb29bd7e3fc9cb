//! Versioned schema migrations.
//!
//! Pending migrations are applied in one transaction that first takes a
//! transaction-scoped advisory lock, so engines starting against the same
//! database apply each version exactly once. Applied versions are recorded in
//! `schema_migrations`; a database carrying a version this build does not
//! know is refused rather than silently used.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{tables, Migration, MIGRATIONS};

/// Advisory lock key serializing schema changes ("lforge" in ASCII).
const MIGRATION_LOCK_KEY: i64 = 0x6c66_6f72_6765;

const CREATE_SCHEMA_MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Errors that can occur while migrating the schema.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {version} ({name}) failed: {source}")]
    Failed {
        version: i32,
        name: &'static str,
        source: sqlx::Error,
    },

    #[error("Database has schema version {0}, which this build does not know")]
    UnknownVersion(i32),
}

/// Whether one known migration has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationState {
    pub version: i32,
    pub name: &'static str,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Applies [`MIGRATIONS`] to a Postgres database.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every pending migration. Returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_SCHEMA_MIGRATIONS).execute(&mut *tx).await?;

        let applied: Vec<i32> = applied_versions(&mut tx).await?.into_keys().collect();
        let pending = pending(MIGRATIONS, &applied)?;

        for migration in &pending {
            sqlx::query(migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::Failed {
                    version: migration.version,
                    name: migration.name,
                    source,
                })?;
            sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
                .bind(migration.version)
                .bind(migration.name)
                .execute(&mut *tx)
                .await?;
            debug!(version = migration.version, name = migration.name, "Applied migration");
        }

        tx.commit().await?;
        if !pending.is_empty() {
            info!(applied = pending.len(), "Applied schema migrations");
        }
        Ok(pending.len())
    }

    /// Lists every known migration with its applied time, if any.
    pub async fn status(&self) -> Result<Vec<MigrationState>, MigrationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(CREATE_SCHEMA_MIGRATIONS).execute(&mut *tx).await?;
        let applied = applied_versions(&mut tx).await?;
        tx.commit().await?;

        Ok(MIGRATIONS
            .iter()
            .map(|m| MigrationState {
                version: m.version,
                name: m.name,
                applied_at: applied.get(&m.version).copied(),
            })
            .collect())
    }

    /// Drops every engine table and the migration history.
    ///
    /// Destroys all data; meant for disposable test databases.
    pub async fn reset_database(&self) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;
        for table in tables::ALL.iter().rev().chain([&tables::SCHEMA_MIGRATIONS]) {
            sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!("Dropped engine schema");
        Ok(())
    }
}

async fn applied_versions(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<BTreeMap<i32, DateTime<Utc>>, MigrationError> {
    let rows: Vec<(i32, DateTime<Utc>)> =
        sqlx::query_as("SELECT version, applied_at FROM schema_migrations")
            .fetch_all(&mut **tx)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Migrations not yet in `applied`, in version order.
fn pending(
    known: &'static [Migration],
    applied: &[i32],
) -> Result<Vec<&'static Migration>, MigrationError> {
    if let Some(unknown) = applied
        .iter()
        .find(|v| !known.iter().any(|m| m.version == **v))
    {
        return Err(MigrationError::UnknownVersion(*unknown));
    }

    let mut pending: Vec<&'static Migration> = known
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by_key(|m| m.version);
    Ok(pending)
}
