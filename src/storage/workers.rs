//! Postgres-backed worker registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::coordinator::{WorkerRecord, WorkerStatus, WorkerStore};
use crate::error::CoordinatorError;

const WORKER_COLUMNS: &str =
    "id, name, status, last_heartbeat, current_item, processed_count, failed_count, registered_at";

/// Worker registry stored in the `workers` table.
pub struct PgWorkerStore {
    pool: PgPool,
}

impl PgWorkerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Loads a worker under a row lock, applies `f`, and writes it back.
    async fn update<F>(&self, id: Uuid, f: F) -> Result<WorkerRecord, CoordinatorError>
    where
        F: FnOnce(&mut WorkerRecord) -> Result<(), CoordinatorError> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM workers WHERE id = $1 FOR UPDATE",
            WORKER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoordinatorError::WorkerNotFound(id))?;

        let mut worker = worker_from_row(&row)?;
        f(&mut worker)?;

        sqlx::query(
            r#"
            UPDATE workers SET
                status = $2,
                last_heartbeat = $3,
                current_item = $4,
                processed_count = $5,
                failed_count = $6
            WHERE id = $1
            "#,
        )
        .bind(worker.id)
        .bind(worker.status.as_str())
        .bind(worker.last_heartbeat)
        .bind(worker.current_item)
        .bind(worker.processed_count as i64)
        .bind(worker.failed_count as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(worker)
    }
}

fn worker_from_row(row: &PgRow) -> Result<WorkerRecord, CoordinatorError> {
    let status: String = row.try_get("status")?;
    let processed: i64 = row.try_get("processed_count")?;
    let failed: i64 = row.try_get("failed_count")?;

    Ok(WorkerRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: status.parse::<WorkerStatus>()?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        current_item: row.try_get("current_item")?,
        processed_count: processed.max(0) as u64,
        failed_count: failed.max(0) as u64,
        registered_at: row.try_get("registered_at")?,
    })
}

#[async_trait]
impl WorkerStore for PgWorkerStore {
    async fn register(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError> {
        let fresh = WorkerRecord::new(name, now);
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workers (id, name, status, last_heartbeat, registered_at)
            VALUES ($1, $2, 'idle', $3, $3)
            ON CONFLICT (name) DO UPDATE SET
                status = 'idle',
                current_item = NULL,
                last_heartbeat = EXCLUDED.last_heartbeat
            RETURNING {}
            "#,
            WORKER_COLUMNS
        ))
        .bind(fresh.id)
        .bind(name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        worker_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkerRecord>, CoordinatorError> {
        let row = sqlx::query(&format!("SELECT {} FROM workers WHERE id = $1", WORKER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<WorkerRecord>, CoordinatorError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workers WHERE name = $1",
            WORKER_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, CoordinatorError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workers ORDER BY name",
            WORKER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError> {
        let row = sqlx::query(&format!(
            "UPDATE workers SET last_heartbeat = $2 WHERE id = $1 RETURNING {}",
            WORKER_COLUMNS
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CoordinatorError::WorkerNotFound(id))?;
        worker_from_row(&row)
    }

    async fn mark_busy(
        &self,
        id: Uuid,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError> {
        self.update(id, |worker| worker.assign(item_id, now)).await
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoordinatorError> {
        self.update(id, |worker| {
            worker.record_outcome(success, now);
            Ok(())
        })
        .await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: WorkerStatus,
    ) -> Result<WorkerRecord, CoordinatorError> {
        self.update(id, |worker| {
            worker.set_status(status);
            Ok(())
        })
        .await
    }

    async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, CoordinatorError> {
        // RETURNING reads from the CTE so callers see the items the workers held.
        let rows = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id, name, status, last_heartbeat, current_item,
                       processed_count, failed_count, registered_at
                FROM workers
                WHERE status IN ('idle', 'busy') AND last_heartbeat < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workers w SET
                status = 'offline',
                current_item = NULL
            FROM stale
            WHERE w.id = stale.id
            RETURNING stale.id, stale.name, stale.status, stale.last_heartbeat,
                      stale.current_item, stale.processed_count, stale.failed_count,
                      stale.registered_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(worker_from_row).collect()
    }
}
