//! Postgres-backed generation queue.
//!
//! Coalescing relies on the partial unique index over open identities:
//! `INSERT ... ON CONFLICT` either creates the item or lands on the open one.
//! Leasing claims the best row with `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers never wait on each other's candidates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::identity::ContentIdentity;
use crate::queue::{Enqueued, ItemOutcome, QueueItem, QueueStats, QueueStatus, QueueStore, RetryBackoff};

const ITEM_COLUMNS: &str = "id, identity, identity_key, priority, status, retry_count, \
    max_retries, not_before, lease_holder, leased_at, last_error, created_at, updated_at, \
    finished_at, cache_entry_id, duration_ms";

/// Generation queue stored in the `generation_queue` table.
pub struct PgQueue {
    pool: PgPool,
    backoff: RetryBackoff,
}

impl PgQueue {
    pub fn new(pool: PgPool, backoff: RetryBackoff) -> Self {
        Self { pool, backoff }
    }

    async fn lock_item(
        tx: &mut Transaction<'_, Postgres>,
        item_id: Uuid,
    ) -> Result<QueueItem, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM generation_queue WHERE id = $1 FOR UPDATE",
            ITEM_COLUMNS
        ))
        .bind(item_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(QueueError::ItemNotFound(item_id))?;
        item_from_row(&row)
    }

    async fn write_item(
        tx: &mut Transaction<'_, Postgres>,
        item: &QueueItem,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE generation_queue SET
                priority = $2,
                status = $3,
                retry_count = $4,
                not_before = $5,
                lease_holder = $6,
                leased_at = $7,
                last_error = $8,
                updated_at = $9,
                finished_at = $10,
                cache_entry_id = $11,
                duration_ms = $12
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(item.priority)
        .bind(item.status.as_str())
        .bind(item.retry_count as i32)
        .bind(item.not_before)
        .bind(item.lease_holder)
        .bind(item.leased_at)
        .bind(&item.last_error)
        .bind(item.updated_at)
        .bind(item.finished_at)
        .bind(item.cache_entry_id)
        .bind(item.duration_ms.map(|ms| ms as i64))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn item_from_row(row: &PgRow) -> Result<QueueItem, QueueError> {
    let identity: ContentIdentity = serde_json::from_value(row.try_get("identity")?)?;
    let status: String = row.try_get("status")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    let duration_ms: Option<i64> = row.try_get("duration_ms")?;

    Ok(QueueItem {
        id: row.try_get("id")?,
        identity,
        identity_key: row.try_get("identity_key")?,
        priority: row.try_get("priority")?,
        status: status.parse::<QueueStatus>()?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| QueueError::CorruptRow(format!("retry_count {}", retry_count)))?,
        max_retries: u32::try_from(max_retries)
            .map_err(|_| QueueError::CorruptRow(format!("max_retries {}", max_retries)))?,
        not_before: row.try_get("not_before")?,
        lease_holder: row.try_get("lease_holder")?,
        leased_at: row.try_get("leased_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
        cache_entry_id: row.try_get("cache_entry_id")?,
        duration_ms: duration_ms.map(|ms| ms.max(0) as u64),
    })
}

#[async_trait]
impl QueueStore for PgQueue {
    async fn enqueue(
        &self,
        identity: &ContentIdentity,
        priority: i32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, QueueError> {
        let candidate = QueueItem::new(identity.clone(), priority, max_retries, now);

        let row = sqlx::query(
            r#"
            INSERT INTO generation_queue (
                id, identity, identity_key, priority, status, retry_count,
                max_retries, not_before, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $6, $6)
            ON CONFLICT (identity_key) WHERE status IN ('pending', 'leased')
            DO UPDATE SET
                priority = CASE
                    WHEN generation_queue.status = 'pending'
                        THEN GREATEST(generation_queue.priority, EXCLUDED.priority)
                    ELSE generation_queue.priority
                END,
                updated_at = CASE
                    WHEN generation_queue.status = 'pending'
                        AND EXCLUDED.priority > generation_queue.priority
                        THEN EXCLUDED.updated_at
                    ELSE generation_queue.updated_at
                END
            RETURNING id
            "#,
        )
        .bind(candidate.id)
        .bind(serde_json::to_value(&candidate.identity)?)
        .bind(&candidate.identity_key)
        .bind(priority)
        .bind(max_retries as i32)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let item_id: Uuid = row.try_get("id")?;
        let coalesced = item_id != candidate.id;
        if coalesced {
            debug!(item_id = %item_id, identity = %candidate.identity_key, "Coalesced enqueue");
        }
        Ok(Enqueued { item_id, coalesced })
    }

    async fn lease(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE generation_queue SET
                status = 'leased',
                lease_holder = $1,
                leased_at = $2,
                updated_at = $2
            WHERE id = (
                SELECT id FROM generation_queue
                WHERE status = 'pending' AND not_before <= $2
                ORDER BY priority ASC, not_before ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            ITEM_COLUMNS
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn complete(
        &self,
        item_id: Uuid,
        holder: Uuid,
        outcome: &ItemOutcome,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let mut tx = self.pool.begin().await?;
        let mut item = Self::lock_item(&mut tx, item_id).await?;
        item.apply_outcome(holder, outcome, &self.backoff, now)?;
        Self::write_item(&mut tx, &item).await?;
        tx.commit().await?;
        Ok(item)
    }

    async fn cancel(&self, item_id: Uuid, now: DateTime<Utc>) -> Result<QueueItem, QueueError> {
        let mut tx = self.pool.begin().await?;
        let mut item = Self::lock_item(&mut tx, item_id).await?;
        item.cancel(now)?;
        Self::write_item(&mut tx, &item).await?;
        tx.commit().await?;
        Ok(item)
    }

    async fn requeue(
        &self,
        item_id: Uuid,
        holder: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_queue SET
                status = 'pending',
                lease_holder = NULL,
                leased_at = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'leased' AND lease_holder = $2
            "#,
        )
        .bind(item_id)
        .bind(holder)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM generation_queue WHERE id = $1")
                    .bind(item_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(QueueError::ItemNotFound(item_id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM generation_queue WHERE id = $1",
            ITEM_COLUMNS
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn find_open(&self, identity_key: &str) -> Result<Option<QueueItem>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM generation_queue \
             WHERE identity_key = $1 AND status IN ('pending', 'leased')",
            ITEM_COLUMNS
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn latest_for(&self, identity_key: &str) -> Result<Option<QueueItem>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM generation_queue WHERE identity_key = $1 \
             ORDER BY created_at DESC LIMIT 1",
            ITEM_COLUMNS
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM generation_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status.parse::<QueueStatus>()?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn finished_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM generation_queue \
             WHERE status IN ('completed', 'failed') \
               AND finished_at >= $1 AND finished_at < $2",
            ITEM_COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM generation_queue \
             WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
