//! Postgres-backed content cache.
//!
//! Hits are a single `UPDATE ... RETURNING` so the hit counter increments
//! row-locally without a read-modify-write round trip. Puts upsert on the
//! unique identity key; concurrent puts resolve last-writer-wins.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::cache::{
    expiry_for, grace_to_chrono, CacheEntry, CacheFilter, CacheLookup, CacheStats, CacheStore,
    ContentHash, LookupCounters, MissReason, ProducerMetadata,
};
use crate::error::CacheError;
use crate::identity::ContentIdentity;

const ENTRY_COLUMNS: &str = "id, identity_key, identity, artifact, fingerprint, created_at, \
    updated_at, expires_at, last_accessed_at, invalidated_at, hit_count, is_valid, metadata";

/// Filter predicate shared by bulk invalidation and counting. Binds `$2..$7`.
const FILTER_CLAUSE: &str = "($2::text IS NULL OR tenant = $2) \
    AND ($3::text IS NULL OR grade = $3) \
    AND ($4::text IS NULL OR subject = $4) \
    AND ($5::text IS NULL OR skill = $5) \
    AND ($6::text IS NULL OR career = $6) \
    AND ($7::text IS NULL OR container = $7)";

/// Content cache stored in the `content_cache` table.
pub struct PgCache {
    pool: PgPool,
    counters: LookupCounters,
}

impl PgCache {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            counters: LookupCounters::default(),
        }
    }

    /// Serves and counts a hit if the entry is servable at `now`.
    async fn hit(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE content_cache SET
                hit_count = hit_count + 1,
                last_accessed_at = $2
            WHERE identity_key = $1 AND is_valid AND expires_at > $2
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }
}

fn entry_from_row(row: &PgRow) -> Result<CacheEntry, CacheError> {
    let identity: ContentIdentity = serde_json::from_value(row.try_get("identity")?)?;
    let metadata: ProducerMetadata = serde_json::from_value(row.try_get("metadata")?)?;
    let fingerprint: String = row.try_get("fingerprint")?;
    let hit_count: i64 = row.try_get("hit_count")?;

    Ok(CacheEntry {
        id: row.try_get("id")?,
        identity,
        identity_key: row.try_get("identity_key")?,
        artifact: row.try_get("artifact")?,
        fingerprint: ContentHash::from_hex(fingerprint.trim()),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
        last_accessed_at: row.try_get("last_accessed_at")?,
        invalidated_at: row.try_get("invalidated_at")?,
        hit_count: u64::try_from(hit_count)
            .map_err(|_| CacheError::CorruptRow(format!("hit_count {}", hit_count)))?,
        is_valid: row.try_get("is_valid")?,
        metadata,
    })
}

#[async_trait]
impl CacheStore for PgCache {
    async fn lookup(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup, CacheError> {
        let key = identity.key();

        let result = match self.hit(&key, now).await? {
            Some(entry) => CacheLookup::Hit(entry),
            None => match self.peek(&key).await? {
                // Revalidated by a concurrent put between the two statements.
                Some(entry) if entry.is_servable(now) => match self.hit(&key, now).await? {
                    Some(entry) => CacheLookup::Hit(entry),
                    None => CacheLookup::Miss(MissReason::Invalidated),
                },
                stored => CacheLookup::classify(stored.as_ref(), now),
            },
        };

        self.counters.record(&result);
        Ok(result)
    }

    async fn peek(&self, identity_key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM content_cache WHERE identity_key = $1",
            ENTRY_COLUMNS
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn put(
        &self,
        identity: &ContentIdentity,
        artifact: String,
        metadata: ProducerMetadata,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError> {
        let expires_at = expiry_for(ttl, now)?;
        let fresh = CacheEntry::new(identity.clone(), artifact, metadata, expires_at, now);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO content_cache (
                id, identity_key, identity, tenant, grade, subject, skill, career,
                container, variant, artifact, fingerprint, created_at, updated_at,
                expires_at, hit_count, is_valid, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13, $14, 0, TRUE, $15)
            ON CONFLICT (identity_key) DO UPDATE SET
                artifact = EXCLUDED.artifact,
                fingerprint = EXCLUDED.fingerprint,
                metadata = EXCLUDED.metadata,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at,
                is_valid = TRUE,
                invalidated_at = NULL
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(fresh.id)
        .bind(&fresh.identity_key)
        .bind(serde_json::to_value(&fresh.identity)?)
        .bind(identity.tenant.trim())
        .bind(identity.grade.trim())
        .bind(identity.subject.trim())
        .bind(identity.skill.trim())
        .bind(identity.career.as_deref().unwrap_or("").trim())
        .bind(identity.container.trim())
        .bind(identity.variant.as_deref().unwrap_or("").trim())
        .bind(&fresh.artifact)
        .bind(fresh.fingerprint.as_str())
        .bind(now)
        .bind(expires_at)
        .bind(serde_json::to_value(&fresh.metadata)?)
        .fetch_one(&self.pool)
        .await?;

        entry_from_row(&row)
    }

    async fn invalidate(
        &self,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let result = sqlx::query(
            r#"
            UPDATE content_cache SET
                is_valid = FALSE,
                invalidated_at = $2,
                updated_at = $2
            WHERE identity_key = $1 AND is_valid
            "#,
        )
        .bind(identity.key())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn invalidate_where(
        &self,
        filter: &CacheFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, CacheError> {
        let result = sqlx::query(&format!(
            "UPDATE content_cache SET is_valid = FALSE, invalidated_at = $1, updated_at = $1 \
             WHERE is_valid AND {}",
            FILTER_CLAUSE
        ))
        .bind(now)
        .bind(filter.tenant.as_deref().map(str::trim))
        .bind(filter.grade.as_deref().map(str::trim))
        .bind(filter.subject.as_deref().map(str::trim))
        .bind(filter.skill.as_deref().map(str::trim))
        .bind(filter.career.as_deref().map(str::trim))
        .bind(filter.container.as_deref().map(str::trim))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn evict_expired(&self, grace: Duration, now: DateTime<Utc>) -> Result<u64, CacheError> {
        let cutoff = now
            .checked_sub_signed(grace_to_chrono(grace)?)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut tx = self.pool.begin().await?;

        // Phase 1: expired entries lose validity as of their expiry.
        let marked = sqlx::query(
            r#"
            UPDATE content_cache SET
                is_valid = FALSE,
                invalidated_at = expires_at,
                updated_at = expires_at
            WHERE is_valid AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Phase 2: rows invalid for longer than the grace period are deleted.
        let removed = sqlx::query(
            "DELETE FROM content_cache WHERE NOT is_valid AND invalidated_at < $1",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        self.counters.record_evictions(removed);
        debug!(marked, removed, "Cache eviction sweep finished");
        Ok(removed)
    }

    async fn count_valid(
        &self,
        filter: &CacheFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, CacheError> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM content_cache WHERE is_valid AND expires_at > $1 AND {}",
            FILTER_CLAUSE
        ))
        .bind(now)
        .bind(filter.tenant.as_deref().map(str::trim))
        .bind(filter.grade.as_deref().map(str::trim))
        .bind(filter.subject.as_deref().map(str::trim))
        .bind(filter.skill.as_deref().map(str::trim))
        .bind(filter.career.as_deref().map(str::trim))
        .bind(filter.container.as_deref().map(str::trim))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats, CacheError> {
        let (entries, valid): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE is_valid AND expires_at > $1)
            FROM content_cache
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let mut stats = CacheStats {
            entries: entries.max(0) as u64,
            valid_entries: valid.max(0) as u64,
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        Ok(stats)
    }
}
