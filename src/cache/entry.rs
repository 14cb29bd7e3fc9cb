//! Cache entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::identity::ContentIdentity;

/// Hash of cached content for integrity checks.
///
/// The hash is computed using SHA-256 and stored as a hex-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Create a new content hash from content string.
    pub fn from_content(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps a stored hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Get the hash string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the producer reported alongside an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerMetadata {
    /// Wall-clock production time.
    pub duration_ms: u64,
    /// Model or producer variant that generated the artifact.
    #[serde(default)]
    pub producer_variant: Option<String>,
}

impl ProducerMetadata {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            producer_variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.producer_variant = Some(variant.into());
        self
    }
}

/// A cached artifact for one content identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: Uuid,
    pub identity: ContentIdentity,
    pub identity_key: String,
    /// Opaque payload (usually JSON text) returned by the producer.
    pub artifact: String,
    /// SHA-256 of `artifact`.
    pub fingerprint: ContentHash,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// When the validity flag was cleared. Drives the eviction grace period.
    pub invalidated_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
    pub is_valid: bool,
    pub metadata: ProducerMetadata,
}

impl CacheEntry {
    /// Creates a fresh, valid entry.
    pub fn new(
        identity: ContentIdentity,
        artifact: String,
        metadata: ProducerMetadata,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let identity_key = identity.key();
        let fingerprint = ContentHash::from_content(&artifact);
        Self {
            id: Uuid::new_v4(),
            identity,
            identity_key,
            artifact,
            fingerprint,
            created_at: now,
            updated_at: now,
            expires_at,
            last_accessed_at: None,
            invalidated_at: None,
            hit_count: 0,
            is_valid: true,
            metadata,
        }
    }

    /// Returns whether a lookup at `now` may serve this entry.
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        self.is_valid && now < self.expires_at
    }

    /// Replaces the payload of an existing entry, keeping its hit count.
    pub fn replace(
        &mut self,
        artifact: String,
        metadata: ProducerMetadata,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.fingerprint = ContentHash::from_content(&artifact);
        self.artifact = artifact;
        self.metadata = metadata;
        self.expires_at = expires_at;
        self.updated_at = now;
        self.is_valid = true;
        self.invalidated_at = None;
    }

    /// Records a served lookup.
    pub fn record_hit(&mut self, now: DateTime<Utc>) {
        self.hit_count += 1;
        self.last_accessed_at = Some(now);
    }

    /// Clears the validity flag. Returns `false` if it was already clear.
    pub fn invalidate(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_valid {
            return false;
        }
        self.is_valid = false;
        self.invalidated_at = Some(at);
        self.updated_at = at;
        true
    }

    /// Recomputes the payload hash and compares it with the stored one.
    pub fn verify(&self) -> bool {
        ContentHash::from_content(&self.artifact) == self.fingerprint
    }

    fn miss_reason(&self) -> MissReason {
        if self.is_valid {
            MissReason::Expired
        } else {
            MissReason::Invalidated
        }
    }
}

/// Why a lookup did not produce a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MissReason {
    /// No entry for the identity.
    Absent,
    /// Entry exists but its expiry has passed.
    Expired,
    /// Entry exists but was invalidated.
    Invalidated,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss(MissReason),
}

impl CacheLookup {
    /// Classifies a stored entry (or its absence) at `now`.
    pub fn classify(entry: Option<&CacheEntry>, now: DateTime<Utc>) -> Self {
        match entry {
            Some(entry) if entry.is_servable(now) => CacheLookup::Hit(entry.clone()),
            Some(entry) => CacheLookup::Miss(entry.miss_reason()),
            None => CacheLookup::Miss(MissReason::Absent),
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    /// Returns the entry of a hit.
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            CacheLookup::Hit(entry) => Some(entry),
            CacheLookup::Miss(_) => None,
        }
    }
}

/// Conjunctive predicate over identity fields. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFilter {
    pub tenant: Option<String>,
    pub grade: Option<String>,
    pub subject: Option<String>,
    pub skill: Option<String>,
    pub career: Option<String>,
    pub container: Option<String>,
}

impl CacheFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_grade(mut self, grade: impl Into<String>) -> Self {
        self.grade = Some(grade.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }

    pub fn with_career(mut self, career: impl Into<String>) -> Self {
        self.career = Some(career.into());
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Filter matching every variant of `identity`.
    pub fn variants_of(identity: &ContentIdentity) -> Self {
        let mut filter = Self::new()
            .with_tenant(identity.tenant.trim())
            .with_grade(identity.grade.trim())
            .with_subject(identity.subject.trim())
            .with_skill(identity.skill.trim())
            .with_container(identity.container.trim());
        filter.career = identity.career.as_deref().map(|c| c.trim().to_string());
        filter
    }

    /// Returns whether `identity` satisfies every set field.
    pub fn matches(&self, identity: &ContentIdentity) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w.trim() == have.trim())
        }

        field(&self.tenant, &identity.tenant)
            && field(&self.grade, &identity.grade)
            && field(&self.subject, &identity.subject)
            && field(&self.skill, &identity.skill)
            && field(&self.career, identity.career.as_deref().unwrap_or(""))
            && field(&self.container, &identity.container)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Rows currently stored, valid or not.
    pub entries: u64,
    /// Rows that would satisfy a lookup now.
    pub valid_entries: u64,
    /// Lookups served since start.
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    /// Rows physically deleted by eviction since start.
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a value between 0.0 and 1.0, or 0.0 if no lookups.
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(
            ContentIdentity::new("5", "Math", "S1"),
            "{\"title\":\"Fractions\"}".to_string(),
            ProducerMetadata::new(1200).with_variant("gpt-4o"),
            now + Duration::hours(1),
            now,
        )
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = ContentHash::from_content("hello");
        let b = ContentHash::from_content("hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, ContentHash::from_content("world"));
    }

    #[test]
    fn test_servable_window() {
        let now = Utc::now();
        let entry = entry(now);
        assert!(entry.is_servable(now));
        assert!(entry.is_servable(now + Duration::minutes(59)));
        assert!(!entry.is_servable(now + Duration::hours(1)));
    }

    #[test]
    fn test_classify_miss_reasons() {
        let now = Utc::now();
        let mut e = entry(now);

        assert_eq!(
            CacheLookup::classify(None, now),
            CacheLookup::Miss(MissReason::Absent)
        );
        assert_eq!(
            CacheLookup::classify(Some(&e), now + Duration::hours(2)),
            CacheLookup::Miss(MissReason::Expired)
        );

        e.invalidate(now);
        assert_eq!(
            CacheLookup::classify(Some(&e), now),
            CacheLookup::Miss(MissReason::Invalidated)
        );
    }

    #[test]
    fn test_replace_keeps_hits_and_restores_validity() {
        let now = Utc::now();
        let mut e = entry(now);
        e.record_hit(now);
        e.invalidate(now);

        e.replace(
            "new".to_string(),
            ProducerMetadata::new(5),
            now + Duration::hours(2),
            now,
        );

        assert!(e.is_valid);
        assert!(e.invalidated_at.is_none());
        assert_eq!(e.hit_count, 1);
        assert!(e.verify());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let now = Utc::now();
        let mut e = entry(now);
        assert!(e.verify());
        e.artifact.push('x');
        assert!(!e.verify());
    }

    #[test]
    fn test_filter_matches() {
        let identity = ContentIdentity::new("5", "Math", "S1")
            .with_container("quiz")
            .with_variant("v2");

        assert!(CacheFilter::new().matches(&identity));
        assert!(CacheFilter::new().with_grade("5").with_subject("Math").matches(&identity));
        assert!(!CacheFilter::new().with_subject("Science").matches(&identity));
        assert!(CacheFilter::variants_of(&identity).matches(&identity.clone().with_variant("v9")));
        assert!(!CacheFilter::new().with_career("nursing").matches(&identity));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            lookups: 4,
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
