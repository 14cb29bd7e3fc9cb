//! Engine configuration.
//!
//! This module provides the configuration options recognized by the engine:
//! cache TTLs (default and per content category), retry and backoff limits,
//! worker staleness and heartbeat timing, eviction grace, scheduler priorities
//! and warming rules, metrics bucket width, and connection settings.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `LESSON_FORGE_*` environment variables.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{ContentIdentity, DEFAULT_TENANT};

/// Upper bound accepted for TTLs, backoff and the eviction grace period (100 years).
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A standing policy that keeps a minimum number of cached variants for a
/// content dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmingRule {
    /// Tenant the rule applies to.
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Learner grade.
    pub grade: String,
    /// Subject.
    pub subject: String,
    /// Container type to warm (e.g. "lesson", "quiz").
    pub container: String,
    /// Skills to warm. Empty means a single subject-wide identity (skill "").
    #[serde(default)]
    pub skills: Vec<String>,
    /// Optional career context applied to every warmed identity.
    #[serde(default)]
    pub career: Option<String>,
    /// Minimum number of cached variants to keep per skill.
    pub desired_variants: u32,
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

impl WarmingRule {
    /// Creates a subject-wide rule in the default tenant.
    pub fn new(
        grade: impl Into<String>,
        subject: impl Into<String>,
        container: impl Into<String>,
        desired_variants: u32,
    ) -> Self {
        Self {
            tenant: default_tenant(),
            grade: grade.into(),
            subject: subject.into(),
            container: container.into(),
            skills: Vec::new(),
            career: None,
            desired_variants,
        }
    }

    /// Sets the skills the rule covers.
    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the career context.
    pub fn with_career(mut self, career: impl Into<String>) -> Self {
        self.career = Some(career.into());
        self
    }

    /// Returns the base identity (no variant) for each skill covered.
    pub fn identities(&self) -> Vec<ContentIdentity> {
        let skills: Vec<&str> = if self.skills.is_empty() {
            vec![""]
        } else {
            self.skills.iter().map(String::as_str).collect()
        };

        skills
            .into_iter()
            .map(|skill| {
                let mut identity = ContentIdentity::new(&self.grade, &self.subject, skill)
                    .with_tenant(&self.tenant)
                    .with_container(&self.container);
                identity.career = self.career.clone();
                identity
            })
            .collect()
    }
}

/// Configuration for the pre-generation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Cache settings
    /// TTL for content categories without an explicit entry.
    pub default_ttl: Duration,
    /// TTL overrides keyed by content category (container type).
    pub category_ttls: HashMap<String, Duration>,
    /// How long an invalidated entry is kept before physical deletion.
    pub eviction_grace: Duration,
    /// How often the eviction sweep runs.
    pub eviction_interval: Duration,

    // Queue settings
    /// Retries granted to an item when the caller does not specify.
    pub default_max_retries: u32,
    /// Backoff after the first failure; doubles per retry.
    pub backoff_base: Duration,
    /// Upper bound on the retry backoff.
    pub backoff_max: Duration,
    /// Priority used for request-time enqueues on cache miss.
    pub user_priority: i32,
    /// Priority used by the scheduler. Numerically higher = served later.
    pub warming_priority: i32,

    // Worker settings
    /// Number of workers in the local pool.
    pub num_workers: usize,
    /// A worker whose heartbeat is older than this is considered dead.
    pub lease_staleness: Duration,
    /// How often workers heartbeat.
    pub heartbeat_interval: Duration,
    /// How often the coordinator reconciles stale workers.
    pub reconcile_interval: Duration,
    /// Idle wait between lease attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Maximum time allowed for one producer call.
    pub producer_timeout: Duration,
    /// Timeout for graceful pool shutdown.
    pub shutdown_timeout: Duration,

    // Scheduler settings
    /// How often warming rules are evaluated.
    pub warming_interval: Duration,
    /// Maximum gap between two visits for them to count as a transition.
    pub navigation_window: Duration,
    /// Transition count at which the successor is pre-generated.
    pub navigation_threshold: u64,
    /// Warming rule table.
    pub warming_rules: Vec<WarmingRule>,

    // Metrics settings
    /// Width of a metrics bucket.
    pub metrics_bucket: Duration,
    /// Closed buckets retained per dimension.
    pub metrics_retention: usize,

    // Connection settings
    /// PostgreSQL connection URL.
    pub database_url: Option<String>,
    /// HTTP endpoint of the content producer.
    pub producer_endpoint: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30 * 24 * 3600), // 30 days
            category_ttls: HashMap::new(),
            eviction_grace: Duration::from_secs(24 * 3600),
            eviction_interval: Duration::from_secs(3600),

            default_max_retries: 3,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(3600),
            user_priority: 10,
            warming_priority: 100,

            num_workers: 4,
            lease_staleness: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            producer_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(60),

            warming_interval: Duration::from_secs(900),
            navigation_window: Duration::from_secs(600),
            navigation_threshold: 3,
            warming_rules: Vec::new(),

            metrics_bucket: Duration::from_secs(3600),
            metrics_retention: 168,

            database_url: None,
            producer_endpoint: None,
        }
    }
}

/// On-disk shape of the configuration file. Durations are in seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    default_ttl_secs: Option<u64>,
    #[serde(default)]
    category_ttl_secs: HashMap<String, u64>,
    eviction_grace_secs: Option<u64>,
    eviction_interval_secs: Option<u64>,
    default_max_retries: Option<u32>,
    backoff_base_secs: Option<u64>,
    backoff_max_secs: Option<u64>,
    user_priority: Option<i32>,
    warming_priority: Option<i32>,
    num_workers: Option<usize>,
    lease_staleness_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    reconcile_interval_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    producer_timeout_secs: Option<u64>,
    shutdown_timeout_secs: Option<u64>,
    warming_interval_secs: Option<u64>,
    navigation_window_secs: Option<u64>,
    navigation_threshold: Option<u64>,
    #[serde(default)]
    warming_rules: Vec<WarmingRule>,
    metrics_bucket_secs: Option<u64>,
    metrics_retention: Option<usize>,
    database_url: Option<String>,
    producer_endpoint: Option<String>,
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from defaults, an optional YAML file, and the
    /// environment, in that order, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML configuration file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, does not parse, or
    /// produces an invalid configuration.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parses YAML configuration text on top of the defaults.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_yaml::from_str(raw)?;
        let mut config = Self::default();

        let secs = Duration::from_secs;
        if let Some(v) = file.default_ttl_secs {
            config.default_ttl = secs(v);
        }
        for (category, ttl) in file.category_ttl_secs {
            config.category_ttls.insert(category, secs(ttl));
        }
        if let Some(v) = file.eviction_grace_secs {
            config.eviction_grace = secs(v);
        }
        if let Some(v) = file.eviction_interval_secs {
            config.eviction_interval = secs(v);
        }
        if let Some(v) = file.default_max_retries {
            config.default_max_retries = v;
        }
        if let Some(v) = file.backoff_base_secs {
            config.backoff_base = secs(v);
        }
        if let Some(v) = file.backoff_max_secs {
            config.backoff_max = secs(v);
        }
        if let Some(v) = file.user_priority {
            config.user_priority = v;
        }
        if let Some(v) = file.warming_priority {
            config.warming_priority = v;
        }
        if let Some(v) = file.num_workers {
            config.num_workers = v;
        }
        if let Some(v) = file.lease_staleness_secs {
            config.lease_staleness = secs(v);
        }
        if let Some(v) = file.heartbeat_interval_secs {
            config.heartbeat_interval = secs(v);
        }
        if let Some(v) = file.reconcile_interval_secs {
            config.reconcile_interval = secs(v);
        }
        if let Some(v) = file.poll_interval_ms {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.producer_timeout_secs {
            config.producer_timeout = secs(v);
        }
        if let Some(v) = file.shutdown_timeout_secs {
            config.shutdown_timeout = secs(v);
        }
        if let Some(v) = file.warming_interval_secs {
            config.warming_interval = secs(v);
        }
        if let Some(v) = file.navigation_window_secs {
            config.navigation_window = secs(v);
        }
        if let Some(v) = file.navigation_threshold {
            config.navigation_threshold = v;
        }
        config.warming_rules = file.warming_rules;
        if let Some(v) = file.metrics_bucket_secs {
            config.metrics_bucket = secs(v);
        }
        if let Some(v) = file.metrics_retention {
            config.metrics_retention = v;
        }
        config.database_url = file.database_url;
        config.producer_endpoint = file.producer_endpoint;

        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `LESSON_FORGE_DEFAULT_TTL_SECS`: Cache TTL (default: 30 days)
    /// - `LESSON_FORGE_EVICTION_GRACE_SECS`: Eviction grace (default: 1 day)
    /// - `LESSON_FORGE_MAX_RETRIES`: Default max retries (default: 3)
    /// - `LESSON_FORGE_LEASE_STALENESS_SECS`: Heartbeat staleness (default: 300)
    /// - `LESSON_FORGE_NUM_WORKERS`: Local worker count (default: 4)
    /// - `LESSON_FORGE_PRODUCER_TIMEOUT_SECS`: Producer timeout (default: 300)
    /// - `LESSON_FORGE_PRODUCER_ENDPOINT`: Producer HTTP endpoint
    /// - `DATABASE_URL`: PostgreSQL connection URL
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("LESSON_FORGE_DEFAULT_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "LESSON_FORGE_DEFAULT_TTL_SECS")?;
            self.default_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LESSON_FORGE_EVICTION_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "LESSON_FORGE_EVICTION_GRACE_SECS")?;
            self.eviction_grace = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LESSON_FORGE_MAX_RETRIES") {
            self.default_max_retries = parse_env_value(&val, "LESSON_FORGE_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("LESSON_FORGE_LEASE_STALENESS_SECS") {
            let secs: u64 = parse_env_value(&val, "LESSON_FORGE_LEASE_STALENESS_SECS")?;
            self.lease_staleness = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LESSON_FORGE_NUM_WORKERS") {
            self.num_workers = parse_env_value(&val, "LESSON_FORGE_NUM_WORKERS")?;
        }

        if let Ok(val) = std::env::var("LESSON_FORGE_PRODUCER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "LESSON_FORGE_PRODUCER_TIMEOUT_SECS")?;
            self.producer_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LESSON_FORGE_PRODUCER_ENDPOINT") {
            self.producer_endpoint = Some(val);
        }

        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.database_url = Some(val);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "default_ttl must be greater than 0".to_string(),
            ));
        }

        let too_long = [
            ("default_ttl", self.default_ttl),
            ("backoff_max", self.backoff_max),
            ("eviction_grace", self.eviction_grace),
        ]
        .into_iter()
        .chain(self.category_ttls.values().map(|ttl| ("category ttl", *ttl)))
        .find(|(_, value)| *value > MAX_DURATION);
        if let Some((name, _)) = too_long {
            return Err(ConfigError::ValidationFailed(format!(
                "{} cannot exceed {} days",
                name,
                MAX_DURATION.as_secs() / 86_400
            )));
        }

        if let Some((category, _)) = self.category_ttls.iter().find(|(_, ttl)| ttl.is_zero()) {
            return Err(ConfigError::ValidationFailed(format!(
                "ttl for category '{}' must be greater than 0",
                category
            )));
        }

        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::ValidationFailed(
                "backoff_base cannot exceed backoff_max".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval and poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval >= self.lease_staleness {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be shorter than lease_staleness".to_string(),
            ));
        }

        if self.producer_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "producer_timeout must be greater than 0".to_string(),
            ));
        }

        if self.warming_priority <= self.user_priority {
            return Err(ConfigError::ValidationFailed(
                "warming_priority must be numerically higher than user_priority".to_string(),
            ));
        }

        if self.navigation_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "navigation_threshold must be greater than 0".to_string(),
            ));
        }

        if self.metrics_bucket.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "metrics_bucket must be at least one second".to_string(),
            ));
        }

        for rule in &self.warming_rules {
            if rule.grade.trim().is_empty() || rule.subject.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "warming rules need a grade and a subject".to_string(),
                ));
            }
            if rule.container.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "warming rule for {}/{} has an empty container",
                    rule.grade, rule.subject
                )));
            }
        }

        Ok(())
    }

    /// Returns the TTL for a content category.
    pub fn ttl_for(&self, category: &str) -> Duration {
        self.category_ttls
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Returns the database URL or an error naming the missing variable.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))
    }

    /// Builder method to set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Builder method to set the TTL of one category.
    pub fn with_category_ttl(mut self, category: impl Into<String>, ttl: Duration) -> Self {
        self.category_ttls.insert(category.into(), ttl);
        self
    }

    /// Builder method to set the eviction grace period.
    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }

    /// Builder method to set the default max retries.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Builder method to set the retry backoff bounds.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Builder method to set the number of workers.
    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    /// Builder method to set heartbeat timing.
    pub fn with_heartbeat(mut self, interval: Duration, staleness: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.lease_staleness = staleness;
        self
    }

    /// Builder method to set the pool poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the producer timeout.
    pub fn with_producer_timeout(mut self, timeout: Duration) -> Self {
        self.producer_timeout = timeout;
        self
    }

    /// Builder method to set the navigation window and threshold.
    pub fn with_navigation(mut self, window: Duration, threshold: u64) -> Self {
        self.navigation_window = window;
        self.navigation_threshold = threshold;
        self
    }

    /// Builder method to add a warming rule.
    pub fn with_warming_rule(mut self, rule: WarmingRule) -> Self {
        self.warming_rules.push(rule);
        self
    }

    /// Builder method to set the metrics bucket width.
    pub fn with_metrics_bucket(mut self, width: Duration) -> Self {
        self.metrics_bucket = width;
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(2_592_000));
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.lease_staleness, Duration::from_secs(300));
        assert_eq!(config.eviction_grace, Duration::from_secs(86_400));
        assert!(config.warming_priority > config.user_priority);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_for_category() {
        let config = EngineConfig::new().with_category_ttl("quiz", Duration::from_secs(60));
        assert_eq!(config.ttl_for("quiz"), Duration::from_secs(60));
        assert_eq!(config.ttl_for("lesson"), config.default_ttl);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_default_ttl(Duration::from_secs(100))
            .with_default_max_retries(5)
            .with_num_workers(8)
            .with_heartbeat(Duration::from_secs(5), Duration::from_secs(20))
            .with_database_url("postgres://test/db");

        assert_eq!(config.default_ttl, Duration::from_secs(100));
        assert_eq!(config.default_max_retries, 5);
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.lease_staleness, Duration::from_secs(20));
        assert_eq!(config.require_database_url().ok(), Some("postgres://test/db"));
    }

    #[test]
    fn test_validation_rejects_zero_ttl() {
        let result = EngineConfig::new()
            .with_default_ttl(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("default_ttl"));
    }

    #[test]
    fn test_validation_rejects_heartbeat_slower_than_staleness() {
        let result = EngineConfig::new()
            .with_heartbeat(Duration::from_secs(60), Duration::from_secs(30))
            .validate();
        assert!(result.unwrap_err().to_string().contains("heartbeat_interval"));
    }

    #[test]
    fn test_validation_rejects_inverted_priorities() {
        let mut config = EngineConfig::new();
        config.warming_priority = config.user_priority;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unbounded_durations() {
        let huge = Duration::from_secs(10_000_000_000_000);

        let result = EngineConfig::new().with_default_ttl(huge).validate();
        assert!(result.unwrap_err().to_string().contains("default_ttl"));

        let result = EngineConfig::new().with_category_ttl("quiz", huge).validate();
        assert!(result.unwrap_err().to_string().contains("category ttl"));

        let result = EngineConfig::new()
            .with_backoff(Duration::from_secs(30), huge)
            .validate();
        assert!(result.unwrap_err().to_string().contains("backoff_max"));

        assert!(EngineConfig::new().with_default_ttl(MAX_DURATION).validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let result = EngineConfig::new()
            .with_backoff(Duration::from_secs(10), Duration::from_secs(1))
            .validate();
        assert!(result.unwrap_err().to_string().contains("backoff_base"));
    }

    #[test]
    fn test_missing_database_url() {
        let err = EngineConfig::new().require_database_url().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
default_ttl_secs: 3600
category_ttl_secs:
  quiz: 600
default_max_retries: 2
warming_rules:
  - grade: "5"
    subject: Math
    container: lesson
    skills: [S1, S2]
    desired_variants: 3
"#
        )
        .expect("write config");

        let config = EngineConfig::from_yaml_file(file.path()).expect("config should parse");
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.ttl_for("quiz"), Duration::from_secs(600));
        assert_eq!(config.default_max_retries, 2);
        assert_eq!(config.warming_rules.len(), 1);

        let rule = &config.warming_rules[0];
        assert_eq!(rule.tenant, DEFAULT_TENANT);
        assert_eq!(rule.desired_variants, 3);
        assert_eq!(rule.identities().len(), 2);
    }

    #[test]
    fn test_yaml_rejects_unknown_keys() {
        let result = EngineConfig::from_yaml_str("default_ttl: 5\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_warming_rule_without_skills_is_subject_wide() {
        let rule = WarmingRule::new("3", "Science", "quiz", 2).with_career("farming");
        let identities = rule.identities();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].skill, "");
        assert_eq!(identities[0].container, "quiz");
        assert_eq!(identities[0].career.as_deref(), Some("farming"));
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: u64 = parse_env_value("42", "KEY").expect("should parse");
        assert_eq!(parsed, 42);

        let err = parse_env_value::<u64>("forty", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
    }
}
