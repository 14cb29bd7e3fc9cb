//! Content identities.
//!
//! A [`ContentIdentity`] names one piece of producible content. The same
//! tuple is used as the cache key and as the subject of a queue item, so
//! every storage backend keys rows by the canonical [`ContentIdentity::key`]
//! string rather than by the struct itself.

use serde::{Deserialize, Serialize};

/// Tenant used when a caller does not name one.
pub const DEFAULT_TENANT: &str = "default";

/// Container type used when a caller does not name one.
pub const DEFAULT_CONTAINER: &str = "lesson";

const KEY_SEPARATOR: char = '|';

/// The tuple that uniquely names one piece of producible content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentIdentity {
    /// Tenant (deployment-level partition of content).
    pub tenant: String,
    /// Learner grade level (e.g. "5", "K").
    pub grade: String,
    /// Subject (e.g. "Math").
    pub subject: String,
    /// Skill within the subject.
    pub skill: String,
    /// Optional career context the content is framed in.
    #[serde(default)]
    pub career: Option<String>,
    /// Container or context type (e.g. "lesson", "quiz", "practice").
    pub container: String,
    /// Optional sub-variant, used to keep several versions of the same content.
    #[serde(default)]
    pub variant: Option<String>,
}

impl ContentIdentity {
    /// Creates an identity in the default tenant and container.
    pub fn new(
        grade: impl Into<String>,
        subject: impl Into<String>,
        skill: impl Into<String>,
    ) -> Self {
        Self {
            tenant: DEFAULT_TENANT.to_string(),
            grade: grade.into(),
            subject: subject.into(),
            skill: skill.into(),
            career: None,
            container: DEFAULT_CONTAINER.to_string(),
            variant: None,
        }
    }

    /// Sets the tenant.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    /// Sets the career context.
    pub fn with_career(mut self, career: impl Into<String>) -> Self {
        self.career = Some(career.into());
        self
    }

    /// Sets the container type.
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    /// Sets the sub-variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Returns the canonical storage key for this identity.
    ///
    /// Fields are trimmed and joined in a fixed order; absent optionals render
    /// as empty segments. Separator characters inside a field are escaped so
    /// two different tuples can never produce the same key.
    pub fn key(&self) -> String {
        let segments = [
            self.tenant.as_str(),
            self.grade.as_str(),
            self.subject.as_str(),
            self.skill.as_str(),
            self.career.as_deref().unwrap_or(""),
            self.container.as_str(),
            self.variant.as_deref().unwrap_or(""),
        ];

        let mut key = String::new();
        for (idx, segment) in segments.iter().enumerate() {
            if idx > 0 {
                key.push(KEY_SEPARATOR);
            }
            for ch in segment.trim().chars() {
                if ch == KEY_SEPARATOR || ch == '\\' {
                    key.push('\\');
                }
                key.push(ch);
            }
        }
        key
    }

    /// Content category used to pick a TTL. This is the container type.
    pub fn category(&self) -> &str {
        self.container.trim()
    }

    /// Metric dimensions this identity contributes to, besides `all`.
    pub fn dimensions(&self) -> [String; 2] {
        [
            format!("grade:{}", self.grade.trim()),
            format!("subject:{}", self.subject.trim()),
        ]
    }
}

impl std::fmt::Display for ContentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_tuples_share_a_key() {
        let a = ContentIdentity::new("5", "Math", "S1");
        let b = ContentIdentity::new("5", "Math", "S1");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key(), "default|5|Math|S1||lesson|");
    }

    #[test]
    fn test_key_trims_whitespace() {
        let a = ContentIdentity::new(" 5", "Math ", "S1");
        let b = ContentIdentity::new("5", "Math", "S1");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_optional_fields_change_the_key() {
        let base = ContentIdentity::new("5", "Math", "S1");
        let career = base.clone().with_career("nursing");
        let variant = base.clone().with_variant("v2");

        assert_ne!(base.key(), career.key());
        assert_ne!(base.key(), variant.key());
        assert_ne!(career.key(), variant.key());
    }

    #[test]
    fn test_separator_is_escaped() {
        let a = ContentIdentity::new("5", "Math|S1", "x");
        let b = ContentIdentity::new("5", "Math", "S1|x");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_category_and_dimensions() {
        let id = ContentIdentity::new("5", "Math", "S1").with_container("quiz");
        assert_eq!(id.category(), "quiz");
        assert_eq!(
            id.dimensions(),
            ["grade:5".to_string(), "subject:Math".to_string()]
        );
    }
}
