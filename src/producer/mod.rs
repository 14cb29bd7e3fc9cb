//! Content producer interface.
//!
//! The producer is the external collaborator that turns a content identity
//! into an artifact (typically by prompting a model). The engine never looks
//! inside the artifact; it only needs to know whether a failure is worth
//! retrying.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProducerError;
use crate::identity::ContentIdentity;

pub use http::HttpProducer;

/// Artifact returned by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedContent {
    /// Opaque payload stored in the cache as-is.
    pub artifact: String,
    /// Model or producer variant that generated the payload.
    #[serde(default)]
    pub producer_variant: Option<String>,
}

impl ProducedContent {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            producer_variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.producer_variant = Some(variant.into());
        self
    }
}

/// Something that can produce content for an identity.
#[async_trait]
pub trait ContentProducer: Send + Sync {
    /// Produces the artifact for `identity`.
    ///
    /// # Errors
    ///
    /// `ProducerError::Transient` for failures a later attempt could fix,
    /// `ProducerError::Fatal` for failures it cannot.
    async fn produce(&self, identity: &ContentIdentity) -> Result<ProducedContent, ProducerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "producer"
    }
}
