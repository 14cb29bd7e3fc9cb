//! HTTP content producer.
//!
//! POSTs the identity as JSON to a generation endpoint and stores whatever
//! artifact it returns. The endpoint is expected to answer with
//! `{"artifact": <any JSON>, "model": "<optional>"}`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ProducerError;
use crate::identity::ContentIdentity;

use super::{ContentProducer, ProducedContent};

/// Request timeout in seconds, applied by the HTTP client.
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Producer backed by an HTTP generation service.
pub struct HttpProducer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProduceRequest<'a> {
    identity: &'a ContentIdentity,
    identity_key: String,
}

#[derive(Debug, Deserialize)]
struct ProduceResponse {
    artifact: serde_json::Value,
    #[serde(default)]
    model: Option<String>,
}

impl HttpProducer {
    /// Creates a producer for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `ProducerError::Fatal` if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ProducerError> {
        Self::with_timeout(endpoint, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    /// Creates a producer with a custom request timeout.
    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProducerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProducerError::Fatal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
        })
    }

    /// Sends `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Maps a non-success HTTP status to a producer error.
///
/// Throttling and server errors are transient; other client errors mean the
/// request itself is unacceptable and will not succeed on retry.
fn classify_status(status: StatusCode, body: String) -> ProducerError {
    let code = status.as_u16();
    let message = format!("HTTP {}: {}", code, body);
    if code == 429 || status.is_server_error() || code == 408 {
        ProducerError::Transient(message)
    } else {
        ProducerError::Fatal(message)
    }
}

fn artifact_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

#[async_trait]
impl ContentProducer for HttpProducer {
    async fn produce(&self, identity: &ContentIdentity) -> Result<ProducedContent, ProducerError> {
        let body = ProduceRequest {
            identity,
            identity_key: identity.key(),
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProducerError::Transient(format!("request timed out: {}", e))
            } else {
                ProducerError::Transient(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(classify_status(status, text));
        }

        let parsed: ProduceResponse = response
            .json()
            .await
            .map_err(|e| ProducerError::Fatal(format!("Failed to parse producer response: {}", e)))?;

        tracing::debug!(
            identity = %identity,
            model = ?parsed.model,
            "Producer returned artifact"
        );

        Ok(ProducedContent {
            artifact: artifact_text(parsed.artifact),
            producer_variant: parsed.model,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}
