//! HTTP JSON integration for OpenAI-compatible APIs.
//!
//! An operation name maps to a path under the base URL by replacing dots
//! with slashes (`chat.completions` -> `/chat/completions`). The request
//! value is POSTed as-is and the JSON response body is the call's result.
//!
//! The API key is wrapped in [`SecretString`] and only exposed when building
//! the `Authorization` header.

use std::time::Duration;

use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tether_core::engine::integration::{Integration, IntegrationError};

/// An [`Integration`] that forwards calls to a JSON-over-HTTP API.
pub struct HttpJsonIntegration {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpJsonIntegration {
    /// Build an integration rooted at `base_url`. Each call is bounded by
    /// `timeout`; the engine's background-call retry policy sits on top.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    /// OpenAI (`https://api.openai.com/v1`).
    pub fn openai(api_key: SecretString) -> Result<Self, reqwest::Error> {
        Ok(Self::new("https://api.openai.com/v1", Duration::from_secs(300))?.with_api_key(api_key))
    }

    /// Perplexity (`https://api.perplexity.ai`).
    pub fn perplexity(api_key: SecretString) -> Result<Self, reqwest::Error> {
        Ok(Self::new("https://api.perplexity.ai", Duration::from_secs(300))?.with_api_key(api_key))
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl std::fmt::Debug for HttpJsonIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJsonIntegration")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Path for an operation name. Only `[A-Za-z0-9_-]` segments separated by
/// dots are accepted.
fn operation_path(operation: &str) -> Result<String, IntegrationError> {
    let valid = !operation.is_empty()
        && operation.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if !valid {
        return Err(IntegrationError::UnsupportedOperation(operation.to_string()));
    }
    Ok(format!("/{}", operation.replace('.', "/")))
}

impl Integration for HttpJsonIntegration {
    fn call(&self, operation: &str, request: Value) -> BoxFuture<'static, Result<Value, IntegrationError>> {
        let path = match operation_path(operation) {
            Ok(path) => path,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        Box::pin(async move {
            let response = builder
                .send()
                .await
                .map_err(|e| IntegrationError::Request(format!("HTTP request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(IntegrationError::Request(format!("HTTP {status}: {body}")));
            }

            response
                .json::<Value>()
                .await
                .map_err(|e| IntegrationError::InvalidResponse(format!("failed to parse response: {e}")))
        })
    }
}
