//! Provider trait and the HTTP provider implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resilience::provider_dependency;

use super::types::{Completion, TaskHint};

/// A generation backend.
///
/// Concrete backends (hosted models, local runners) implement this contract
/// and are registered with a [`ProviderProfile`](super::ProviderProfile).
/// Implementations report failures as errors; the router owns retries,
/// timeouts and circuit breaking.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name. Must match the profile it is registered with.
    fn name(&self) -> &str;

    /// Produce an artifact for `prompt`.
    async fn invoke(&self, prompt: &str, hint: &TaskHint) -> Result<Completion>;

    /// Liveness probe used by the provider slot pool.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Configuration for HTTP providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Endpoint receiving `POST {prompt, task_hint}`
    pub endpoint: String,
    /// Bearer token
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Endpoint for `GET` health probes
    #[serde(default)]
    pub health_url: Option<String>,
}

fn default_timeout_secs() -> u64 {
    120
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            health_url: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    })) {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e))),
    }
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    prompt: &'a str,
    task_hint: &'a TaskHint,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    artifact: String,
    #[serde(default)]
    units: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Provider speaking a minimal JSON protocol over HTTP.
pub struct HttpProvider {
    name: String,
    dependency: String,
    config: ClientConfig,
    http: Client,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let name = name.into();
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self {
            dependency: provider_dependency(&name),
            name,
            config,
            http,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn transient(&self, message: String) -> Error {
        Error::transient(self.dependency.clone(), message)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &str, hint: &TaskHint) -> Result<Completion> {
        let mut request = self
            .http
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&InvokeRequest {
                prompt,
                task_hint: hint,
            });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transient(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transient(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ErrorBody>(&body) {
                return Err(self.transient(format!(
                    "provider error ({}): {}",
                    status, error.error.message
                )));
            }
            return Err(self.transient(format!("provider error ({}): {}", status, body)));
        }

        let parsed: InvokeResponse = serde_json::from_str(&body)
            .map_err(|e| self.transient(format!("Failed to parse response: {}", e)))?;

        debug!(provider = %self.name, bytes = parsed.artifact.len(), "Provider responded");
        Ok(Completion {
            artifact: parsed.artifact,
            units_used: parsed.units,
        })
    }

    async fn health_check(&self) -> bool {
        let Some(url) = &self.config.health_url else {
            return true;
        };
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
