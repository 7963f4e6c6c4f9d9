//! HTTP implementations of the service contracts.
//!
//! Both collaborators are plain JSON-over-HTTP services. Failures map onto
//! the transient/permanent split in [`ServiceError`]: timeouts, 429s, and
//! 5xx responses are transient; other client errors are permanent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::service::{CompletionService, RetrievalService, ScoredPassage, ServiceError};

fn map_send_error(err: reqwest::Error, timeout: Duration) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout(timeout)
    } else {
        ServiceError::Unavailable(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        Err(ServiceError::RateLimited(body))
    } else if status.is_server_error() {
        Err(ServiceError::Unavailable(format!("{}: {}", status, body)))
    } else {
        Err(ServiceError::InvalidRequest(format!("{}: {}", status, body)))
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionResponse {
    pub(crate) text: String,
}

/// Completion client for a JSON text-generation gateway.
///
/// Contract: `POST {endpoint}` with `{model, prompt, temperature}`,
/// answered by `{"text": "..."}`.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl HttpCompletionClient {
    /// Create a client with a per-request timeout.
    pub fn new(endpoint: &str, model: &str, timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to create HTTP client"),
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            temperature: 0.2,
            timeout,
        }
    }

    /// Override the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl CompletionService for HttpCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError> {
        let request = CompletionRequest {
            model: &self.model,
            prompt,
            temperature: self.temperature,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;
        let response = check_status(response).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::MalformedResponse(e.to_string()))?;
        debug!(chars = body.text.len(), "completion received");
        Ok(body.text)
    }
}

#[derive(Debug, Serialize)]
struct RetrievalRequest<'a> {
    query: &'a str,
    scope_id: &'a str,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RetrievalResponse {
    #[serde(default)]
    pub(crate) sources: Vec<ScoredPassage>,
}

/// Retrieval client for a JSON vector-search service.
///
/// Contract: `POST {endpoint}` with `{query, scope_id, top_k}`, answered
/// by `{"sources": [{content, score, metadata}]}`. An empty `sources`
/// array is a valid "no results" response, not an error.
pub struct HttpRetrievalClient {
    client: reqwest::Client,
    endpoint: String,
    top_k: usize,
    timeout: Duration,
}

impl HttpRetrievalClient {
    /// Create a client with a per-request timeout.
    pub fn new(endpoint: &str, top_k: usize, timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to create HTTP client"),
            endpoint: endpoint.to_string(),
            top_k,
            timeout,
        }
    }
}

#[async_trait]
impl RetrievalService for HttpRetrievalClient {
    async fn retrieve(
        &self,
        query: &str,
        scope_id: &str,
    ) -> Result<Vec<ScoredPassage>, ServiceError> {
        let request = RetrievalRequest {
            query,
            scope_id,
            top_k: self.top_k,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;
        let response = check_status(response).await?;
        let body: RetrievalResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::MalformedResponse(e.to_string()))?;
        debug!(passages = body.sources.len(), "retrieval received");
        Ok(body.sources)
    }
}
