//! External service contracts — the completion and retrieval collaborators.
//!
//! The engine never talks to a model or a vector index directly; every call
//! goes through these traits so the loop can be driven by deterministic
//! mocks in tests. Errors carry a transient/permanent classification that
//! the retry layer consults instead of string matching.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Error from an external service call, classified for retry logic.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The call exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The service is down or returned a server-side error.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service rejected the request as malformed. Retrying cannot help.
    #[error("request rejected: {0}")]
    InvalidRequest(String),

    /// The response body could not be decoded into the expected shape.
    #[error("undecodable response: {0}")]
    MalformedResponse(String),
}

impl ServiceError {
    /// Whether a retry may succeed. Malformed input never will.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Unavailable(_)
        )
    }
}

/// Raw ranked passage as returned by the retrieval backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPassage {
    /// Passage text.
    pub content: String,
    /// Similarity score in `[0, 1]`.
    pub score: f64,
    /// Provenance metadata (source file, page, chunk id, ...).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Text-generation backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError>;

    /// Incremental variant. The default collects the full completion and
    /// yields it as a single fragment; streaming backends override this.
    async fn complete_stream(
        &self,
        prompt: &str,
    ) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError> {
        let text = self.complete(prompt).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }
}

/// Vector-similarity retrieval backend.
///
/// An `Ok` with an empty list means "no results"; a service outage is an
/// error. Callers rely on that distinction.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Ranked passages for `query` within one knowledge scope.
    async fn retrieve(
        &self,
        query: &str,
        scope_id: &str,
    ) -> Result<Vec<ScoredPassage>, ServiceError>;
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retries).
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier per attempt (2.0 = exponential doubling).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Backoff delay before the given attempt number (0-indexed; attempt 0
    /// is the first call and has no delay).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let delay =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Backoff as a `Duration` before the given attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, 500ms initial backoff, 2x multiplier, 5s max.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

/// Run a completion with retries on transient failures only.
///
/// Permanent failures surface immediately; a transient failure that
/// survives every attempt surfaces as-is.
pub async fn complete_with_retry(
    service: &dyn CompletionService,
    prompt: &str,
    policy: &RetryPolicy,
) -> Result<String, ServiceError> {
    let mut attempt = 0u32;
    loop {
        match service.complete(prompt).await {
            Ok(text) => return Ok(text),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                warn!(attempt, ?delay, error = %err, "transient completion failure, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyCompletion {
        failures_before_success: u32,
        calls: AtomicU32,
        error: fn() -> ServiceError,
    }

    #[async_trait]
    impl CompletionService for FlakyCompletion {
        async fn complete(&self, _prompt: &str) -> Result<String, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err((self.error)())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 4,
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(ServiceError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ServiceError::RateLimited("slow down".into()).is_transient());
        assert!(ServiceError::Unavailable("502".into()).is_transient());
        assert!(!ServiceError::InvalidRequest("bad prompt".into()).is_transient());
        assert!(!ServiceError::MalformedResponse("not json".into()).is_transient());
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ms(0), 0);
        assert_eq!(policy.backoff_ms(1), 500);
        assert_eq!(policy.backoff_ms(2), 1_000);
        assert_eq!(policy.backoff_ms(3), 2_000);
        // Capped at max_backoff_ms
        assert_eq!(policy.backoff_ms(10), 5_000);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let svc = FlakyCompletion {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
            error: || ServiceError::Unavailable("503".into()),
        };
        let out = complete_with_retry(&svc, "p", &fast_policy()).await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(svc.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let svc = FlakyCompletion {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
            error: || ServiceError::Unavailable("503".into()),
        };
        let out = complete_with_retry(&svc, "p", &fast_policy()).await;
        assert!(out.is_err());
        assert_eq!(svc.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let svc = FlakyCompletion {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
            error: || ServiceError::InvalidRequest("malformed".into()),
        };
        let out = complete_with_retry(&svc, "p", &fast_policy()).await;
        assert!(matches!(out, Err(ServiceError::InvalidRequest(_))));
        assert_eq!(svc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_stream_yields_single_fragment() {
        use futures::StreamExt;

        let svc = FlakyCompletion {
            failures_before_success: 0,
            calls: AtomicU32::new(0),
            error: || ServiceError::Unavailable("unused".into()),
        };
        let mut stream = svc.complete_stream("p").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "ok");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_retry_policy_json_roundtrip() {
        let policy = RetryPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_attempts, 3);
        assert_eq!(parsed.initial_backoff_ms, 500);
    }
}
