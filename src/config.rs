//! Engine configuration.
//!
//! The observed behavior of this system disagreed with itself on several
//! gate values across revisions, so every threshold lives here with a
//! default instead of being hard-coded at the call site.

use serde::{Deserialize, Serialize};

use crate::service::RetryPolicy;

/// Configuration for one deliberation engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationConfig {
    /// Maximum debate rounds before a forced deadlock.
    pub max_rounds: u32,
    /// Retrieval quality below this triggers speculative reframing.
    pub quality_threshold: f64,
    /// Fewer initial passages than this counts as an insufficient result set.
    pub min_results: usize,
    /// Average relevance below this counts as a low-relevance result set.
    pub low_relevance_threshold: f64,
    /// Number of alternative query formulations to generate.
    pub max_alternative_queries: usize,
    /// Token-overlap fraction above which two passages are duplicates.
    pub dedup_overlap: f64,
    /// Passages requested from the retrieval backend per call.
    pub retrieval_k: usize,
    /// Passages formatted into prompts.
    pub context_top_k: usize,
    /// Critical-issue count that forces escalation.
    pub critical_escalation_threshold: u32,
    /// Confidence ceiling for deadlocked or escalated answers.
    pub capped_confidence: f64,
    /// Maximum sources attached to a final answer.
    pub max_sources: usize,
    /// Retry policy for the main completion calls.
    pub retry: RetryPolicy,
    /// Per-call completion timeout in milliseconds.
    pub completion_timeout_ms: u64,
    /// Per-call retrieval timeout in milliseconds.
    pub retrieval_timeout_ms: u64,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            quality_threshold: 0.7,
            min_results: 3,
            low_relevance_threshold: 0.5,
            max_alternative_queries: 3,
            dedup_overlap: 0.7,
            retrieval_k: 10,
            context_top_k: 5,
            critical_escalation_threshold: 2,
            capped_confidence: 0.7,
            max_sources: 5,
            retry: RetryPolicy::default(),
            completion_timeout_ms: 120_000,
            retrieval_timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeliberationConfig::default();
        assert_eq!(config.max_rounds, 3);
        assert!((config.quality_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.critical_escalation_threshold, 2);
        assert_eq!(config.max_sources, 5);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = DeliberationConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: DeliberationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.retrieval_k, 10);
        assert_eq!(parsed.retry.max_attempts, 3);
    }
}
