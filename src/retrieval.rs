//! Retrieval orchestration — initial query, quality gate, speculative
//! reframing, and overlap-deduplicated merge.
//!
//! One retrieval pass runs per query. If the initial result set scores
//! below the quality gate and looks insufficient, up to three reframed
//! queries are retrieved concurrently; the single best-scoring alternative
//! (strictly better than the initial set) is merged in. A failed
//! alternative is skipped, never fatal; a failed *initial* retrieval aborts
//! the whole query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DeliberationConfig;
use crate::error::DeliberationError;
use crate::prompts;
use crate::service::{CompletionService, RetrievalService, ScoredPassage};

/// A passage selected for the workflow, immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedPassage {
    /// Passage text.
    pub text: String,
    /// Relevance score in `[0, 1]`.
    pub relevance: f64,
    /// Source identifier (document name, chunk id, ...).
    pub source: String,
    /// Provenance metadata carried through from the backend.
    pub metadata: HashMap<String, String>,
}

impl RetrievedPassage {
    /// Convert a raw backend passage, lifting the source identifier out of
    /// its metadata.
    pub fn from_scored(raw: ScoredPassage) -> Self {
        let source = raw
            .metadata
            .get("source")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            text: raw.content,
            relevance: raw.score.clamp(0.0, 1.0),
            source,
            metadata: raw.metadata,
        }
    }
}

/// Whether the orchestration produced any passages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    /// At least one passage survived.
    Found,
    /// Nothing retrievable for this query, even after reframing.
    NoResults,
}

/// Which retrieval path produced the final passage set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Initial retrieval was good enough as-is.
    Initial,
    /// Merged with the k-th reframed query's results (1-based).
    RefinedQuery(usize),
    /// Reframing ran but no alternative beat the initial set.
    InitialOnly,
}

impl RetrievalStrategy {
    /// Stable label for logs and telemetry.
    pub fn label(&self) -> String {
        match self {
            Self::Initial => "initial".to_string(),
            Self::RefinedQuery(k) => format!("refined_query_{}", k),
            Self::InitialOnly => "initial_only".to_string(),
        }
    }
}

impl std::fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Result of one retrieval orchestration pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    /// Found / no-results status.
    pub status: RetrievalStatus,
    /// Final ranked passage set (deduplicated, capped).
    pub passages: Vec<RetrievedPassage>,
    /// Quality score of the final set.
    pub quality_score: f64,
    /// Which path produced the set.
    pub strategy: RetrievalStrategy,
    /// The reframed queries that were tried (empty if none).
    pub reframed_queries: Vec<String>,
    /// Rephrasing hint for the user when nothing was found.
    pub suggestion: Option<String>,
}

/// Format passages into a numbered context block for prompts.
pub(crate) fn format_passages(passages: &[RetrievedPassage], limit: usize) -> String {
    if passages.is_empty() {
        return "No context available.".to_string();
    }
    passages
        .iter()
        .take(limit)
        .enumerate()
        .map(|(i, p)| {
            format!(
                "[Source {}] (relevance {:.2}, from {})\n{}",
                i + 1,
                p.relevance,
                p.source,
                p.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Fraction of `candidate`'s distinct tokens that also appear in `existing`.
pub(crate) fn token_overlap(candidate: &str, existing: &str) -> f64 {
    let cand: HashSet<&str> = candidate.split_whitespace().collect();
    if cand.is_empty() {
        return 0.0;
    }
    let exist: HashSet<&str> = existing.split_whitespace().collect();
    let shared = cand.iter().filter(|t| exist.contains(*t)).count();
    shared as f64 / cand.len() as f64
}

/// Merge alternative passages into the initial set, dropping any candidate
/// whose token overlap with an already-kept passage exceeds the threshold.
/// First-seen passages win.
pub(crate) fn merge_passages(
    initial: &[RetrievedPassage],
    alternative: &[RetrievedPassage],
    overlap_threshold: f64,
) -> Vec<RetrievedPassage> {
    let mut merged: Vec<RetrievedPassage> = initial.to_vec();
    for candidate in alternative {
        let duplicate = merged
            .iter()
            .any(|kept| token_overlap(&candidate.text, &kept.text) > overlap_threshold);
        if !duplicate {
            merged.push(candidate.clone());
        }
    }
    merged
}

/// Mean relevance over the top `top` passages.
pub(crate) fn average_relevance(passages: &[RetrievedPassage], top: usize) -> f64 {
    let n = passages.len().min(top);
    if n == 0 {
        return 0.0;
    }
    passages.iter().take(n).map(|p| p.relevance).sum::<f64>() / n as f64
}

/// Parse a `SCORE: X.XX | REASON: ...` assessment response.
pub(crate) fn parse_quality_score(response: &str) -> Option<f64> {
    let rest = response.split("SCORE:").nth(1)?;
    let token = rest.split('|').next()?.trim();
    token.parse::<f64>().ok().map(|v| v.clamp(0.0, 1.0))
}

/// Parse reframed queries from a reframing response.
///
/// Prefers `QUERY:`-prefixed lines; falls back to plausible bare lines when
/// the model ignored the format. Unsubstituted placeholder lines (`{...}`)
/// are dropped either way.
pub(crate) fn parse_reframed_queries(response: &str, limit: usize) -> Vec<String> {
    let mut queries: Vec<String> = Vec::new();
    for line in response.lines() {
        if let Some(rest) = line.trim().strip_prefix("QUERY:") {
            let q = rest.trim();
            if !q.is_empty() && !(q.starts_with('{') && q.ends_with('}')) {
                queries.push(q.to_string());
            }
        }
    }

    if queries.is_empty() {
        for line in response.lines() {
            let line = line.trim();
            if line.len() <= 10 {
                continue;
            }
            if line.starts_with("1.")
                || line.starts_with("2.")
                || line.starts_with("3.")
                || line.starts_with('#')
                || line.starts_with("Alternative")
            {
                continue;
            }
            if line.starts_with('{') && line.ends_with('}') {
                continue;
            }
            queries.push(line.to_string());
            if queries.len() >= limit {
                break;
            }
        }
    }

    queries.truncate(limit);
    queries
}

/// Describe what is weak about a result set, for the reframing prompt.
pub(crate) fn quality_issues(
    passages: &[RetrievedPassage],
    min_results: usize,
    low_relevance: f64,
) -> String {
    let mut issues: Vec<String> = Vec::new();
    if passages.len() < min_results {
        issues.push(format!(
            "too few results ({} < {})",
            passages.len(),
            min_results
        ));
    }
    let avg = average_relevance(passages, 5);
    if !passages.is_empty() && avg < low_relevance {
        issues.push(format!("low average relevance ({:.2})", avg));
    }
    let distinct: HashSet<&str> = passages
        .iter()
        .take(5)
        .map(|p| {
            let end = p
                .text
                .char_indices()
                .nth(100)
                .map_or(p.text.len(), |(i, _)| i);
            &p.text[..end]
        })
        .collect();
    if passages.len() >= 3 && distinct.len() < 3 {
        issues.push("low content diversity".to_string());
    }
    if issues.is_empty() {
        "general low relevance".to_string()
    } else {
        issues.join("; ")
    }
}

/// Runs the retrieval stage: one pass per query.
pub struct RetrievalOrchestrator {
    retrieval: Arc<dyn RetrievalService>,
    completion: Arc<dyn CompletionService>,
    config: DeliberationConfig,
}

impl RetrievalOrchestrator {
    /// Create an orchestrator over the two backends.
    pub fn new(
        retrieval: Arc<dyn RetrievalService>,
        completion: Arc<dyn CompletionService>,
        config: DeliberationConfig,
    ) -> Self {
        Self {
            retrieval,
            completion,
            config,
        }
    }

    /// Run the full retrieval algorithm for one query.
    pub async fn run(
        &self,
        query: &str,
        scope_id: &str,
    ) -> Result<RetrievalOutcome, DeliberationError> {
        let raw = self
            .retrieval
            .retrieve(query, scope_id)
            .await
            .map_err(DeliberationError::RetrievalFailure)?;

        let mut passages: Vec<RetrievedPassage> =
            raw.into_iter().map(RetrievedPassage::from_scored).collect();
        passages.truncate(self.config.retrieval_k);

        let mut quality = self.assess_quality(query, &passages).await;
        let mut strategy = RetrievalStrategy::Initial;
        let mut reframed_queries: Vec<String> = Vec::new();
        debug!(quality, count = passages.len(), "initial retrieval scored");

        let insufficient = passages.len() < self.config.min_results
            || average_relevance(&passages, self.config.context_top_k)
                < self.config.low_relevance_threshold;

        if quality < self.config.quality_threshold && insufficient {
            info!(quality, "retrieval below quality gate, reframing query");
            reframed_queries = self.generate_reframed_queries(query, quality, &passages).await;

            if !reframed_queries.is_empty() {
                match self
                    .best_alternative(query, scope_id, &reframed_queries, quality)
                    .await
                {
                    Some((index, alt_passages, alt_quality)) => {
                        info!(
                            alternative = index + 1,
                            alt_quality, "merging best alternative retrieval"
                        );
                        passages =
                            merge_passages(&passages, &alt_passages, self.config.dedup_overlap);
                        passages.truncate(self.config.retrieval_k);
                        quality = self.assess_quality(query, &passages).await;
                        strategy = RetrievalStrategy::RefinedQuery(index + 1);
                    }
                    None => {
                        info!("no alternative beat the initial set");
                        strategy = RetrievalStrategy::InitialOnly;
                    }
                }
            }
        }

        let status = if passages.is_empty() {
            RetrievalStatus::NoResults
        } else {
            RetrievalStatus::Found
        };
        let suggestion = (status == RetrievalStatus::NoResults).then(|| {
            format!(
                "Try rephrasing '{}' to be more specific about the course material.",
                query
            )
        });

        Ok(RetrievalOutcome {
            status,
            passages,
            quality_score: quality,
            strategy,
            reframed_queries,
            suggestion,
        })
    }

    /// Score a result set: grounded assessment via the completion service,
    /// falling back to the relevance average if that call fails or returns
    /// an unparseable score.
    async fn assess_quality(&self, query: &str, passages: &[RetrievedPassage]) -> f64 {
        if passages.is_empty() {
            return 0.0;
        }
        let block = format_passages(passages, self.config.context_top_k);
        let prompt = prompts::quality_assessment(query, &block);
        match self.completion.complete(&prompt).await {
            Ok(response) => parse_quality_score(&response)
                .unwrap_or_else(|| average_relevance(passages, self.config.context_top_k)),
            Err(err) => {
                warn!(error = %err, "quality assessment unavailable, using relevance average");
                average_relevance(passages, self.config.context_top_k)
            }
        }
    }

    /// Ask the completion service for alternative query formulations.
    /// Failure here just disables reframing; it is never fatal.
    async fn generate_reframed_queries(
        &self,
        query: &str,
        quality: f64,
        passages: &[RetrievedPassage],
    ) -> Vec<String> {
        let issues = quality_issues(
            passages,
            self.config.min_results,
            self.config.low_relevance_threshold,
        );
        let prompt = prompts::query_reframe(query, quality, &issues);
        match self.completion.complete(&prompt).await {
            Ok(response) => {
                let queries =
                    parse_reframed_queries(&response, self.config.max_alternative_queries);
                debug!(count = queries.len(), "reframed queries generated");
                queries
            }
            Err(err) => {
                warn!(error = %err, "query reframing unavailable, keeping initial results");
                Vec::new()
            }
        }
    }

    /// Retrieve all alternatives concurrently and return the best-scoring
    /// one, if any scores strictly above the initial quality. Failed
    /// branches are skipped.
    async fn best_alternative(
        &self,
        original_query: &str,
        scope_id: &str,
        queries: &[String],
        initial_quality: f64,
    ) -> Option<(usize, Vec<RetrievedPassage>, f64)> {
        let calls = queries.iter().map(|q| self.retrieval.retrieve(q, scope_id));
        let results = join_all(calls).await;

        let mut best: Option<(usize, Vec<RetrievedPassage>, f64)> = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(raw) => {
                    let alt: Vec<RetrievedPassage> =
                        raw.into_iter().map(RetrievedPassage::from_scored).collect();
                    if alt.is_empty() {
                        debug!(alternative = index + 1, "alternative returned no passages");
                        continue;
                    }
                    let score = self.assess_quality(original_query, &alt).await;
                    debug!(alternative = index + 1, score, "alternative scored");
                    let beats_best = best.as_ref().map_or(true, |(_, _, s)| score > *s);
                    if score > initial_quality && beats_best {
                        best = Some((index, alt, score));
                    }
                }
                Err(err) => {
                    warn!(alternative = index + 1, error = %err, "alternative retrieval failed, skipping");
                }
            }
        }
        best
    }
}
