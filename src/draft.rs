//! Draft generation — answer candidates with an explicit reasoning trace.
//!
//! The generator asks for a JSON envelope and parses it through a ladder:
//! strict parse, then an embedded-JSON rescue, then a deterministic
//! extractive fallback built from the retrieved passages. A response that
//! echoes template placeholders or claims the context was empty (when it
//! was not) is rejected the same way — that guards against a degenerate
//! model response parroting its own prompt.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DeliberationConfig;
use crate::error::DeliberationError;
use crate::prompts;
use crate::retrieval::{format_passages, RetrievedPassage};
use crate::service::{complete_with_retry, CompletionService};

/// One step of a draft's reasoning trace. Indices are 1-based and strictly
/// increasing within a draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// 1-based position in the trace.
    pub index: u32,
    /// The reasoning for this step.
    pub thought: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// A candidate answer. A new draft supersedes but does not destroy the
/// previous one; superseded drafts stay reachable for debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    /// Draft identifier, unique within a query.
    pub id: String,
    /// Answer body.
    pub content: String,
    /// Ordered reasoning trace.
    pub reasoning: Vec<ReasoningStep>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DraftEnvelope {
    draft_content: String,
    #[serde(default)]
    chain_of_thought: Vec<EnvelopeStep>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeStep {
    #[serde(default)]
    #[allow(dead_code)]
    step: u32,
    thought: String,
    #[serde(default = "default_step_confidence")]
    confidence: f64,
}

fn default_step_confidence() -> f64 {
    0.7
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[a-zA-Z][a-zA-Z0-9_]*\}").expect("placeholder regex"))
}

fn embedded_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[\s\S]*\}").expect("embedded json regex"))
}

/// Whether text still contains unresolved template placeholders such as
/// `{query}` or `{context_block}`.
pub(crate) fn contains_placeholders(text: &str) -> bool {
    placeholder_re().is_match(text)
}

/// Whether the model claims it was given no context.
pub(crate) fn claims_empty_context(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("context does not contain")
        || lower.contains("context is empty")
        || lower.contains("no context available")
        || lower.contains("no context was provided")
}

/// Parse ladder: strict JSON first, then a JSON object embedded in prose.
fn parse_envelope(response: &str) -> Option<DraftEnvelope> {
    if let Ok(envelope) = serde_json::from_str::<DraftEnvelope>(response) {
        return Some(envelope);
    }
    let fragment = embedded_json_re().find(response)?;
    serde_json::from_str::<DraftEnvelope>(fragment.as_str()).ok()
}

/// Deterministic extractive fallback: salient lines pulled straight from
/// the retrieved passages. Same query + context always yields the same
/// draft content and reasoning.
pub(crate) fn fallback_draft(query: &str, passages: &[RetrievedPassage], id: &str) -> Draft {
    let mut lines: Vec<String> = Vec::new();
    'outer: for passage in passages.iter().take(5) {
        for line in passage.text.lines() {
            let line = line.trim();
            if line.len() <= 20 || line.starts_with("[Source") {
                continue;
            }
            let end = line.char_indices().nth(200).map_or(line.len(), |(i, _)| i);
            lines.push(format!("- {}", &line[..end]));
            if lines.len() >= 5 {
                break 'outer;
            }
        }
    }

    let content = if lines.is_empty() {
        format!(
            "The course material contains nothing that addresses this \
             question directly. Question asked: \"{}\"",
            query
        )
    } else {
        format!(
            "Based on the retrieved course material:\n\n{}\n\nThese points \
             were extracted to answer: \"{}\"",
            lines.join("\n"),
            query
        )
    };

    let reasoning = vec![
        ReasoningStep {
            index: 1,
            thought: "Collected the highest-relevance passages for the question".to_string(),
            confidence: 0.6,
        },
        ReasoningStep {
            index: 2,
            thought: "Assembled the most substantive passage excerpts into an answer".to_string(),
            confidence: 0.55,
        },
    ];

    Draft {
        id: id.to_string(),
        content,
        reasoning,
        created_at: Utc::now(),
    }
}

/// Generates and refines drafts via the completion service.
pub struct DraftGenerator {
    completion: Arc<dyn CompletionService>,
    config: DeliberationConfig,
}

impl DraftGenerator {
    /// Create a generator over the completion backend.
    pub fn new(completion: Arc<dyn CompletionService>, config: DeliberationConfig) -> Self {
        Self { completion, config }
    }

    /// Produce the draft for one round.
    ///
    /// With `feedback` and a `previous` draft present the generator runs in
    /// refinement mode. Returns the draft plus any recovered-error notes
    /// for the workflow log; only a service failure is an actual error.
    pub async fn generate(
        &self,
        query_text: &str,
        domain_instruction: Option<&str>,
        passages: &[RetrievedPassage],
        feedback: Option<&str>,
        previous: Option<&Draft>,
        round: u32,
    ) -> Result<(Draft, Vec<String>), DeliberationError> {
        let mut notes: Vec<String> = Vec::new();
        let draft_id = format!("d{}", round);
        let context = format_passages(passages, self.config.context_top_k);

        let prompt = match (feedback, previous) {
            (Some(feedback), Some(previous)) => {
                debug!(round, "refining previous draft from feedback");
                prompts::refine(query_text, &previous.content, feedback, &context)
            }
            _ => prompts::draft(query_text, &context, domain_instruction),
        };

        let response = complete_with_retry(self.completion.as_ref(), &prompt, &self.config.retry)
            .await
            .map_err(DeliberationError::from_completion)?;

        let envelope = match parse_envelope(&response) {
            Some(envelope) => envelope,
            None => {
                let err = DeliberationError::GenerationParseFailure(
                    "no JSON envelope in draft response".to_string(),
                );
                warn!(round, "{}", err);
                notes.push(err.to_string());
                return Ok((fallback_draft(query_text, passages, &draft_id), notes));
            }
        };

        let content = envelope.draft_content;
        let rejected = if contains_placeholders(&content) {
            Some("draft echoed unresolved template placeholders")
        } else if !passages.is_empty() && claims_empty_context(&content) {
            Some("draft claimed empty context despite supplied passages")
        } else if content.trim().is_empty() {
            Some("draft content was empty")
        } else if previous.is_some_and(|p| p.content.trim() == content.trim()) {
            Some("refinement echoed the previous draft unchanged")
        } else {
            None
        };

        if let Some(reason) = rejected {
            let err = DeliberationError::GenerationParseFailure(reason.to_string());
            warn!(round, "{}", err);
            notes.push(err.to_string());
            return Ok((fallback_draft(query_text, passages, &draft_id), notes));
        }

        // Re-index to guarantee a 1-based monotonic trace regardless of what
        // the model numbered its steps.
        let mut reasoning: Vec<ReasoningStep> = envelope
            .chain_of_thought
            .into_iter()
            .enumerate()
            .map(|(i, step)| ReasoningStep {
                index: i as u32 + 1,
                thought: step.thought,
                confidence: step.confidence.clamp(0.0, 1.0),
            })
            .collect();
        if reasoning.is_empty() {
            reasoning.push(ReasoningStep {
                index: 1,
                thought: "Answered directly from the retrieved material".to_string(),
                confidence: 0.7,
            });
        }

        Ok((
            Draft {
                id: draft_id,
                content,
                reasoning,
                created_at: Utc::now(),
            },
            notes,
        ))
    }
}
