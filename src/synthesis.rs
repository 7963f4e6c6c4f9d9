//! Answer synthesis — turns the terminal draft and issue history into the
//! final structured answer.
//!
//! The synthesis strategy follows the terminal decision: a converged debate
//! gets a full pedagogical answer, a deadlocked or escalated one gets a
//! transparent partial answer with capped confidence, and anything else
//! gets a minimal fallback. The placeholder guard from draft generation is
//! reapplied to the synthesizer's own output before it is returned.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DeliberationConfig;
use crate::critique::{format_reasoning, Issue, Severity};
use crate::decision::{Decision, DecisionKind};
use crate::draft::{contains_placeholders, Draft};
use crate::prompts;
use crate::retrieval::RetrievedPassage;
use crate::service::{complete_with_retry, CompletionService};

/// Structured answer body; the section set depends on how the debate ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum AnswerBody {
    /// Converged debate: the full pedagogical answer.
    Complete {
        introduction: String,
        step_by_step_solution: String,
        key_takeaways: String,
    },
    /// Deadlocked or escalated debate: transparent partial answer.
    Partial {
        partial_solution: String,
        areas_of_uncertainty: String,
        what_we_can_conclude: String,
        recommendations: String,
    },
    /// Nothing presentable could be produced.
    Fallback { message: String },
}

impl AnswerBody {
    /// Section names and texts in presentation order.
    pub fn sections(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::Complete {
                introduction,
                step_by_step_solution,
                key_takeaways,
            } => vec![
                ("introduction", introduction.as_str()),
                ("step_by_step_solution", step_by_step_solution.as_str()),
                ("key_takeaways", key_takeaways.as_str()),
            ],
            Self::Partial {
                partial_solution,
                areas_of_uncertainty,
                what_we_can_conclude,
                recommendations,
            } => vec![
                ("partial_solution", partial_solution.as_str()),
                ("areas_of_uncertainty", areas_of_uncertainty.as_str()),
                ("what_we_can_conclude", what_we_can_conclude.as_str()),
                ("recommendations", recommendations.as_str()),
            ],
            Self::Fallback { message } => vec![("message", message.as_str())],
        }
    }

    fn text(&self) -> String {
        self.sections()
            .iter()
            .map(|(name, body)| format!("{}: {}", name, body))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Secondary quality assessment of the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityIndicators {
    pub completeness: f64,
    pub clarity: f64,
    pub accuracy: f64,
    pub pedagogical_value: f64,
}

/// The terminal output of one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    /// Structured answer sections.
    pub body: AnswerBody,
    /// Overall confidence in `[0, 1]`.
    pub confidence_score: f64,
    /// Up to `max_sources` distinct source identifiers.
    pub sources: Vec<String>,
    /// Secondary quality assessment.
    pub quality_indicators: QualityIndicators,
}

impl FinalAnswer {
    /// Look up a section by name.
    pub fn section(&self, name: &str) -> Option<&str> {
        self.body
            .sections()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, text)| text)
    }
}

/// Best-effort explanatory answer for a query that failed fatally. The
/// caller is still owed a terminal answer, never a raw error.
pub fn failure_answer(message: &str) -> FinalAnswer {
    FinalAnswer {
        body: AnswerBody::Fallback {
            message: format!(
                "A complete solution could not be produced for this question. {}",
                message
            ),
        },
        confidence_score: 0.0,
        sources: Vec::new(),
        quality_indicators: QualityIndicators {
            completeness: 0.0,
            clarity: 0.0,
            accuracy: 0.0,
            pedagogical_value: 0.0,
        },
    }
}

/// Parse `LABEL: text` sections, where a section runs until the next known
/// label. Returns `(label, text)` pairs for the labels that were present.
pub(crate) fn parse_labeled_sections(response: &str, labels: &[&str]) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;

    for line in response.lines() {
        let trimmed = line.trim_start();
        let mut matched = false;
        for label in labels {
            if let Some(rest) = trimmed.strip_prefix(&format!("{}:", label)) {
                if let Some((name, body)) = current.take() {
                    sections.push((name, body.join("\n").trim().to_string()));
                }
                current = Some((label.to_lowercase(), vec![rest.trim().to_string()]));
                matched = true;
                break;
            }
        }
        if !matched {
            if let Some((_, body)) = current.as_mut() {
                body.push(line.to_string());
            }
        }
    }
    if let Some((name, body)) = current.take() {
        sections.push((name, body.join("\n").trim().to_string()));
    }
    sections
}

fn section_text(sections: &[(String, String)], name: &str) -> Option<String> {
    sections
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, text)| text.clone())
        .filter(|text| !text.is_empty())
}

/// Parse `METRIC: 0.XX` indicator lines; absent metrics default to 0.5.
pub(crate) fn parse_indicator_lines(response: &str) -> QualityIndicators {
    let metric = |label: &str| -> f64 {
        response
            .lines()
            .find_map(|line| {
                let line = line.trim();
                line.strip_prefix(&format!("{}:", label))
                    .and_then(|rest| rest.trim().parse::<f64>().ok())
            })
            .unwrap_or(0.5)
            .clamp(0.0, 1.0)
    };
    QualityIndicators {
        completeness: metric("COMPLETENESS"),
        clarity: metric("CLARITY"),
        accuracy: metric("ACCURACY"),
        pedagogical_value: metric("PEDAGOGICAL_VALUE"),
    }
}

/// Distinct source identifiers from the passage list, first-seen order,
/// capped at `max`.
pub(crate) fn extract_sources(passages: &[RetrievedPassage], max: usize) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for passage in passages {
        if passage.source.is_empty() {
            continue;
        }
        if !sources.contains(&passage.source) {
            sources.push(passage.source.clone());
        }
        if sources.len() >= max {
            break;
        }
    }
    sources
}

/// Deterministic indicator values used when the assessment call fails,
/// tied to the terminal decision and round count.
pub(crate) fn fallback_indicators(
    kind: DecisionKind,
    convergence: f64,
    round: u32,
) -> QualityIndicators {
    let base = convergence.clamp(0.0, 1.0);
    match kind {
        DecisionKind::Converged => QualityIndicators {
            completeness: base,
            clarity: 0.7,
            accuracy: base,
            pedagogical_value: 0.7,
        },
        _ => {
            let clarity = (0.7 - 0.05 * round.saturating_sub(1) as f64).max(0.5);
            QualityIndicators {
                completeness: base.min(0.6),
                clarity,
                accuracy: base.min(0.6),
                pedagogical_value: 0.5,
            }
        }
    }
}

fn format_issues(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "None".to_string();
    }
    issues
        .iter()
        .map(|i| format!("- [{}] {}", i.severity, i.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn deterministic_complete(draft: Option<&Draft>) -> AnswerBody {
    let (solution, takeaways) = match draft {
        Some(draft) => {
            let takeaways = draft
                .reasoning
                .iter()
                .take(3)
                .map(|s| format!("- {}", s.thought))
                .collect::<Vec<_>>()
                .join("\n");
            (
                draft.content.clone(),
                if takeaways.is_empty() {
                    "Review the solution steps above.".to_string()
                } else {
                    takeaways
                },
            )
        }
        None => (
            "No verified draft was available.".to_string(),
            "Review the solution steps above.".to_string(),
        ),
    };
    AnswerBody::Complete {
        introduction: "This answer was assembled from the course material retrieved for your \
                       question."
            .to_string(),
        step_by_step_solution: solution,
        key_takeaways: takeaways,
    }
}

fn deterministic_partial(draft: Option<&Draft>, unresolved: &[&Issue]) -> AnswerBody {
    let partial = draft
        .map(|d| d.content.clone())
        .unwrap_or_else(|| "No draft survived the review process.".to_string());
    let uncertainty = if unresolved.is_empty() {
        "The review process could not verify the answer completely.".to_string()
    } else {
        unresolved
            .iter()
            .map(|i| format!("- [{}] {}", i.severity, i.description))
            .collect::<Vec<_>>()
            .join("\n")
    };
    AnswerBody::Partial {
        partial_solution: partial,
        areas_of_uncertainty: uncertainty,
        what_we_can_conclude: "The points above reflect what the retrieved course material \
                               directly supports."
            .to_string(),
        recommendations: "Rephrase the question more specifically, or consult the cited source \
                          material directly."
            .to_string(),
    }
}

/// Produces the final answer once the loop reaches a terminal decision.
pub struct Synthesizer {
    completion: Arc<dyn CompletionService>,
    config: DeliberationConfig,
}

impl Synthesizer {
    /// Create a synthesizer over the completion backend.
    pub fn new(completion: Arc<dyn CompletionService>, config: DeliberationConfig) -> Self {
        Self { completion, config }
    }

    /// Synthesize the final answer. Never fails: service failures fall back
    /// to deterministic bodies and indicator values, with notes returned
    /// for the workflow log.
    pub async fn synthesize(
        &self,
        query_text: &str,
        draft: Option<&Draft>,
        issues: &[Issue],
        decision: &Decision,
        passages: &[RetrievedPassage],
        round: u32,
    ) -> (FinalAnswer, Vec<String>) {
        let mut notes: Vec<String> = Vec::new();

        let (mut body, confidence) = match decision.kind {
            DecisionKind::Converged => (
                self.converged_body(query_text, draft, issues, decision, &mut notes)
                    .await,
                decision.convergence_score,
            ),
            DecisionKind::AbortDeadlock | DecisionKind::EscalateWithWarning => (
                self.partial_body(query_text, draft, issues, decision, &mut notes)
                    .await,
                decision
                    .convergence_score
                    .min(self.config.capped_confidence),
            ),
            DecisionKind::Iterate => {
                // Terminal synthesis on a non-terminal decision should never
                // happen; answer minimally rather than invent content.
                notes.push("synthesizer invoked with non-terminal decision".to_string());
                (
                    AnswerBody::Fallback {
                        message: "A complete solution could not be produced for this question."
                            .to_string(),
                    },
                    0.0,
                )
            }
        };

        if body.sections().into_iter().any(|(_, text)| contains_placeholders(text)) {
            warn!("synthesized answer contained template placeholders, rebuilding deterministically");
            notes.push("synthesis output contained unresolved placeholders".to_string());
            let unresolved: Vec<&Issue> = issues
                .iter()
                .filter(|i| i.severity >= Severity::High)
                .collect();
            body = match decision.kind {
                DecisionKind::Converged => deterministic_complete(draft),
                _ => deterministic_partial(draft, &unresolved),
            };
        }

        let quality_indicators = self
            .assess_quality(&body, round, confidence, decision.kind, &mut notes)
            .await;
        let sources = extract_sources(passages, self.config.max_sources);
        debug!(sources = sources.len(), confidence, "final answer synthesized");

        (
            FinalAnswer {
                body,
                confidence_score: confidence.clamp(0.0, 1.0),
                sources,
                quality_indicators,
            },
            notes,
        )
    }

    async fn converged_body(
        &self,
        query_text: &str,
        draft: Option<&Draft>,
        issues: &[Issue],
        decision: &Decision,
        notes: &mut Vec<String>,
    ) -> AnswerBody {
        let minor: Vec<Issue> = issues
            .iter()
            .filter(|i| i.severity == Severity::Low)
            .cloned()
            .collect();
        let draft_content = draft.map(|d| d.content.as_str()).unwrap_or("");
        let reasoning = draft.map(|d| format_reasoning(&d.reasoning)).unwrap_or_default();
        let prompt = prompts::synthesis_converged(
            query_text,
            draft_content,
            &reasoning,
            &format_issues(&minor),
            decision.convergence_score,
        );

        match complete_with_retry(self.completion.as_ref(), &prompt, &self.config.retry).await {
            Ok(response) => {
                let sections = parse_labeled_sections(
                    &response,
                    &["INTRODUCTION", "STEP_BY_STEP_SOLUTION", "KEY_TAKEAWAYS"],
                );
                let solution = section_text(&sections, "step_by_step_solution")
                    .unwrap_or_else(|| response.trim().to_string());
                AnswerBody::Complete {
                    introduction: section_text(&sections, "introduction").unwrap_or_default(),
                    step_by_step_solution: solution,
                    key_takeaways: section_text(&sections, "key_takeaways").unwrap_or_default(),
                }
            }
            Err(err) => {
                warn!(error = %err, "synthesis call failed, using deterministic body");
                notes.push(format!("synthesis call failed: {}", err));
                deterministic_complete(draft)
            }
        }
    }

    async fn partial_body(
        &self,
        query_text: &str,
        draft: Option<&Draft>,
        issues: &[Issue],
        decision: &Decision,
        notes: &mut Vec<String>,
    ) -> AnswerBody {
        let unresolved: Vec<&Issue> = issues
            .iter()
            .filter(|i| i.severity >= Severity::High)
            .collect();
        let unresolved_block = if unresolved.is_empty() {
            "None recorded".to_string()
        } else {
            unresolved
                .iter()
                .map(|i| format!("- [{}] {}", i.severity, i.description))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let reason = match decision.kind {
            DecisionKind::AbortDeadlock => "Could not resolve all issues within the iteration limit",
            _ => "Quality concerns require additional review",
        };
        let prompt = prompts::synthesis_partial(
            query_text,
            draft.map(|d| d.content.as_str()).unwrap_or("No draft available"),
            &unresolved_block,
            &decision.kind.to_string(),
            reason,
        );

        match complete_with_retry(self.completion.as_ref(), &prompt, &self.config.retry).await {
            Ok(response) => {
                let sections = parse_labeled_sections(
                    &response,
                    &[
                        "PARTIAL_SOLUTION",
                        "AREAS_OF_UNCERTAINTY",
                        "WHAT_WE_CAN_CONCLUDE",
                        "RECOMMENDATIONS",
                    ],
                );
                let fallback = deterministic_partial(draft, &unresolved);
                let fallback_sections: Vec<(String, String)> = fallback
                    .sections()
                    .into_iter()
                    .map(|(n, t)| (n.to_string(), t.to_string()))
                    .collect();
                let pick = |name: &str| {
                    section_text(&sections, name)
                        .or_else(|| section_text(&fallback_sections, name))
                        .unwrap_or_default()
                };
                AnswerBody::Partial {
                    partial_solution: pick("partial_solution"),
                    areas_of_uncertainty: pick("areas_of_uncertainty"),
                    what_we_can_conclude: pick("what_we_can_conclude"),
                    recommendations: pick("recommendations"),
                }
            }
            Err(err) => {
                warn!(error = %err, "partial synthesis call failed, using deterministic body");
                notes.push(format!("synthesis call failed: {}", err));
                deterministic_partial(draft, &unresolved)
            }
        }
    }

    async fn assess_quality(
        &self,
        body: &AnswerBody,
        round: u32,
        convergence: f64,
        kind: DecisionKind,
        notes: &mut Vec<String>,
    ) -> QualityIndicators {
        let prompt = prompts::quality_indicators(&body.text(), round, convergence);
        match self.completion.complete(&prompt).await {
            Ok(response) => parse_indicator_lines(&response),
            Err(err) => {
                warn!(error = %err, "quality indicator call failed, using deterministic values");
                notes.push(format!("quality indicator call failed: {}", err));
                fallback_indicators(kind, convergence, round)
            }
        }
    }
}
