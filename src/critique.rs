//! Critique engine — three independent verification passes over a draft.
//!
//! Logic, fact, and hallucination checks run concurrently over the same
//! immutable draft and context. Each check's response is parsed line by
//! line into typed issue records; malformed lines are dropped, and a check
//! whose service call fails contributes no findings instead of failing the
//! round. The three lists are concatenated without cross-deduplication —
//! the same underlying problem may legitimately surface from more than one
//! check.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DeliberationConfig;
use crate::draft::{Draft, ReasoningStep};
use crate::error::DeliberationError;
use crate::prompts;
use crate::retrieval::{format_passages, RetrievedPassage};
use crate::service::{CompletionService, ServiceError};

/// Severity of an issue, totally ordered from `Low` to `Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Style issues, minor improvements.
    Low,
    /// Minor inconsistencies, missing details.
    Medium,
    /// Significant gaps, unsupported claims.
    High,
    /// Major factual errors, logical fallacies.
    Critical,
}

impl Severity {
    /// Parse a severity token; unrecognized values map to `None` and the
    /// caller defaults them to `Medium`.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Numeric weight on a 1-4 scale.
    pub fn weight(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Which verification pass produced an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Contradiction or unjustified leap between reasoning steps.
    LogicFlaw,
    /// Claim unsupported by, or contradicting, the retrieved context.
    FactContradiction,
    /// Content irrelevant to the query or fabricated outright.
    Hallucination,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LogicFlaw => write!(f, "logic_flaw"),
            Self::FactContradiction => write!(f, "fact_contradiction"),
            Self::Hallucination => write!(f, "hallucination"),
        }
    }
}

/// One finding against the current draft. Produced fresh each round; a
/// prior round's issues are discarded once a new draft exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Which check found it.
    pub kind: IssueKind,
    /// How bad it is.
    pub severity: Severity,
    /// What is wrong.
    pub description: String,
    /// Reasoning step index, when identifiable.
    pub step_ref: Option<u32>,
    /// Offending claim text, when identifiable.
    pub claim: Option<String>,
}

impl Issue {
    /// Create an issue with no location reference.
    pub fn new(kind: IssueKind, severity: Severity, description: &str) -> Self {
        Self {
            kind,
            severity,
            description: description.to_string(),
            step_ref: None,
            claim: None,
        }
    }

    /// Attach a reasoning step reference.
    pub fn at_step(mut self, step: u32) -> Self {
        self.step_ref = Some(step);
        self
    }

    /// Attach the offending claim text.
    pub fn with_claim(mut self, claim: &str) -> Self {
        self.claim = Some(claim.to_string());
        self
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}] {}", self.severity, self.kind, self.description)?;
        if let Some(step) = self.step_ref {
            write!(f, " (step {})", step)?;
        }
        Ok(())
    }
}

/// Issue counts per severity level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityTally {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl SeverityTally {
    /// Tally a list of issues.
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut tally = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Critical => tally.critical += 1,
                Severity::High => tally.high += 1,
                Severity::Medium => tally.medium += 1,
                Severity::Low => tally.low += 1,
            }
        }
        tally
    }

    /// Total issue count.
    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low
    }

    /// Mean severity weight on a 0-4 scale (0 when there are no issues).
    pub fn weighted_score(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let weighted = self.critical * 4 + self.high * 3 + self.medium * 2 + self.low;
        weighted as f64 / total as f64
    }
}

/// Aggregate critique for one round. The assessment and score exist for
/// telemetry only; the decision controller works from the issue list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueReport {
    /// All findings, in check order (logic, fact, hallucination).
    pub issues: Vec<Issue>,
    /// Human-readable quality label.
    pub assessment: String,
    /// Aggregate quality score in `[0, 1]`.
    pub score: f64,
}

/// Quality label from a severity tally.
pub(crate) fn overall_assessment(tally: &SeverityTally) -> &'static str {
    if tally.critical > 0 {
        "major_revisions_required"
    } else if tally.high > 2 {
        "significant_revisions_required"
    } else if tally.high > 0 || tally.total() > 3 {
        "minor_revisions_suggested"
    } else if tally.total() == 0 {
        "acceptable"
    } else {
        "acceptable_with_minor_issues"
    }
}

/// Parse one check's response into issues.
///
/// Expected record shape per line: `REF | SEVERITY | DESCRIPTION`. A lone
/// `NONE` means no findings. Lines that do not split into three fields are
/// skipped; unknown severities default to medium. The REF field becomes a
/// step reference when numeric, a claim when non-trivial text, and nothing
/// when `-`.
pub(crate) fn parse_issue_lines(response: &str, kind: IssueKind) -> (Vec<Issue>, Vec<String>) {
    let mut issues: Vec<Issue> = Vec::new();
    let mut dropped: Vec<String> = Vec::new();

    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() || line.eq_ignore_ascii_case("none") {
            continue;
        }
        let mut fields = line.splitn(3, '|');
        let (reference, severity, description) =
            match (fields.next(), fields.next(), fields.next()) {
                (Some(r), Some(s), Some(d)) => (r.trim(), s.trim(), d.trim()),
                _ => {
                    dropped.push(
                        DeliberationError::CritiqueParseFailure(format!(
                            "{} check line skipped: {:?}",
                            kind, line
                        ))
                        .to_string(),
                    );
                    continue;
                }
            };
        if description.is_empty() {
            dropped.push(
                DeliberationError::CritiqueParseFailure(format!(
                    "{} check line had empty description",
                    kind
                ))
                .to_string(),
            );
            continue;
        }

        let severity = Severity::parse(severity).unwrap_or(Severity::Medium);
        let mut issue = Issue::new(kind, severity, description);

        let step_token = reference
            .trim_start_matches("step")
            .trim_start_matches("Step")
            .trim();
        if let Ok(step) = step_token.parse::<u32>() {
            issue = issue.at_step(step);
        } else if !reference.is_empty() && reference != "-" {
            issue = issue.with_claim(reference);
        }

        issues.push(issue);
    }

    (issues, dropped)
}

/// Format a reasoning trace for the logic-check prompt.
pub(crate) fn format_reasoning(steps: &[ReasoningStep]) -> String {
    if steps.is_empty() {
        return "Direct solution provided (no explicit reasoning trace).".to_string();
    }
    steps
        .iter()
        .map(|s| format!("Step {}: {}", s.index, s.thought))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs the three verification passes for one round.
pub struct CritiqueEngine {
    completion: Arc<dyn CompletionService>,
    config: DeliberationConfig,
}

impl CritiqueEngine {
    /// Create an engine over the completion backend.
    pub fn new(completion: Arc<dyn CompletionService>, config: DeliberationConfig) -> Self {
        Self { completion, config }
    }

    /// Review the current draft. Never fails: a check whose call errors
    /// contributes no findings, and the error text is returned as a note
    /// for the workflow log.
    pub async fn review(
        &self,
        draft: &Draft,
        passages: &[RetrievedPassage],
    ) -> (CritiqueReport, Vec<String>) {
        let context = format_passages(passages, self.config.context_top_k);
        let reasoning = format_reasoning(&draft.reasoning);

        let (logic, fact, hallucination) = tokio::join!(
            self.run_check(
                IssueKind::LogicFlaw,
                prompts::logic_check(&reasoning, &draft.content),
            ),
            self.run_check(
                IssueKind::FactContradiction,
                prompts::fact_check(&draft.content, &context),
            ),
            self.run_check(
                IssueKind::Hallucination,
                prompts::hallucination_check(&draft.content, &context),
            ),
        );

        let mut issues: Vec<Issue> = Vec::new();
        let mut notes: Vec<String> = Vec::new();
        for (found, dropped) in [logic, fact, hallucination] {
            issues.extend(found);
            notes.extend(dropped);
        }

        let tally = SeverityTally::from_issues(&issues);
        let report = CritiqueReport {
            assessment: overall_assessment(&tally).to_string(),
            score: (1.0 - tally.weighted_score() / 4.0).clamp(0.0, 1.0),
            issues,
        };
        debug!(
            total = report.issues.len(),
            assessment = %report.assessment,
            "critique round complete"
        );
        (report, notes)
    }

    async fn run_check(&self, kind: IssueKind, prompt: String) -> (Vec<Issue>, Vec<String>) {
        match self.completion.complete(&prompt).await {
            Ok(response) => parse_issue_lines(&response, kind),
            Err(err) => {
                warn!(check = %kind, error = %err, "verification check unavailable, no findings");
                (Vec::new(), vec![check_failure_note(kind, &err)])
            }
        }
    }
}

fn check_failure_note(kind: IssueKind, err: &ServiceError) -> String {
    format!("{} check skipped: {}", kind, err)
}
