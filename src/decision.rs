//! Decision controller — arbiter of the debate loop.
//!
//! A model-proposed decision is advisory only. Deterministic override rules
//! run on top of it in fixed priority order, so the loop's safety and
//! liveness properties hold no matter what the model says. The rule table
//! is a pure function with no service dependency.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DeliberationConfig;
use crate::critique::{Issue, Severity, SeverityTally};
use crate::error::DeliberationError;
use crate::prompts;
use crate::service::{complete_with_retry, CompletionService};

/// Terminal or non-terminal outcome of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// The draft is acceptable; synthesize it.
    Converged,
    /// Run another draft round with feedback.
    Iterate,
    /// Max rounds exhausted without convergence.
    AbortDeadlock,
    /// Serious persistent quality concerns; surface them.
    EscalateWithWarning,
}

impl DecisionKind {
    /// Whether this decision ends the loop.
    pub fn is_terminal(self) -> bool {
        self != Self::Iterate
    }

    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_lowercase().as_str() {
            "converged" => Some(Self::Converged),
            "iterate" => Some(Self::Iterate),
            "abort_deadlock" => Some(Self::AbortDeadlock),
            "escalate_with_warning" => Some(Self::EscalateWithWarning),
            _ => None,
        }
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::Iterate => write!(f, "iterate"),
            Self::AbortDeadlock => write!(f, "abort_deadlock"),
            Self::EscalateWithWarning => write!(f, "escalate_with_warning"),
        }
    }
}

/// The controller's output for one round. Exactly one is produced per
/// round; `feedback` is present iff the kind is `Iterate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// The (post-override) outcome.
    pub kind: DecisionKind,
    /// Convergence score in `[0, 1]`.
    pub convergence_score: f64,
    /// Why this outcome was chosen.
    pub reasoning: String,
    /// Revision guidance for the next draft round.
    pub feedback: Option<String>,
}

/// Model proposal before overrides.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Proposal {
    pub kind: DecisionKind,
    pub reasoning: String,
    pub feedback: String,
    pub convergence_score: f64,
}

/// Parse the labeled proposal lines. Missing or unrecognized fields fall
/// back to a conservative `iterate` at score 0.5.
pub(crate) fn parse_proposal(response: &str) -> Proposal {
    let mut proposal = Proposal {
        kind: DecisionKind::Iterate,
        reasoning: String::new(),
        feedback: String::new(),
        convergence_score: 0.5,
    };
    for line in response.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("DECISION:") {
            if let Some(kind) = DecisionKind::parse(rest) {
                proposal.kind = kind;
            }
        } else if let Some(rest) = line.strip_prefix("REASONING:") {
            proposal.reasoning = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("FEEDBACK:") {
            let text = rest.trim();
            if text != "-" {
                proposal.feedback = text.to_string();
            }
        } else if let Some(rest) = line.strip_prefix("CONVERGENCE_SCORE:") {
            if let Ok(score) = rest.trim().parse::<f64>() {
                proposal.convergence_score = score.clamp(0.0, 1.0);
            }
        }
    }
    proposal
}

/// Deterministic override rules on top of the model's proposal. Pure and
/// independently testable.
///
/// A convergence claim with outstanding critical issues is rejected, heavy
/// critical counts escalate, a clean bill of health converges, and the
/// round cap converts any surviving `iterate` into a deadlock abort. The
/// cap binds the non-terminal outcome only: a flawless draft on the final
/// round still converges.
pub fn apply_override_rules(
    proposal: DecisionKind,
    tally: &SeverityTally,
    round: u32,
    max_rounds: u32,
    critical_escalation_threshold: u32,
) -> DecisionKind {
    let tentative = if proposal == DecisionKind::Converged && tally.critical >= 1 {
        // A convergence claim with critical issues outstanding is invalid.
        if round >= max_rounds {
            DecisionKind::EscalateWithWarning
        } else {
            DecisionKind::Iterate
        }
    } else if tally.critical >= critical_escalation_threshold {
        // Too many critical issues: surface them instead of spinning.
        DecisionKind::EscalateWithWarning
    } else if tally.critical == 0 && tally.high == 0 && tally.medium <= 1 {
        // Nothing serious left: converge.
        DecisionKind::Converged
    } else {
        proposal
    };

    // Out of rounds: another iteration cannot happen.
    if tentative == DecisionKind::Iterate && round >= max_rounds {
        return DecisionKind::AbortDeadlock;
    }
    tentative
}

/// Deterministic, prioritized revision feedback from the issue list.
/// Critical and high issues lead; medium issues only appear when nothing
/// more serious exists.
pub(crate) fn compose_feedback(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "No specific issues to address.".to_string();
    }

    let by_severity = |severity: Severity| issues.iter().filter(move |i| i.severity == severity);
    let mut sections: Vec<String> = Vec::new();

    let critical: Vec<&Issue> = by_severity(Severity::Critical).collect();
    let high: Vec<&Issue> = by_severity(Severity::High).collect();

    if !critical.is_empty() {
        sections.push("CRITICAL ISSUES (must fix):".to_string());
        for issue in critical.iter().take(3) {
            sections.push(format_feedback_line(issue));
        }
    }
    if !high.is_empty() {
        sections.push("HIGH PRIORITY ISSUES:".to_string());
        for issue in high.iter().take(3) {
            sections.push(format_feedback_line(issue));
        }
    }
    if critical.is_empty() && high.is_empty() {
        sections.push("MODERATE ISSUES:".to_string());
        for issue in by_severity(Severity::Medium).take(3) {
            sections.push(format_feedback_line(issue));
        }
    }

    sections.push("Revision guidance:".to_string());
    if issues.iter().any(|i| i.kind == crate::critique::IssueKind::LogicFlaw) {
        sections.push("- Strengthen the logical connections between reasoning steps".to_string());
    }
    if issues
        .iter()
        .any(|i| i.kind == crate::critique::IssueKind::FactContradiction)
    {
        sections.push("- Verify every factual claim against the provided material".to_string());
    }
    if issues
        .iter()
        .any(|i| i.kind == crate::critique::IssueKind::Hallucination)
    {
        sections.push("- Remove content the provided material does not support".to_string());
    }

    sections.join("\n")
}

fn format_feedback_line(issue: &Issue) -> String {
    match (issue.step_ref, &issue.claim) {
        (Some(step), _) => format!("- {} (step {})", issue.description, step),
        (None, Some(claim)) => format!("- {} (claim: {})", issue.description, claim),
        (None, None) => format!("- {}", issue.description),
    }
}

/// Convergence score for the final decision. When an override changed the
/// outcome, the model's score no longer describes it; use a deterministic
/// value derived from the tally instead.
fn convergence_score_for(kind: DecisionKind, proposal: &Proposal, tally: &SeverityTally) -> f64 {
    if kind == proposal.kind {
        return proposal.convergence_score;
    }
    match kind {
        DecisionKind::Converged => (1.0 - tally.weighted_score() / 4.0).clamp(0.0, 1.0),
        DecisionKind::Iterate => proposal.convergence_score.min(0.5),
        DecisionKind::AbortDeadlock => 0.3,
        DecisionKind::EscalateWithWarning => 0.4,
    }
}

/// Decides the loop's next step each round.
pub struct DecisionController {
    completion: Arc<dyn CompletionService>,
    config: DeliberationConfig,
}

impl DecisionController {
    /// Create a controller over the completion backend.
    pub fn new(completion: Arc<dyn CompletionService>, config: DeliberationConfig) -> Self {
        Self { completion, config }
    }

    /// Produce the round's decision. Never fails: if the proposal call
    /// errors, the controller defaults to `abort_deadlock` so the loop
    /// always terminates; the failure is returned as a log note.
    pub async fn decide(
        &self,
        issues: &[Issue],
        round: u32,
        max_rounds: u32,
        prior_feedback: Option<&str>,
    ) -> (Decision, Vec<String>) {
        let tally = SeverityTally::from_issues(issues);
        let issues_block = if issues.is_empty() {
            "No findings.".to_string()
        } else {
            issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = prompts::decision(
            tally.critical,
            tally.high,
            tally.medium,
            tally.low,
            round,
            max_rounds,
            &issues_block,
            prior_feedback.is_some(),
        );

        let mut notes: Vec<String> = Vec::new();
        let proposal =
            match complete_with_retry(self.completion.as_ref(), &prompt, &self.config.retry).await
            {
                Ok(response) => parse_proposal(&response),
                Err(err) => {
                    let failure = DeliberationError::DecisionProposalFailure(err.to_string());
                    warn!("{failure}; defaulting to abort_deadlock");
                    notes.push(failure.to_string());
                    return (
                        Decision {
                            kind: DecisionKind::AbortDeadlock,
                            convergence_score: 0.3,
                            reasoning: "decision proposal unavailable; aborting to guarantee \
                                        termination"
                                .to_string(),
                            feedback: None,
                        },
                        notes,
                    );
                }
            };

        let kind = apply_override_rules(
            proposal.kind,
            &tally,
            round,
            max_rounds,
            self.config.critical_escalation_threshold,
        );
        if kind != proposal.kind {
            info!(proposed = %proposal.kind, decided = %kind, "override rule replaced proposal");
        }

        let feedback = (kind == DecisionKind::Iterate).then(|| {
            let composed = compose_feedback(issues);
            if proposal.feedback.is_empty() {
                composed
            } else {
                format!("{}\n\n{}", composed, proposal.feedback)
            }
        });

        let reasoning = if kind == proposal.kind && !proposal.reasoning.is_empty() {
            proposal.reasoning.clone()
        } else {
            format!(
                "{} ({} critical, {} high, {} medium, {} low at round {}/{})",
                kind, tally.critical, tally.high, tally.medium, tally.low, round, max_rounds
            )
        };

        (
            Decision {
                kind,
                convergence_score: convergence_score_for(kind, &proposal, &tally),
                reasoning,
                feedback,
            },
            notes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critique::IssueKind;
    use crate::service::ServiceError;
    use async_trait::async_trait;

    fn tally(critical: u32, high: u32, medium: u32, low: u32) -> SeverityTally {
        SeverityTally {
            critical,
            high,
            medium,
            low,
        }
    }

    #[test]
    fn test_round_cap_forces_deadlock() {
        // A critical issue cannot keep the loop alive past max rounds.
        let out = apply_override_rules(DecisionKind::Iterate, &tally(1, 0, 0, 0), 2, 2, 2);
        assert_eq!(out, DecisionKind::AbortDeadlock);
    }

    #[test]
    fn test_clean_final_round_still_converges() {
        // The round cap binds iterate outcomes only; a flawless draft on
        // the last round converges instead of deadlocking.
        let out = apply_override_rules(DecisionKind::Converged, &tally(0, 0, 0, 0), 3, 3, 2);
        assert_eq!(out, DecisionKind::Converged);

        let out = apply_override_rules(DecisionKind::Iterate, &tally(0, 0, 1, 0), 1, 1, 2);
        assert_eq!(out, DecisionKind::Converged);
    }

    #[test]
    fn test_convergence_blocked_by_critical() {
        let out = apply_override_rules(DecisionKind::Converged, &tally(1, 0, 0, 0), 1, 3, 2);
        assert_eq!(out, DecisionKind::Iterate);

        // At the round cap the invalid claim escalates instead.
        let out = apply_override_rules(DecisionKind::Converged, &tally(1, 0, 0, 0), 3, 3, 2);
        assert_eq!(out, DecisionKind::EscalateWithWarning);
    }

    #[test]
    fn test_critical_count_escalates() {
        let out = apply_override_rules(DecisionKind::Iterate, &tally(2, 0, 0, 0), 1, 3, 2);
        assert_eq!(out, DecisionKind::EscalateWithWarning);
    }

    #[test]
    fn test_minor_issues_force_convergence() {
        let out = apply_override_rules(DecisionKind::Iterate, &tally(0, 0, 1, 2), 1, 3, 2);
        assert_eq!(out, DecisionKind::Converged);

        let out = apply_override_rules(DecisionKind::Iterate, &tally(0, 0, 0, 0), 1, 3, 2);
        assert_eq!(out, DecisionKind::Converged);
    }

    #[test]
    fn test_proposal_stands_when_no_rule_fires() {
        // 0 critical, 1 high, 2 medium: no rule fires, proposal kept.
        let out = apply_override_rules(DecisionKind::Iterate, &tally(0, 1, 2, 0), 1, 3, 2);
        assert_eq!(out, DecisionKind::Iterate);

        let out = apply_override_rules(DecisionKind::EscalateWithWarning, &tally(0, 1, 2, 0), 1, 3, 2);
        assert_eq!(out, DecisionKind::EscalateWithWarning);
    }

    #[test]
    fn test_converged_never_emitted_with_critical_issue() {
        // Safety invariant swept across proposals and rounds.
        for proposal in [
            DecisionKind::Converged,
            DecisionKind::Iterate,
            DecisionKind::AbortDeadlock,
            DecisionKind::EscalateWithWarning,
        ] {
            for round in 1..=3 {
                let out = apply_override_rules(proposal, &tally(1, 0, 0, 0), round, 3, 2);
                assert_ne!(out, DecisionKind::Converged, "proposal {proposal} round {round}");
            }
        }
    }

    #[test]
    fn test_iterate_then_deadlock_at_two_rounds() {
        let one_critical = tally(1, 0, 0, 0);
        assert_eq!(
            apply_override_rules(DecisionKind::Iterate, &one_critical, 1, 2, 2),
            DecisionKind::Iterate
        );
        assert_eq!(
            apply_override_rules(DecisionKind::Iterate, &one_critical, 2, 2, 2),
            DecisionKind::AbortDeadlock
        );
    }

    #[test]
    fn test_parse_proposal() {
        let response = "DECISION: converged\nREASONING: looks solid\nFEEDBACK: -\nCONVERGENCE_SCORE: 0.92";
        let proposal = parse_proposal(response);
        assert_eq!(proposal.kind, DecisionKind::Converged);
        assert_eq!(proposal.reasoning, "looks solid");
        assert!(proposal.feedback.is_empty());
        assert!((proposal.convergence_score - 0.92).abs() < 1e-9);
    }

    #[test]
    fn test_parse_proposal_defaults() {
        let proposal = parse_proposal("the model rambled instead of following the format");
        assert_eq!(proposal.kind, DecisionKind::Iterate);
        assert!((proposal.convergence_score - 0.5).abs() < 1e-9);

        let proposal = parse_proposal("DECISION: give_up\nCONVERGENCE_SCORE: 3.0");
        assert_eq!(proposal.kind, DecisionKind::Iterate);
        assert_eq!(proposal.convergence_score, 1.0);
    }

    #[test]
    fn test_compose_feedback_prioritizes_critical() {
        let issues = vec![
            Issue::new(IssueKind::Hallucination, Severity::Medium, "invented term"),
            Issue::new(IssueKind::FactContradiction, Severity::Critical, "wrong constant")
                .with_claim("range is 2^13"),
            Issue::new(IssueKind::LogicFlaw, Severity::High, "leap in step 3").at_step(3),
        ];
        let feedback = compose_feedback(&issues);
        let critical_pos = feedback.find("wrong constant").unwrap();
        let high_pos = feedback.find("leap in step 3").unwrap();
        assert!(critical_pos < high_pos);
        assert!(feedback.contains("CRITICAL ISSUES"));
        assert!(feedback.contains("(step 3)"));
        assert!(!feedback.contains("MODERATE ISSUES"));
        assert!(feedback.contains("Verify every factual claim"));
    }

    #[test]
    fn test_compose_feedback_falls_back_to_medium() {
        let issues = vec![Issue::new(
            IssueKind::LogicFlaw,
            Severity::Medium,
            "step 2 is underexplained",
        )];
        let feedback = compose_feedback(&issues);
        assert!(feedback.contains("MODERATE ISSUES"));
        assert!(feedback.contains("underexplained"));
    }

    struct FixedCompletion(String);

    #[async_trait]
    impl CompletionService for FixedCompletion {
        async fn complete(&self, _prompt: &str) -> Result<String, ServiceError> {
            Ok(self.0.clone())
        }
    }

    struct FailingCompletion;

    #[async_trait]
    impl CompletionService for FailingCompletion {
        async fn complete(&self, _prompt: &str) -> Result<String, ServiceError> {
            Err(ServiceError::InvalidRequest("rejected".into()))
        }
    }

    #[tokio::test]
    async fn test_decide_attaches_feedback_only_when_iterating() {
        let controller = DecisionController::new(
            Arc::new(FixedCompletion(
                "DECISION: iterate\nREASONING: gaps remain\nFEEDBACK: tighten step 2\nCONVERGENCE_SCORE: 0.4".into(),
            )),
            DeliberationConfig::default(),
        );
        let issues = vec![
            Issue::new(IssueKind::LogicFlaw, Severity::High, "gap"),
            Issue::new(IssueKind::LogicFlaw, Severity::Medium, "wording"),
            Issue::new(IssueKind::LogicFlaw, Severity::Medium, "wording 2"),
        ];
        let (decision, notes) = controller.decide(&issues, 1, 3, None).await;
        assert_eq!(decision.kind, DecisionKind::Iterate);
        let feedback = decision.feedback.unwrap();
        assert!(feedback.contains("HIGH PRIORITY"));
        assert!(feedback.contains("tighten step 2"));
        assert!(notes.is_empty());
    }

    #[tokio::test]
    async fn test_decide_terminal_leaves_feedback_empty() {
        let controller = DecisionController::new(
            Arc::new(FixedCompletion(
                "DECISION: converged\nREASONING: clean\nFEEDBACK: -\nCONVERGENCE_SCORE: 0.95".into(),
            )),
            DeliberationConfig::default(),
        );
        let (decision, _) = controller.decide(&[], 1, 3, None).await;
        assert_eq!(decision.kind, DecisionKind::Converged);
        assert!(decision.feedback.is_none());
    }

    #[tokio::test]
    async fn test_proposal_failure_defaults_to_deadlock() {
        let controller =
            DecisionController::new(Arc::new(FailingCompletion), DeliberationConfig::default());
        let (decision, notes) = controller.decide(&[], 1, 3, None).await;
        assert_eq!(decision.kind, DecisionKind::AbortDeadlock);
        assert!(decision.feedback.is_none());
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("decision proposal failed"));
    }
}
