//! Mocked deliberation integration tests — exercise the full loop with
//! deterministic services (no network, no real models).
//!
//! Covers: loop liveness, the critical-issue safety invariant, round-cap
//! deadlock, decision-proposal outage, cancellation, and the terminal-event
//! guarantee on fatal failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use deliberation::{
    CompletionService, Deliberation, DeliberationConfig, DeliberationEvent, Query,
    RetrievalService, ScoredPassage, ServiceError, StageStatus, WorkflowPhase,
};

/// Completion mock that routes on distinctive prompt markers. The logic
/// check returns `logic_finding`; the other checks report nothing.
struct ScriptedCompletion {
    logic_finding: String,
    decision_response: String,
    fail_decisions: bool,
    draft_delay: Duration,
}

impl ScriptedCompletion {
    fn clean() -> Self {
        Self {
            logic_finding: "NONE".to_string(),
            decision_response:
                "DECISION: converged\nREASONING: clean\nFEEDBACK: -\nCONVERGENCE_SCORE: 0.9"
                    .to_string(),
            fail_decisions: false,
            draft_delay: Duration::ZERO,
        }
    }

    fn always_critical() -> Self {
        Self {
            logic_finding: "step 1 | critical | conclusion contradicts the premise".to_string(),
            decision_response:
                "DECISION: iterate\nREASONING: critical flaw remains\nFEEDBACK: fix the contradiction\nCONVERGENCE_SCORE: 0.2"
                    .to_string(),
            fail_decisions: false,
            draft_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError> {
        if prompt.contains("quality assessor") {
            return Ok("SCORE: 0.90 | REASON: on-topic".into());
        }
        if prompt.contains("reformulating") {
            return Ok("QUERY: rephrased question one\nQUERY: rephrased question two".into());
        }
        if prompt.contains("REF | SEVERITY | DESCRIPTION") {
            if prompt.contains("academic critic") {
                return Ok(self.logic_finding.clone());
            }
            return Ok("NONE".into());
        }
        if prompt.contains("DECISION:") {
            if self.fail_decisions {
                return Err(ServiceError::Unavailable("moderator backend down".into()));
            }
            return Ok(self.decision_response.clone());
        }
        if prompt.contains("COMPLETENESS:") {
            return Ok(
                "COMPLETENESS: 0.9\nCLARITY: 0.8\nACCURACY: 0.9\nPEDAGOGICAL_VALUE: 0.8".into(),
            );
        }
        if prompt.contains("INTRODUCTION:") {
            return Ok("INTRODUCTION: A brief look at the question\nSTEP_BY_STEP_SOLUTION: 1. start from the definition\n2. apply it\nKEY_TAKEAWAYS: remember the definition".into());
        }
        if prompt.contains("PARTIAL_SOLUTION:") {
            return Ok("PARTIAL_SOLUTION: what we verified\nAREAS_OF_UNCERTAINTY: the contradiction\nWHAT_WE_CAN_CONCLUDE: the method holds\nRECOMMENDATIONS: ask a narrower question".into());
        }
        // Draft / refinement envelope.
        if !self.draft_delay.is_zero() {
            tokio::time::sleep(self.draft_delay).await;
        }
        Ok(r#"{"draft_content": "Backpropagation applies the chain rule backwards through the network.", "chain_of_thought": [{"step": 1, "thought": "start from the loss", "confidence": 0.9}, {"step": 2, "thought": "propagate gradients layer by layer", "confidence": 0.85}]}"#.into())
    }
}

struct ScriptedRetrieval {
    passages: Vec<ScoredPassage>,
    fail: bool,
}

impl ScriptedRetrieval {
    fn backprop_course() -> Self {
        let passage = |content: &str, score: f64, source: &str| {
            let mut metadata = HashMap::new();
            metadata.insert("source".to_string(), source.to_string());
            ScoredPassage {
                content: content.to_string(),
                score,
                metadata,
            }
        };
        Self {
            passages: vec![
                passage(
                    "Backpropagation computes gradients via the chain rule.",
                    0.9,
                    "lecture-12.pdf",
                ),
                passage(
                    "Each layer's gradient depends on the downstream error.",
                    0.85,
                    "lecture-12.pdf",
                ),
                passage("Gradient descent uses these gradients.", 0.6, "lecture-13.pdf"),
            ],
            fail: false,
        }
    }

    fn empty() -> Self {
        Self {
            passages: vec![],
            fail: false,
        }
    }

    fn down() -> Self {
        Self {
            passages: vec![],
            fail: true,
        }
    }
}

#[async_trait]
impl RetrievalService for ScriptedRetrieval {
    async fn retrieve(
        &self,
        _query: &str,
        _scope_id: &str,
    ) -> Result<Vec<ScoredPassage>, ServiceError> {
        if self.fail {
            return Err(ServiceError::Unavailable("vector index offline".into()));
        }
        Ok(self.passages.clone())
    }
}

fn engine(completion: ScriptedCompletion, retrieval: ScriptedRetrieval) -> Deliberation {
    Deliberation::new(
        Arc::new(completion),
        Arc::new(retrieval),
        DeliberationConfig::default(),
    )
}

async fn collect(mut rx: mpsc::Receiver<DeliberationEvent>) -> Vec<DeliberationEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn terminal(events: &[DeliberationEvent]) -> &DeliberationEvent {
    let terminals: Vec<&DeliberationEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1, "expected exactly one terminal event");
    assert!(
        events.last().unwrap().is_terminal(),
        "terminal event must close the stream"
    );
    terminals[0]
}

fn drafting_rounds(events: &[DeliberationEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                DeliberationEvent::Progress {
                    stage: WorkflowPhase::Drafting,
                    status: StageStatus::Started,
                    ..
                }
            )
        })
        .count()
}

// ── Converged round 1 (the backpropagation scenario) ────────────────

#[tokio::test]
async fn test_zero_issue_query_converges_on_round_one() {
    let engine = engine(ScriptedCompletion::clean(), ScriptedRetrieval::backprop_course());
    let query = Query::new("What is backpropagation?", "course-101", "s-1");
    let (rx, _handle) = engine.process_query(query);
    let events = collect(rx).await;

    assert_eq!(drafting_rounds(&events), 1);
    let answer = match terminal(&events) {
        DeliberationEvent::Completed { answer } => answer,
        other => panic!("expected completion, got {:?}", other),
    };
    let solution = answer.section("step_by_step_solution").unwrap();
    assert!(solution.contains("definition"));
    assert!(answer.sources.len() <= 3);
    assert_eq!(answer.sources, vec!["lecture-12.pdf", "lecture-13.pdf"]);
    assert!(answer.confidence_score > 0.8);
}

#[tokio::test]
async fn test_zero_issues_with_single_round_budget_converges() {
    // Even a proposal of "iterate" cannot stop convergence when nothing is
    // wrong: the minor-issue override forces `converged` on round 1.
    let completion = ScriptedCompletion {
        decision_response:
            "DECISION: iterate\nREASONING: be thorough\nFEEDBACK: polish\nCONVERGENCE_SCORE: 0.5"
                .to_string(),
        ..ScriptedCompletion::clean()
    };
    let engine = engine(completion, ScriptedRetrieval::backprop_course());
    let query = Query::new("What is backpropagation?", "course-101", "s-2").with_max_rounds(1);
    let (rx, _handle) = engine.process_query(query);
    let events = collect(rx).await;

    assert_eq!(drafting_rounds(&events), 1);
    let answer = terminal(&events).answer().unwrap();
    assert!(answer.section("step_by_step_solution").is_some());
}

// ── Safety: critical issues never converge ──────────────────────────

#[tokio::test]
async fn test_critical_issue_iterates_then_deadlocks_at_round_cap() {
    let engine = engine(
        ScriptedCompletion::always_critical(),
        ScriptedRetrieval::backprop_course(),
    );
    let query = Query::new("What is backpropagation?", "course-101", "s-3").with_max_rounds(2);
    let (rx, _handle) = engine.process_query(query);
    let events = collect(rx).await;

    // Round 1 iterates (convergence claim overridden), round 2 hits the cap.
    assert_eq!(drafting_rounds(&events), 2);
    let answer = match terminal(&events) {
        DeliberationEvent::Completed { answer } => answer,
        other => panic!("expected completion, got {:?}", other),
    };
    // Deadlock synthesis: partial sections, capped confidence.
    assert!(answer.section("areas_of_uncertainty").is_some());
    assert!(answer.section("step_by_step_solution").is_none());
    assert!(answer.confidence_score <= 0.7);
}

#[tokio::test]
async fn test_loop_terminates_within_round_budget() {
    let engine = engine(
        ScriptedCompletion::always_critical(),
        ScriptedRetrieval::backprop_course(),
    );
    let query = Query::new("q", "course-101", "s-4").with_max_rounds(3);
    let (rx, _handle) = engine.process_query(query);
    let events = collect(rx).await;

    assert_eq!(drafting_rounds(&events), 3);
    assert!(terminal(&events).answer().is_some());
}

#[tokio::test]
async fn test_converged_claim_with_critical_issue_is_never_honored() {
    // The proposal claims convergence every round while a critical issue
    // stands; the override rules must refuse it to the end.
    let completion = ScriptedCompletion {
        logic_finding: "step 1 | critical | conclusion contradicts the premise".to_string(),
        decision_response:
            "DECISION: converged\nREASONING: ship it\nFEEDBACK: -\nCONVERGENCE_SCORE: 0.95"
                .to_string(),
        ..ScriptedCompletion::clean()
    };
    let engine = engine(completion, ScriptedRetrieval::backprop_course());
    let query = Query::new("q", "course-101", "s-9").with_max_rounds(3);
    let (rx, _handle) = engine.process_query(query);
    let events = collect(rx).await;

    assert_eq!(drafting_rounds(&events), 3);
    let answer = terminal(&events).answer().unwrap();
    assert!(answer.section("step_by_step_solution").is_none());
    assert!(answer.section("partial_solution").is_some());
    assert!(answer.confidence_score <= 0.7);
}

// ── Partial-failure handling ────────────────────────────────────────

#[tokio::test]
async fn test_decision_outage_defaults_to_deadlock_answer() {
    let completion = ScriptedCompletion {
        fail_decisions: true,
        ..ScriptedCompletion::clean()
    };
    let engine = engine(completion, ScriptedRetrieval::backprop_course());
    let query = Query::new("q", "course-101", "s-5");
    let (rx, _handle) = engine.process_query(query);
    let events = collect(rx).await;

    // The proposal outage is absorbed: the loop still completes with a
    // partial (deadlock-mode) answer rather than failing.
    assert_eq!(drafting_rounds(&events), 1);
    let answer = match terminal(&events) {
        DeliberationEvent::Completed { answer } => answer,
        other => panic!("expected completion, got {:?}", other),
    };
    assert!(answer.section("partial_solution").is_some());
    assert!(answer.confidence_score <= 0.7);
}

#[tokio::test]
async fn test_empty_corpus_still_yields_terminal_answer() {
    let engine = engine(ScriptedCompletion::clean(), ScriptedRetrieval::empty());
    let query = Query::new("q", "course-101", "s-6");
    let (rx, _handle) = engine.process_query(query);
    let events = collect(rx).await;

    let answer = terminal(&events).answer().unwrap();
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn test_retrieval_outage_yields_explanatory_failure_event() {
    let engine = engine(ScriptedCompletion::clean(), ScriptedRetrieval::down());
    let query = Query::new("q", "course-101", "s-7");
    let (rx, _handle) = engine.process_query(query);
    let events = collect(rx).await;

    match terminal(&events) {
        DeliberationEvent::Failed { message, answer } => {
            assert!(message.contains("retrieval failed"));
            assert_eq!(answer.confidence_score, 0.0);
            assert!(answer
                .section("message")
                .unwrap()
                .contains("could not be produced"));
        }
        other => panic!("expected failure event, got {:?}", other),
    }
    // No drafting ever started.
    assert_eq!(drafting_rounds(&events), 0);
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancellation_mid_draft_yields_failure_event() {
    let completion = ScriptedCompletion {
        draft_delay: Duration::from_secs(5),
        ..ScriptedCompletion::clean()
    };
    let engine = engine(completion, ScriptedRetrieval::backprop_course());
    let query = Query::new("q", "course-101", "s-8");
    let (rx, handle) = engine.process_query(query);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });

    let events = collect(rx).await;
    match terminal(&events) {
        DeliberationEvent::Failed { message, .. } => {
            assert!(message.contains("cancelled"));
        }
        other => panic!("expected failure event, got {:?}", other),
    }
}
