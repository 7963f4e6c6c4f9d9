//! Workflow state machine — phases, transitions, and the per-query
//! aggregate.
//!
//! One `WorkflowState` exists per query, owned exclusively by its loop
//! driver. Every field is written atomically after a stage completes;
//! nothing is mutated mid-stage, so an abandoned in-flight call can never
//! leave the state half-updated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::critique::Issue;
use crate::decision::Decision;
use crate::draft::Draft;
use crate::retrieval::{RetrievedPassage, RetrievalOutcome};
use crate::synthesis::FinalAnswer;

/// Phase of a deliberation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    /// Gathering context for the question.
    Retrieving,
    /// Strategist is producing or revising a draft.
    Drafting,
    /// Critic is verifying the current draft.
    Critiquing,
    /// Moderator is deciding the loop's next step.
    Deciding,
    /// Reporter is producing the final answer.
    Synthesizing,
    /// Workflow finished, successfully or not.
    Done,
}

impl WorkflowPhase {
    /// Whether this is the terminal phase.
    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }

    /// Valid transitions from this phase. `Done` is reachable from every
    /// phase so a fatal failure can always close the workflow.
    pub fn valid_transitions(self) -> &'static [WorkflowPhase] {
        match self {
            Self::Retrieving => &[Self::Drafting, Self::Done],
            Self::Drafting => &[Self::Critiquing, Self::Done],
            Self::Critiquing => &[Self::Deciding, Self::Done],
            Self::Deciding => &[Self::Drafting, Self::Synthesizing, Self::Done],
            Self::Synthesizing => &[Self::Done],
            Self::Done => &[],
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retrieving => write!(f, "retrieving"),
            Self::Drafting => write!(f, "drafting"),
            Self::Critiquing => write!(f, "critiquing"),
            Self::Deciding => write!(f, "deciding"),
            Self::Synthesizing => write!(f, "synthesizing"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Immutable input for one user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// The question text.
    pub text: String,
    /// Knowledge-scope identifier (which corpus to retrieve from).
    pub scope_id: String,
    /// Session identifier for tracking and checkpoints.
    pub session_id: String,
    /// Optional domain-specific instruction prefix for draft generation.
    pub domain_instruction: Option<String>,
    /// Maximum debate rounds for this query.
    pub max_rounds: u32,
}

impl Query {
    /// Default round budget.
    pub const DEFAULT_MAX_ROUNDS: u32 = 3;

    /// Create a query with the default round budget.
    pub fn new(text: &str, scope_id: &str, session_id: &str) -> Self {
        Self {
            text: text.to_string(),
            scope_id: scope_id.to_string(),
            session_id: session_id.to_string(),
            domain_instruction: None,
            max_rounds: Self::DEFAULT_MAX_ROUNDS,
        }
    }

    /// Attach a domain instruction prefix.
    pub fn with_domain_instruction(mut self, instruction: &str) -> Self {
        self.domain_instruction = Some(instruction.to_string());
        self
    }

    /// Override the round budget (minimum 1).
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }
}

/// A recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Previous phase.
    pub from: WorkflowPhase,
    /// New phase.
    pub to: WorkflowPhase,
    /// When the transition occurred.
    pub at: DateTime<Utc>,
    /// Why it occurred.
    pub reason: String,
}

/// Error for transitions the state machine forbids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} -> {} (allowed: {:?})",
            self.from,
            self.to,
            self.from.valid_transitions()
        )
    }
}

impl std::error::Error for TransitionError {}

/// Wall-clock duration of one stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    /// Which stage ran.
    pub phase: WorkflowPhase,
    /// How long it took.
    pub millis: u64,
}

/// The aggregate root for one query's lifetime. Owned exclusively by one
/// loop driver; never shared across concurrent queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// The immutable input.
    pub query: Query,
    /// Current phase.
    pub phase: WorkflowPhase,
    /// Round counter; increments by exactly 1 on each entry into
    /// `Drafting`.
    pub round: u32,
    /// Retrieval outcome, set once after the retrieval stage.
    pub retrieval: Option<RetrievalOutcome>,
    /// Passages feeding the loop.
    pub passages: Vec<RetrievedPassage>,
    /// The draft currently under debate.
    pub current_draft: Option<Draft>,
    /// Superseded drafts, oldest first. Kept for debugging, never reused.
    pub prior_drafts: Vec<Draft>,
    /// Issues raised against the current draft this round.
    pub issues: Vec<Issue>,
    /// The latest decision.
    pub decision: Option<Decision>,
    /// Accumulated recoverable-error messages.
    pub errors: Vec<String>,
    /// The terminal answer, present once synthesis completes.
    pub final_answer: Option<FinalAnswer>,
    /// Transition history.
    pub transitions: Vec<PhaseTransition>,
    /// Per-stage wall-clock durations.
    pub timings: Vec<StageTiming>,
    /// When the workflow started.
    pub created_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state in the `Retrieving` phase.
    pub fn new(query: Query) -> Self {
        Self {
            query,
            phase: WorkflowPhase::Retrieving,
            round: 0,
            retrieval: None,
            passages: Vec::new(),
            current_draft: None,
            prior_drafts: Vec::new(),
            issues: Vec::new(),
            decision: None,
            errors: Vec::new(),
            final_answer: None,
            transitions: Vec::new(),
            timings: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Transition to a new phase, recording history. Entering `Drafting`
    /// increments the round counter.
    pub fn transition(&mut self, to: WorkflowPhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;
        if to == WorkflowPhase::Drafting {
            self.round += 1;
        }
        Ok(())
    }

    /// Install a new current draft. The previous draft moves to history and
    /// the previous round's issues and decision are discarded — each
    /// round's critique applies to that round's draft only.
    pub fn set_draft(&mut self, draft: Draft) {
        if let Some(previous) = self.current_draft.take() {
            self.prior_drafts.push(previous);
        }
        self.issues.clear();
        self.decision = None;
        self.current_draft = Some(draft);
    }

    /// Install the current round's issue list.
    pub fn set_issues(&mut self, issues: Vec<Issue>) {
        self.issues = issues;
    }

    /// Install the current round's decision.
    pub fn set_decision(&mut self, decision: Decision) {
        self.decision = Some(decision);
    }

    /// Append a recoverable-error message.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Append a batch of recoverable-error messages.
    pub fn record_errors<I: IntoIterator<Item = String>>(&mut self, messages: I) {
        self.errors.extend(messages);
    }

    /// Record how long a stage took.
    pub fn record_timing(&mut self, phase: WorkflowPhase, millis: u64) {
        self.timings.push(StageTiming { phase, millis });
    }

    /// Whether the workflow has ended.
    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Compact status line for logs.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] round {}/{} | {} issues | {} errors | session={}",
            self.phase,
            self.round,
            self.query.max_rounds,
            self.issues.len(),
            self.errors.len(),
            self.query.session_id
        )
    }
}
