//! Deliberation — bounded multi-stage deliberation over retrieved course
//! material.
//!
//! Answers a question by retrieving context, drafting an answer, critiquing
//! the draft, deciding whether to iterate, and synthesizing a final
//! response from the terminal state.
//!
//! # Flow
//!
//! ```text
//! retrieving ──→ drafting ──→ critiquing ──→ deciding
//!                   ▲                           │
//!                   └────────── iterate ────────┤
//!                                               ├─ converged ──────────┐
//!                                               ├─ abort_deadlock ─────┤
//!                                               └─ escalate_with_warn ─┤
//!                                                                      ▼
//!                                                  synthesizing ──→ done
//! ```
//!
//! The loop is bounded: the decision controller's override rules force a
//! terminal decision at or before the round cap, a convergence claim is
//! rejected while critical issues remain, and every failure path still
//! produces exactly one terminal answer event.
//!
//! External collaborators (the completion and retrieval services) sit
//! behind traits in [`service`]; [`client`] provides reqwest-backed
//! implementations for JSON-over-HTTP backends.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod critique;
pub mod decision;
pub mod draft;
pub mod error;
pub mod event;
pub mod orchestrator;
pub mod prompts;
pub mod retrieval;
pub mod service;
pub mod state;
pub mod synthesis;

// Re-export the types most callers need.
pub use checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    WorkflowCheckpoint,
};
pub use client::{HttpCompletionClient, HttpRetrievalClient};
pub use config::DeliberationConfig;
pub use critique::{CritiqueEngine, CritiqueReport, Issue, IssueKind, Severity, SeverityTally};
pub use decision::{apply_override_rules, Decision, DecisionController, DecisionKind};
pub use draft::{Draft, DraftGenerator, ReasoningStep};
pub use error::DeliberationError;
pub use event::{DeliberationEvent, StageStatus};
pub use orchestrator::{CancelHandle, Deliberation};
pub use retrieval::{
    RetrievalOrchestrator, RetrievalOutcome, RetrievalStatus, RetrievalStrategy, RetrievedPassage,
};
pub use service::{
    complete_with_retry, CompletionService, RetrievalService, RetryPolicy, ScoredPassage,
    ServiceError,
};
pub use state::{Query, WorkflowPhase, WorkflowState};
pub use synthesis::{AnswerBody, FinalAnswer, QualityIndicators, Synthesizer};
