//! Loop driver — the state machine tying retrieval, drafting, critique,
//! decision, and synthesis together.
//!
//! # Flow
//!
//! ```text
//! retrieving → drafting → critiquing → deciding ─┬─ iterate ──→ drafting
//!                                                └─ terminal ─→ synthesizing → done
//! ```
//!
//! The driver guarantees exactly one terminal event per query: either a
//! final answer or a failure event that still carries a best-effort
//! explanatory answer. Forward progress is guaranteed by the decision
//! controller's round cap; every round strictly increments the counter.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointStore, WorkflowCheckpoint};
use crate::config::DeliberationConfig;
use crate::critique::CritiqueEngine;
use crate::decision::{DecisionController, DecisionKind};
use crate::draft::DraftGenerator;
use crate::error::DeliberationError;
use crate::event::{DeliberationEvent, StageStatus};
use crate::retrieval::RetrievalOrchestrator;
use crate::service::{CompletionService, RetrievalService};
use crate::state::{Query, WorkflowPhase, WorkflowState};
use crate::synthesis::{failure_answer, Synthesizer};

/// Event channel capacity. Progress volume is bounded by the round cap.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Cancels a running query. Cancellation takes effect at the next await
/// point; state is only ever written after a stage fully completes, so an
/// abandoned in-flight call cannot corrupt it.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

/// Resolves once cancellation is requested; never resolves if the handle
/// was dropped without cancelling.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Race a stage future against cancellation.
async fn cancellable<T>(
    cancel: &mut watch::Receiver<bool>,
    fut: impl Future<Output = T>,
) -> Result<T, DeliberationError> {
    tokio::select! {
        _ = wait_cancelled(cancel) => Err(DeliberationError::Cancelled(
            "cancelled by caller".to_string(),
        )),
        value = fut => Ok(value),
    }
}

/// The deliberation engine. Cheap to clone; one cloned instance drives one
/// query at a time and owns that query's state exclusively.
#[derive(Clone)]
pub struct Deliberation {
    completion: Arc<dyn CompletionService>,
    retrieval: Arc<dyn RetrievalService>,
    config: DeliberationConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl Deliberation {
    /// Create an engine over the two backends.
    pub fn new(
        completion: Arc<dyn CompletionService>,
        retrieval: Arc<dyn RetrievalService>,
        config: DeliberationConfig,
    ) -> Self {
        Self {
            completion,
            retrieval,
            config,
            checkpoints: None,
        }
    }

    /// Write checkpoints to `store` at every state transition.
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Process a query on a background task, returning the event stream
    /// and a cancellation handle. The stream carries observational
    /// progress events and exactly one terminal event.
    pub fn process_query(
        &self,
        query: Query,
    ) -> (mpsc::Receiver<DeliberationEvent>, CancelHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(query, events_tx, cancel_rx).await;
        });
        (
            events_rx,
            CancelHandle {
                sender: Arc::new(cancel_tx),
            },
        )
    }

    /// Drive one query to completion, emitting events on `events`.
    pub async fn run(
        &self,
        query: Query,
        events: mpsc::Sender<DeliberationEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut state = WorkflowState::new(query);
        let mut sequence = 0u32;
        info!(
            session = %state.query.session_id,
            max_rounds = state.query.max_rounds,
            "deliberation started"
        );

        // ── Retrieval — runs once per query ────────────────────────────
        self.emit(&events, WorkflowPhase::Retrieving, StageStatus::Started, 0)
            .await;
        let started = Instant::now();
        let retriever = RetrievalOrchestrator::new(
            self.retrieval.clone(),
            self.completion.clone(),
            self.config.clone(),
        );
        let retrieved = cancellable(
            &mut cancel,
            retriever.run(&state.query.text, &state.query.scope_id),
        )
        .await;
        state.record_timing(WorkflowPhase::Retrieving, elapsed_ms(started));
        let outcome = match retrieved {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) | Err(err) => {
                self.fail_stage(&mut state, &events, WorkflowPhase::Retrieving, 0, err, &mut sequence)
                    .await;
                return;
            }
        };
        info!(
            strategy = %outcome.strategy,
            quality = outcome.quality_score,
            passages = outcome.passages.len(),
            "retrieval complete"
        );
        state.passages = outcome.passages.clone();
        state.retrieval = Some(outcome);
        self.emit(&events, WorkflowPhase::Retrieving, StageStatus::Completed, 0)
            .await;
        if self
            .transition(&mut state, WorkflowPhase::Drafting, "context ready", &events, &mut sequence)
            .await
            .is_err()
        {
            return;
        }

        // ── Debate loop ────────────────────────────────────────────────
        let generator = DraftGenerator::new(self.completion.clone(), self.config.clone());
        let critic = CritiqueEngine::new(self.completion.clone(), self.config.clone());
        let controller = DecisionController::new(self.completion.clone(), self.config.clone());

        loop {
            let round = state.round;
            let feedback = state.decision.as_ref().and_then(|d| d.feedback.clone());

            // Drafting
            self.emit(&events, WorkflowPhase::Drafting, StageStatus::Started, round)
                .await;
            let started = Instant::now();
            let previous = state.current_draft.clone();
            let generated = cancellable(
                &mut cancel,
                generator.generate(
                    &state.query.text,
                    state.query.domain_instruction.as_deref(),
                    &state.passages,
                    feedback.as_deref(),
                    previous.as_ref(),
                    round,
                ),
            )
            .await;
            state.record_timing(WorkflowPhase::Drafting, elapsed_ms(started));
            let draft = match generated {
                Ok(Ok((draft, notes))) => {
                    state.record_errors(notes);
                    draft
                }
                Ok(Err(err)) | Err(err) => {
                    self.fail_stage(&mut state, &events, WorkflowPhase::Drafting, round, err, &mut sequence)
                        .await;
                    return;
                }
            };
            info!(draft = %draft.id, steps = draft.reasoning.len(), round, "draft ready");
            state.set_draft(draft);
            self.emit(&events, WorkflowPhase::Drafting, StageStatus::Completed, round)
                .await;
            if self
                .transition(&mut state, WorkflowPhase::Critiquing, "draft ready", &events, &mut sequence)
                .await
                .is_err()
            {
                return;
            }

            // Critiquing
            self.emit(&events, WorkflowPhase::Critiquing, StageStatus::Started, round)
                .await;
            let started = Instant::now();
            let Some(current) = state.current_draft.clone() else {
                self.finish_failed(&mut state, &events, "draft missing after generation", &mut sequence)
                    .await;
                return;
            };
            let reviewed = cancellable(&mut cancel, critic.review(&current, &state.passages)).await;
            state.record_timing(WorkflowPhase::Critiquing, elapsed_ms(started));
            let report = match reviewed {
                Ok((report, notes)) => {
                    state.record_errors(notes);
                    report
                }
                Err(err) => {
                    self.fail_stage(&mut state, &events, WorkflowPhase::Critiquing, round, err, &mut sequence)
                        .await;
                    return;
                }
            };
            info!(
                issues = report.issues.len(),
                assessment = %report.assessment,
                round,
                "critique complete"
            );
            state.set_issues(report.issues);
            self.emit(&events, WorkflowPhase::Critiquing, StageStatus::Completed, round)
                .await;
            if self
                .transition(&mut state, WorkflowPhase::Deciding, "critique ready", &events, &mut sequence)
                .await
                .is_err()
            {
                return;
            }

            // Deciding
            self.emit(&events, WorkflowPhase::Deciding, StageStatus::Started, round)
                .await;
            let started = Instant::now();
            let decided = cancellable(
                &mut cancel,
                controller.decide(
                    &state.issues,
                    round,
                    state.query.max_rounds,
                    feedback.as_deref(),
                ),
            )
            .await;
            state.record_timing(WorkflowPhase::Deciding, elapsed_ms(started));
            let decision = match decided {
                Ok((decision, notes)) => {
                    state.record_errors(notes);
                    decision
                }
                Err(err) => {
                    self.fail_stage(&mut state, &events, WorkflowPhase::Deciding, round, err, &mut sequence)
                        .await;
                    return;
                }
            };
            info!(
                decision = %decision.kind,
                score = decision.convergence_score,
                round,
                "round decided"
            );
            let kind = decision.kind;
            state.set_decision(decision);
            self.emit(&events, WorkflowPhase::Deciding, StageStatus::Completed, round)
                .await;

            match kind {
                DecisionKind::Iterate => {
                    if self
                        .transition(&mut state, WorkflowPhase::Drafting, "iterate", &events, &mut sequence)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                terminal => {
                    if self
                        .transition(
                            &mut state,
                            WorkflowPhase::Synthesizing,
                            &terminal.to_string(),
                            &events,
                            &mut sequence,
                        )
                        .await
                        .is_err()
                    {
                        return;
                    }
                    break;
                }
            }
        }

        // ── Synthesis — runs once on the terminal state ────────────────
        let round = state.round;
        self.emit(&events, WorkflowPhase::Synthesizing, StageStatus::Started, round)
            .await;
        let started = Instant::now();
        let Some(decision) = state.decision.clone() else {
            self.finish_failed(&mut state, &events, "decision missing before synthesis", &mut sequence)
                .await;
            return;
        };
        let synthesizer = Synthesizer::new(self.completion.clone(), self.config.clone());
        let synthesized = cancellable(
            &mut cancel,
            synthesizer.synthesize(
                &state.query.text,
                state.current_draft.as_ref(),
                &state.issues,
                &decision,
                &state.passages,
                round,
            ),
        )
        .await;
        state.record_timing(WorkflowPhase::Synthesizing, elapsed_ms(started));
        let answer = match synthesized {
            Ok((answer, notes)) => {
                state.record_errors(notes);
                answer
            }
            Err(err) => {
                self.fail_stage(&mut state, &events, WorkflowPhase::Synthesizing, round, err, &mut sequence)
                    .await;
                return;
            }
        };
        state.final_answer = Some(answer.clone());
        self.emit(&events, WorkflowPhase::Synthesizing, StageStatus::Completed, round)
            .await;
        if state.transition(WorkflowPhase::Done, "answer ready").is_err() {
            // Unreachable by construction; close out defensively.
            state.record_error("could not close workflow".to_string());
        }
        self.checkpoint(&state, &mut sequence).await;
        info!(status = %state.status_line(), "deliberation complete");
        let _ = events.send(DeliberationEvent::Completed { answer }).await;
    }

    /// Record a stage failure and emit the terminal failure event.
    async fn fail_stage(
        &self,
        state: &mut WorkflowState,
        events: &mpsc::Sender<DeliberationEvent>,
        stage: WorkflowPhase,
        round: u32,
        err: DeliberationError,
        sequence: &mut u32,
    ) {
        self.emit(events, stage, StageStatus::Failed, round).await;
        self.finish_failed(state, events, &err.to_string(), sequence)
            .await;
    }

    /// Close the workflow with a failure event that still carries a
    /// best-effort explanatory answer.
    async fn finish_failed(
        &self,
        state: &mut WorkflowState,
        events: &mpsc::Sender<DeliberationEvent>,
        message: &str,
        sequence: &mut u32,
    ) {
        state.record_error(message.to_string());
        let answer = failure_answer(message);
        state.final_answer = Some(answer.clone());
        if state.phase != WorkflowPhase::Done {
            let _ = state.transition(WorkflowPhase::Done, message);
        }
        self.checkpoint(state, sequence).await;
        warn!(status = %state.status_line(), "deliberation failed");
        let _ = events
            .send(DeliberationEvent::Failed {
                message: message.to_string(),
                answer,
            })
            .await;
    }

    /// Transition the workflow, checkpointing on success. A forbidden
    /// transition is a defensive invariant breach: the workflow closes
    /// with no synthesized answer.
    async fn transition(
        &self,
        state: &mut WorkflowState,
        to: WorkflowPhase,
        reason: &str,
        events: &mpsc::Sender<DeliberationEvent>,
        sequence: &mut u32,
    ) -> Result<(), ()> {
        match state.transition(to, reason) {
            Ok(()) => {
                self.checkpoint(state, sequence).await;
                Ok(())
            }
            Err(err) => {
                let err = DeliberationError::InvalidTransition(err.to_string());
                error!("{err}");
                self.finish_failed(state, events, &err.to_string(), sequence)
                    .await;
                Err(())
            }
        }
    }

    async fn emit(
        &self,
        events: &mpsc::Sender<DeliberationEvent>,
        stage: WorkflowPhase,
        status: StageStatus,
        round: u32,
    ) {
        // Consumers may hang up early; progress is observational.
        let _ = events
            .send(DeliberationEvent::Progress {
                stage,
                status,
                round,
            })
            .await;
    }

    async fn checkpoint(&self, state: &WorkflowState, sequence: &mut u32) {
        if let Some(store) = &self.checkpoints {
            *sequence += 1;
            let checkpoint = WorkflowCheckpoint::new(state, *sequence);
            if let Err(err) = store.save(&checkpoint).await {
                warn!(error = %err, "checkpoint save failed");
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
