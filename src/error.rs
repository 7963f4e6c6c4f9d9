//! Error taxonomy for the deliberation engine.
//!
//! Fatal errors abort the query (the caller still receives a terminal
//! answer event); recoverable errors are absorbed where they occur and
//! appended to the workflow error log for observability.

use thiserror::Error;

use crate::service::ServiceError;

/// Errors surfaced by the deliberation loop.
#[derive(Debug, Error)]
pub enum DeliberationError {
    /// The initial retrieval call itself failed. Fatal — no draft is ever
    /// produced for this query.
    #[error("retrieval failed: {0}")]
    RetrievalFailure(ServiceError),

    /// A transient service error survived every retry attempt.
    #[error("transient service error persisted: {0}")]
    TransientService(ServiceError),

    /// The service rejected the request outright; retrying cannot help.
    #[error("permanent service error: {0}")]
    PermanentService(ServiceError),

    /// A draft envelope failed every parse stage. Recovered locally via the
    /// extractive fallback; recorded, never surfaced to the caller.
    #[error("draft envelope unparseable: {0}")]
    GenerationParseFailure(String),

    /// A critique line did not match the issue record shape and was dropped.
    #[error("critique record malformed: {0}")]
    CritiqueParseFailure(String),

    /// The decision proposal call failed; the loop defaults to a deadlock
    /// abort instead of propagating.
    #[error("decision proposal failed: {0}")]
    DecisionProposalFailure(String),

    /// The query was cancelled between rounds.
    #[error("query cancelled: {0}")]
    Cancelled(String),

    /// A phase transition that the state machine forbids. Defensive; should
    /// never fire given the decision mapping.
    #[error("invalid workflow transition: {0}")]
    InvalidTransition(String),
}

impl DeliberationError {
    /// Classify a completion-service failure after retries are exhausted.
    pub fn from_completion(err: ServiceError) -> Self {
        if err.is_transient() {
            Self::TransientService(err)
        } else {
            Self::PermanentService(err)
        }
    }

    /// Whether the error is absorbed inside the loop rather than aborting
    /// the query.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::GenerationParseFailure(_)
                | Self::CritiqueParseFailure(_)
                | Self::DecisionProposalFailure(_)
        )
    }
}
