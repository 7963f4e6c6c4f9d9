//! Progress and terminal events emitted while a query is processed.
//!
//! Progress events are purely observational: consumers must not depend on
//! their exact count or sequence, only on receiving exactly one terminal
//! event per query.

use serde::{Deserialize, Serialize};

use crate::state::WorkflowPhase;
use crate::synthesis::FinalAnswer;

/// Status of a stage within a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The stage began.
    Started,
    /// The stage finished normally.
    Completed,
    /// The stage failed (a terminal event follows).
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One item in the event stream for a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum DeliberationEvent {
    /// Observational stage update.
    Progress {
        stage: WorkflowPhase,
        status: StageStatus,
        round: u32,
    },
    /// The query finished with an answer.
    Completed { answer: FinalAnswer },
    /// The query failed; `answer` is a best-effort explanation, never a raw
    /// error.
    Failed { message: String, answer: FinalAnswer },
}

impl DeliberationEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// The final answer carried by a terminal event.
    pub fn answer(&self) -> Option<&FinalAnswer> {
        match self {
            Self::Completed { answer } | Self::Failed { answer, .. } => Some(answer),
            Self::Progress { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::failure_answer;

    #[test]
    fn test_terminal_classification() {
        let progress = DeliberationEvent::Progress {
            stage: WorkflowPhase::Retrieving,
            status: StageStatus::Started,
            round: 0,
        };
        assert!(!progress.is_terminal());
        assert!(progress.answer().is_none());

        let failed = DeliberationEvent::Failed {
            message: "retrieval down".to_string(),
            answer: failure_answer("retrieval down"),
        };
        assert!(failed.is_terminal());
        assert!(failed.answer().is_some());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = DeliberationEvent::Progress {
            stage: WorkflowPhase::Drafting,
            status: StageStatus::Completed,
            round: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"progress\""));
        assert!(json.contains("\"stage\":\"drafting\""));
        assert!(json.contains("\"status\":\"completed\""));
    }
}
