//! Workflow checkpointing — keyed snapshots written at state transitions.
//!
//! The loop driver optionally writes a checkpoint whenever the workflow
//! changes phase, keyed by session id. The store lives outside the core
//! loop; the engine only ever writes whole snapshots, so a resume sees a
//! state that was valid at some transition boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::state::WorkflowState;

/// A complete workflow snapshot for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// Session the snapshot belongs to.
    pub session_id: String,
    /// Monotonic sequence number within the session.
    pub sequence: u32,
    /// The state at checkpoint time.
    pub state: WorkflowState,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Snapshot the given state.
    pub fn new(state: &WorkflowState, sequence: u32) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            session_id: state.query.session_id.clone(),
            sequence,
            state: state.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string_pretty(self).map_err(|e| CheckpointError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON, rejecting snapshots from a newer schema.
    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        let checkpoint: Self =
            serde_json::from_str(json).map_err(|e| CheckpointError::Deserialize(e.to_string()))?;
        if checkpoint.version > Self::CURRENT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: checkpoint.version,
            });
        }
        Ok(checkpoint)
    }
}

/// Error during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint serialize failed: {0}")]
    Serialize(String),

    #[error("checkpoint deserialize failed: {0}")]
    Deserialize(String),

    #[error("checkpoint version mismatch: expected <= {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keyed checkpoint storage (session id -> latest snapshot).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot, replacing any previous one for the session.
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), CheckpointError>;

    /// Load the latest snapshot for a session, if any.
    async fn load(&self, session_id: &str) -> Result<Option<WorkflowCheckpoint>, CheckpointError>;
}

/// In-memory store, useful for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, WorkflowCheckpoint>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in an `Arc` for sharing with the loop driver.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), CheckpointError> {
        self.entries
            .lock()
            .await
            .insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        Ok(self.entries.lock().await.get(session_id).cloned())
    }
}

/// File-backed store: one JSON file per session under a directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`. The directory is created on first
    /// save if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Session ids come from callers; keep the filename inert.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = checkpoint.to_json()?;
        tokio::fs::write(self.path_for(&checkpoint.session_id), json).await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        let path = self.path_for(session_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(WorkflowCheckpoint::from_json(&json)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Query;

    fn state() -> WorkflowState {
        WorkflowState::new(Query::new("q", "scope", "session-42"))
    }

    #[test]
    fn test_checkpoint_json_roundtrip() {
        let checkpoint = WorkflowCheckpoint::new(&state(), 3);
        let json = checkpoint.to_json().unwrap();
        let parsed = WorkflowCheckpoint::from_json(&json).unwrap();
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.session_id, "session-42");
        assert_eq!(parsed.version, WorkflowCheckpoint::CURRENT_VERSION);
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut checkpoint = WorkflowCheckpoint::new(&state(), 1);
        checkpoint.version = WorkflowCheckpoint::CURRENT_VERSION + 1;
        let json = checkpoint.to_json().unwrap();
        let err = WorkflowCheckpoint::from_json(&json).unwrap_err();
        assert!(matches!(err, CheckpointError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("session-42").await.unwrap().is_none());

        store.save(&WorkflowCheckpoint::new(&state(), 1)).await.unwrap();
        store.save(&WorkflowCheckpoint::new(&state(), 2)).await.unwrap();

        let loaded = store.load("session-42").await.unwrap().unwrap();
        assert_eq!(loaded.sequence, 2);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        store.save(&WorkflowCheckpoint::new(&state(), 7)).await.unwrap();
        let loaded = store.load("session-42").await.unwrap().unwrap();
        assert_eq!(loaded.sequence, 7);

        assert!(store.load("other-session").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_session_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut st = state();
        st.query.session_id = "../escape/attempt".to_string();

        store.save(&WorkflowCheckpoint::new(&st, 1)).await.unwrap();
        let loaded = store.load("../escape/attempt").await.unwrap().unwrap();
        assert_eq!(loaded.sequence, 1);
        // Nothing was written outside the store directory.
        assert!(dir.path().join("___escape_attempt.json").exists());
    }
}
