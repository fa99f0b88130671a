//! Checkpoint persistence.
//!
//! One live state record per execution id; every checkpoint is an upsert
//! replacing the previous one. Store failures are fatal infrastructure
//! errors: the run aborts and nothing falls back to error-edge routing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;

use crate::capability::Usage;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state serialization error: {0}")]
    Serialization(String),
    #[error("state storage error: {0}")]
    Storage(String),
    #[error("checkpoint corrupted for execution '{execution_id}': {reason}")]
    Corrupted {
        execution_id: String,
        reason: String,
    },
}

/// Status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// The persisted checkpoint of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    /// Last node that completed (or was being dispatched when the run ended).
    pub current_node: Option<String>,
    /// Context snapshot, node id -> output, plus the reserved input slot.
    pub context: BTreeMap<String, Value>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upsert: replaces any prior checkpoint for the execution id.
    async fn put(&self, state: &ExecutionState) -> Result<(), StateError>;

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionState>, StateError>;
}

/// In-memory store, suitable for tests and embedded use.
#[derive(Default)]
pub struct MemoryStateStore {
    data: RwLock<HashMap<String, ExecutionState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, state: &ExecutionState) -> Result<(), StateError> {
        self.data
            .write()
            .await
            .insert(state.execution_id.clone(), state.clone());
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionState>, StateError> {
        Ok(self.data.read().await.get(execution_id).cloned())
    }
}

/// Sled-backed store. Checkpoints are zstd-compressed JSON keyed by
/// execution id, so independent executions never contend on a key.
pub struct SledStateStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let db = sled::open(path).map_err(|e| StateError::Storage(e.to_string()))?;
        let tree = db
            .open_tree("executions")
            .map_err(|e| StateError::Storage(e.to_string()))?;
        Ok(Self { _db: db, tree })
    }
}

#[async_trait]
impl StateStore for SledStateStore {
    async fn put(&self, state: &ExecutionState) -> Result<(), StateError> {
        let serialized = serde_json::to_vec(state)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let compressed = zstd::encode_all(&serialized[..], 3)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        self.tree
            .insert(state.execution_id.as_bytes(), compressed)
            .map_err(|e| StateError::Storage(e.to_string()))?;
        self.tree
            .flush_async()
            .await
            .map_err(|e| StateError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionState>, StateError> {
        let bytes = match self
            .tree
            .get(execution_id.as_bytes())
            .map_err(|e| StateError::Storage(e.to_string()))?
        {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let decompressed = zstd::decode_all(&bytes[..]).map_err(|e| StateError::Corrupted {
            execution_id: execution_id.to_string(),
            reason: e.to_string(),
        })?;
        let state = serde_json::from_slice(&decompressed).map_err(|e| StateError::Corrupted {
            execution_id: execution_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(execution_id: &str) -> ExecutionState {
        let mut context = BTreeMap::new();
        context.insert("input".to_string(), json!({"q": "hello"}));
        context.insert("n1".to_string(), json!({"answer": 42}));
        ExecutionState {
            execution_id: execution_id.to_string(),
            workflow_id: "wf-1".to_string(),
            current_node: Some("n1".to_string()),
            context,
            status: RunStatus::Running,
            error: None,
            usage: Usage::default(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_store_upserts() {
        let store = MemoryStateStore::new();
        let mut state = sample("exec-1");

        store.put(&state).await.unwrap();
        state.current_node = Some("n2".to_string());
        state.status = RunStatus::Completed;
        store.put(&state).await.unwrap();

        let loaded = store.get("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.current_node.as_deref(), Some("n2"));
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(store.get("exec-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sled_store_round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        {
            let store = SledStateStore::open(&path).unwrap();
            store.put(&sample("exec-1")).await.unwrap();
        }

        let store = SledStateStore::open(&path).unwrap();
        let loaded = store.get("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "wf-1");
        assert_eq!(loaded.context["n1"], json!({"answer": 42}));
        assert!(store.get("missing").await.unwrap().is_none());
    }
}
