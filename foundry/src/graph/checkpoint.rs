//! Checkpointing: persist a state snapshot after each node so a run can resume.
//!
//! Snapshots are opaque blobs addressed by content hash; identical consecutive
//! states deduplicate. Off by default; the session store provides the standard
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{content_hash, PipelineState};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("storage: {0}")]
    Storage(String),
}

/// What the executor persists between nodes: the merged state, the next
/// frontier (node names), and the visit count toward the recursion limit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    pub state: Value,
    pub frontier: Vec<String>,
    pub visits: usize,
    pub content_hash: String,
}

impl CheckpointRecord {
    pub fn capture(state: &PipelineState, frontier: Vec<String>, visits: usize) -> Self {
        let state = state.to_value();
        let content_hash = content_hash(&state);
        Self {
            state,
            frontier,
            visits,
            content_hash,
        }
    }

    pub fn to_value(&self) -> Result<Value, CheckpointError> {
        serde_json::to_value(self).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, CheckpointError> {
        serde_json::from_value(value).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }
}

/// Saves and loads checkpoint records keyed by request id.
///
/// **Interaction**: passed to `CompiledGraph::invoke_checkpointed`; the session
/// store's draft side implements it.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save(&self, request_id: &str, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    async fn load(&self, request_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError>;
}
