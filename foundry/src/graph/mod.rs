//! State-graph executor: compile a node/edge graph, then drive a typed state
//! through it until a terminal is reached.
//!
//! Build with [`GraphSpec`] (`add_node` / `add_edge` / `add_conditional_edges`),
//! validate with `compile()`, run with [`CompiledGraph::invoke`]. Conditional
//! routing and cycles are supported; total node visits are bounded by the
//! graph's recursion limit.

mod checkpoint;
mod compile_error;
mod compiled;
mod context;
mod node;
mod spec;

pub use checkpoint::{CheckpointError, CheckpointRecord, Checkpointer};
pub use compile_error::CompilationError;
pub use compiled::{CompiledGraph, ExecError};
pub use context::RunContext;
pub use node::{Handler, HandlerError, NodeKind, NodeOutput, Route, SyncHandler};
pub use spec::{GraphSpec, NodeSpec};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One node-transition event, appended to the state's `trace` field after every
/// node completion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// `"ok"` or the error kind of the node's failure.
    pub outcome: String,
}

impl TraceEvent {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
