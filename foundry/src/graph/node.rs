//! Graph node handler: one step in a compiled graph.
//!
//! Receives the current state by reference and the request context, returns a
//! partial write set plus an optional routing hint. Handlers must not mutate
//! state in place; the executor owns the merge.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::state::{PipelineState, StateUpdate};

use super::RunContext;

/// Node kind. Exactly one `Entry` per graph; `Terminal` nodes end the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Entry,
    Process,
    Decision,
    Tool,
    Terminal,
}

/// Routing returned by a decision handler.
///
/// `Label` selects one conditional edge; `FanOut` activates several targets in
/// parallel, each on its own partial state, merged per field policy on re-join.
/// An empty fan-out falls through to the decision's catch-all edge.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    Label(String),
    FanOut(Vec<String>),
}

/// A handler's result: partial state updates and an optional routing hint.
/// The hint is consulted only on decision nodes.
#[derive(Clone, Debug, Default)]
pub struct NodeOutput {
    pub update: StateUpdate,
    pub route: Option<Route>,
}

impl NodeOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn update(update: StateUpdate) -> Self {
        Self {
            update,
            route: None,
        }
    }

    pub fn route(label: impl Into<String>) -> Self {
        Self {
            update: StateUpdate::new(),
            route: Some(Route::Label(label.into())),
        }
    }

    pub fn fan_out<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            update: StateUpdate::new(),
            route: Some(Route::FanOut(labels.into_iter().map(Into::into).collect())),
        }
    }

    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.update = update;
        self
    }
}

/// A node failure. Recorded in state, never unwound through the pipeline.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Structured form written under `worker_responses[id].error`.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "error_kind": self.kind.as_str(),
            "message": self.message,
        })
    }
}

/// One step in a graph: `(state, request-context) -> (partial updates, hint)`.
///
/// **Interaction**: bound into a [`super::GraphSpec`] node at build time; invoked
/// by [`super::CompiledGraph::invoke`] with a read-only state snapshot.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, state: &PipelineState, ctx: &RunContext) -> Result<NodeOutput, HandlerError>;
}

/// Adapter for synchronous, state-only handlers. Handy in tests and for cheap
/// decision predicates.
pub struct SyncHandler<F>(pub F)
where
    F: Fn(&PipelineState) -> Result<NodeOutput, HandlerError> + Send + Sync;

#[async_trait]
impl<F> Handler for SyncHandler<F>
where
    F: Fn(&PipelineState) -> Result<NodeOutput, HandlerError> + Send + Sync,
{
    async fn run(&self, state: &PipelineState, _ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        (self.0)(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: HandlerError serialises to the structured error shape.
    #[test]
    fn handler_error_to_value() {
        let err = HandlerError::new(ErrorKind::Timeout, "tool budget exhausted");
        let v = err.to_value();
        assert_eq!(v["error_kind"], "timeout");
        assert_eq!(v["message"], "tool budget exhausted");
    }

    /// **Scenario**: An empty fan-out is preserved (it resolves to the catch-all at runtime).
    #[test]
    fn empty_fan_out_route() {
        let out = NodeOutput::fan_out(Vec::<String>::new());
        assert_eq!(out.route, Some(Route::FanOut(vec![])));
    }
}
