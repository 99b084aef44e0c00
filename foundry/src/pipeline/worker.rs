//! Worker nodes: domain-specific units the supervisor activates.
//!
//! Each worker runs concurrently against its own partial state and writes
//! under `worker_responses[worker_id]`. A worker may be a plain function, a
//! single tool call, or an entire sub-graph run through the executor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use run_event::RunEvent;

use crate::graph::{CompiledGraph, Handler, HandlerError, NodeOutput, RunContext};
use crate::state::{fields, PipelineState, StateUpdate};
use crate::tool::ToolCall;

/// One domain worker: state in, response value out.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, state: &PipelineState, ctx: &RunContext) -> Result<Value, HandlerError>;
}

/// Graph-node wrapper: routes the worker's value (or failure) under its id.
pub struct WorkerNode {
    id: String,
    worker: Arc<dyn Worker>,
}

impl WorkerNode {
    pub fn new(id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            id: id.into(),
            worker,
        }
    }
}

#[async_trait]
impl Handler for WorkerNode {
    async fn run(&self, state: &PipelineState, ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        let value = self.worker.run(state, ctx).await?;
        Ok(NodeOutput::update(StateUpdate::new().set(
            fields::WORKER_RESPONSES,
            json!({ self.id.clone(): value }),
        )))
    }
}

/// Worker that makes one tool call, deriving arguments from the state.
pub struct ToolWorker {
    tool_name: String,
    arguments: Arc<dyn Fn(&PipelineState) -> Value + Send + Sync>,
}

impl ToolWorker {
    pub fn new(
        tool_name: impl Into<String>,
        arguments: impl Fn(&PipelineState) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments: Arc::new(arguments),
        }
    }
}

#[async_trait]
impl Worker for ToolWorker {
    async fn run(&self, state: &PipelineState, ctx: &RunContext) -> Result<Value, HandlerError> {
        let arguments = (self.arguments)(state);
        let envelope = &ctx.envelope;
        let mut call = ToolCall::new(
            envelope.request_id.as_str(),
            &envelope.scope.tenant,
            &envelope.actor,
            &self.tool_name,
            arguments,
        );
        if let Some(deadline) = envelope.deadline {
            call = call.with_deadline(deadline);
        }
        ctx.emit(RunEvent::ToolInvoked {
            tool: self.tool_name.clone(),
            attempt: 1,
        });
        let result = ctx.resources.tools.invoke(&call, &ctx.cancel).await;
        ctx.emit(RunEvent::ToolReturned {
            tool: self.tool_name.clone(),
            outcome: match &result {
                Ok(_) => "ok".to_string(),
                Err(e) => e.kind().as_str().to_string(),
            },
        });
        result.map_err(|e| HandlerError::new(e.kind(), e.to_string()))
    }
}

/// Worker that runs a nested compiled graph and returns its final response.
/// The sub-run shares the request context, so deadline, cancellation, and
/// identity propagate unchanged.
pub struct SubGraphWorker {
    graph: Arc<CompiledGraph>,
}

impl SubGraphWorker {
    pub fn new(graph: Arc<CompiledGraph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Worker for SubGraphWorker {
    async fn run(&self, state: &PipelineState, ctx: &RunContext) -> Result<Value, HandlerError> {
        let final_state = self
            .graph
            .invoke(state.clone(), ctx)
            .await
            .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;
        Ok(final_state
            .get(fields::FINAL_RESPONSE)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

#[cfg(test)]
pub struct NoopWorker;

#[cfg(test)]
#[async_trait]
impl Worker for NoopWorker {
    async fn run(&self, _state: &PipelineState, _ctx: &RunContext) -> Result<Value, HandlerError> {
        Ok(Value::Null)
    }
}

/// Convenience constructor for ad-hoc function workers.
pub fn worker_fn<F>(f: F) -> Arc<dyn Worker>
where
    F: Fn(&PipelineState) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    struct FnWorker<F>(F);

    #[async_trait]
    impl<F> Worker for FnWorker<F>
    where
        F: Fn(&PipelineState) -> Result<Value, HandlerError> + Send + Sync,
    {
        async fn run(&self, state: &PipelineState, _ctx: &RunContext) -> Result<Value, HandlerError> {
            (self.0)(state)
        }
    }

    Arc::new(FnWorker(f))
}

