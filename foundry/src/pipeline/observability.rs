//! Observability stage: structured metrics plus an aggregated trace summary.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::graph::{Handler, HandlerError, NodeOutput, RunContext};
use crate::state::{fields, PipelineState, StateUpdate};

pub struct ObservabilityHandler;

#[async_trait]
impl Handler for ObservabilityHandler {
    async fn run(&self, state: &PipelineState, ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        let trace_len = state
            .get(fields::TRACE)
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        let (workers_total, workers_failed) = state
            .get(fields::WORKER_RESPONSES)
            .and_then(Value::as_object)
            .map(|responses| {
                let failed = responses
                    .values()
                    .filter(|r| r.get("error").is_some())
                    .count();
                (responses.len(), failed)
            })
            .unwrap_or((0, 0));

        info!(
            request_id = %ctx.request_id(),
            tenant = %ctx.tenant(),
            nodes_traced = trace_len,
            workers_total,
            workers_failed,
            "pipeline run summary"
        );

        Ok(NodeOutput::update(StateUpdate::new().set(
            fields::TRACE,
            json!({
                "summary": {
                    "nodes_traced": trace_len,
                    "workers_total": workers_total,
                    "workers_failed": workers_failed,
                }
            }),
        )))
    }
}
