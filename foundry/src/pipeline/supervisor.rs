//! Supervisor stage: decide which workers handle this request.
//!
//! Emits the selected set as a parallel fan-out; an empty selection routes
//! straight to coherence via the catch-all edge.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::graph::{Handler, HandlerError, NodeOutput, Route, RunContext};
use crate::state::{PipelineState, StateUpdate};

use super::pipeline_fields;

/// Chooses worker ids from the state. Implementations must only return ids
/// registered with the pipeline; unknown ids fail routing at runtime.
pub trait WorkerSelector: Send + Sync {
    fn select(&self, state: &PipelineState, registered: &[String]) -> Vec<String>;
}

/// Default policy: every registered worker runs.
pub struct SelectAllWorkers;

impl WorkerSelector for SelectAllWorkers {
    fn select(&self, _state: &PipelineState, registered: &[String]) -> Vec<String> {
        registered.to_vec()
    }
}

pub struct SupervisorHandler {
    selector: Arc<dyn WorkerSelector>,
    registered: Vec<String>,
}

impl SupervisorHandler {
    pub fn new(selector: Arc<dyn WorkerSelector>, registered: Vec<String>) -> Self {
        Self {
            selector,
            registered,
        }
    }
}

#[async_trait]
impl Handler for SupervisorHandler {
    async fn run(&self, state: &PipelineState, _ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        let selected = self.selector.select(state, &self.registered);
        // A non-empty selection is a quorum requirement: coherence fails the
        // request if every selected worker dies.
        let update = StateUpdate::new().set(
            pipeline_fields::SUPERVISOR,
            json!({
                "selected": selected.clone(),
                "required": !selected.is_empty(),
            }),
        );
        Ok(NodeOutput {
            update,
            route: Some(Route::FanOut(selected)),
        })
    }
}
