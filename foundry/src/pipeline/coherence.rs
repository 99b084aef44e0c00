//! Coherence stage: fold worker responses into one final response.
//!
//! Scalar fields resolve last-writer-wins (deterministic worker-id order);
//! list fields union. Failed workers are skipped; if every required worker
//! failed, the stage fails with a worker-quorum error and `io_out` degrades.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ErrorKind;
use crate::graph::{Handler, HandlerError, NodeOutput, RunContext};
use crate::state::{fields, PipelineState, StateUpdate};

use super::pipeline_fields;

pub struct CoherenceHandler;

impl CoherenceHandler {
    fn merge_into(out: &mut Map<String, Value>, response: &Map<String, Value>) {
        for (key, value) in response {
            match (out.get_mut(key), value) {
                (Some(Value::Array(existing)), Value::Array(incoming)) => {
                    for item in incoming {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                }
                // Last writer wins on scalars and mismatched shapes.
                _ => {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

#[async_trait]
impl Handler for CoherenceHandler {
    async fn run(&self, state: &PipelineState, _ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        let empty = Map::new();
        let responses = state
            .get(fields::WORKER_RESPONSES)
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let plan = state.get(pipeline_fields::SUPERVISOR);
        let selected: Vec<String> = plan
            .and_then(|p| p.get("selected"))
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let required = plan
            .and_then(|p| p.get("required"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut merged = Map::new();
        let mut succeeded = 0usize;
        for id in &selected {
            let Some(response) = responses.get(id) else {
                continue;
            };
            if response.get("error").is_some() {
                continue;
            }
            succeeded += 1;
            match response {
                Value::Object(map) => Self::merge_into(&mut merged, map),
                other => {
                    merged.insert(id.clone(), other.clone());
                }
            }
        }

        if required && succeeded == 0 {
            return Err(HandlerError::new(
                ErrorKind::WorkerQuorumFailure,
                format!("all {} selected workers failed", selected.len()),
            ));
        }

        Ok(NodeOutput::update(
            StateUpdate::new().set(fields::FINAL_RESPONSE, Value::Object(merged)),
        ))
    }
}
