//! Context stage: enrich state with session history and static defaults.
//! Read-only for messages.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::graph::{Handler, HandlerError, NodeOutput, RunContext};
use crate::state::{fields, PipelineState, StateUpdate};

use super::io::session_draft_key;

/// Merges static defaults and the prior session draft into `context`.
pub struct ContextHandler {
    defaults: Value,
}

impl ContextHandler {
    pub fn new(defaults: Value) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl Handler for ContextHandler {
    async fn run(&self, _state: &PipelineState, ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        let mut enrichment = match &self.defaults {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };

        // Session history is best-effort: a cold draft store only means an
        // empty history.
        let key = session_draft_key(ctx.tenant(), ctx.envelope.session_key());
        if let Ok(Some(draft)) = ctx.resources.sessions.drafts().load(&key).await {
            if let Some(messages) = draft.get("messages") {
                enrichment.insert("history".into(), messages.clone());
            }
            if let Some(Value::Object(prior)) = draft.get("context") {
                for (k, v) in prior {
                    enrichment.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        enrichment.insert("channel".into(), json!(ctx.envelope.channel));

        Ok(NodeOutput::update(
            StateUpdate::new().set(fields::CONTEXT, Value::Object(enrichment)),
        ))
    }
}
