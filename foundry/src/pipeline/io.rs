//! Pipeline ingress and egress stages.
//!
//! `io_in` normalises channel input into the first user message; `io_out`
//! finalises the response (request id injection, degraded responses) and
//! persists the conversation draft. Draft persistence is non-fatal.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use run_event::RunEvent;

use crate::envelope::InputPart;
use crate::error::ErrorKind;
use crate::graph::{Handler, HandlerError, NodeOutput, RunContext};
use crate::state::{fields, Message, PipelineState, StateUpdate};
use crate::tool::ToolCall;

use super::stage;

/// Draft key layout: `draft:{scope}:{key}`, scope = tenant.
pub fn session_draft_key(tenant: &str, session_key: &str) -> String {
    format!("draft:{tenant}:{session_key}")
}

/// Channel-normalises the request input into `messages[0]` (role=user).
/// Audio parts are transcribed through the speech tool before entering the
/// message log.
pub struct IoInHandler;

#[async_trait]
impl Handler for IoInHandler {
    async fn run(&self, _state: &PipelineState, ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        let envelope = &ctx.envelope;
        let mut messages: Vec<Value> = Vec::new();
        for part in &envelope.input {
            let message = match part {
                InputPart::Text { text } => Message::user(text.clone()),
                InputPart::Structured { payload } => {
                    Message::new(crate::state::Role::User, payload.clone())
                }
                InputPart::AudioStream { handle } => {
                    let call = ToolCall::new(
                        envelope.request_id.as_str(),
                        &envelope.scope.tenant,
                        &envelope.actor,
                        "speech.transcribe",
                        json!({ "handle": handle }),
                    );
                    let call = match envelope.deadline {
                        Some(d) => call.with_deadline(d),
                        None => call,
                    };
                    let transcript = ctx
                        .resources
                        .tools
                        .invoke(&call, &ctx.cancel)
                        .await
                        .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;
                    let text = transcript
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Message::user(text)
                }
            };
            messages.push(message.to_value());
        }
        Ok(NodeOutput::update(
            StateUpdate::new().set(fields::MESSAGES, Value::Array(messages)),
        ))
    }
}

/// Terminal stage: guarantees `request_id` on the response, degrades on
/// coherence failure, emits the `final` run event, and saves the session draft.
pub struct IoOutHandler;

impl IoOutHandler {
    fn degraded_from_coherence(state: &PipelineState, request_id: &str) -> Option<Value> {
        let error = state
            .get(fields::WORKER_RESPONSES)?
            .get(stage::COHERENCE)?
            .get("error")?;
        Some(json!({
            "error_kind": error.get("error_kind").cloned().unwrap_or(json!(ErrorKind::Internal.as_str())),
            "message": error.get("message").cloned().unwrap_or(json!("pipeline degraded")),
            "request_id": request_id,
        }))
    }
}

#[async_trait]
impl Handler for IoOutHandler {
    async fn run(&self, state: &PipelineState, ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        let request_id = ctx.request_id().to_string();

        let mut response = match state.get(fields::FINAL_RESPONSE) {
            Some(value) if !value.is_null() => value.clone(),
            _ => Self::degraded_from_coherence(state, &request_id)
                .unwrap_or_else(|| json!({})),
        };
        if let Value::Object(map) = &mut response {
            map.entry("request_id")
                .or_insert_with(|| Value::String(request_id.clone()));
        }

        // Conversation state back to the draft store; the request succeeds even
        // if this fails.
        let key = session_draft_key(ctx.tenant(), ctx.envelope.session_key());
        let snapshot = json!({
            "messages": state.get(fields::MESSAGES).cloned().unwrap_or(json!([])),
            "context": state.get(fields::CONTEXT).cloned().unwrap_or(json!({})),
        });
        if let Err(e) = ctx
            .resources
            .sessions
            .drafts()
            .save(&key, ctx.envelope.session_key(), snapshot)
            .await
        {
            warn!(error = %e, "session draft save failed");
        }

        ctx.emit(RunEvent::Final {
            response: response.clone(),
        });
        Ok(NodeOutput::update(
            StateUpdate::new().set(fields::FINAL_RESPONSE, response),
        ))
    }
}
