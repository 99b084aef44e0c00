//! Chat adapter: text in, Markdown-safe text out, token streaming off run
//! events.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use run_event::{to_json, EnvelopeState, RunEvent};

use crate::envelope::{Channel, Deadline, InputPart, RequestEnvelope, Scope};
use crate::state::PipelineState;

use super::markup::strip_prosody_markers;
use super::{final_response, response_error_kind};

/// Transport shape of one chat request.
#[derive(Clone, Debug, Deserialize)]
pub struct ChatRequest {
    pub tenant: String,
    pub actor: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub input_text: String,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

/// Transport shape of one chat response.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ChatResponse {
    pub request_id: String,
    pub output_markdown: String,
    pub artifacts: Vec<Value>,
}

pub struct ChatAdapter;

impl ChatAdapter {
    /// Builds the neutral envelope. The request id is assigned here, at
    /// transport ingress.
    pub fn ingress(request: ChatRequest) -> RequestEnvelope {
        let mut envelope = RequestEnvelope::new(
            Scope::tenant(request.tenant),
            request.actor,
            Channel::Chat,
            vec![InputPart::Text {
                text: request.input_text,
            }],
        );
        if let Some(session_id) = request.session_id {
            envelope = envelope.with_session_id(session_id);
        }
        if let Some(ms) = request.deadline_ms {
            envelope = envelope.with_deadline(Deadline::in_duration(Duration::from_millis(ms)));
        }
        envelope
    }

    /// Serialises the finished state. Prosody markers (ours and foreign) are
    /// stripped for text display.
    pub fn egress(state: &PipelineState, request_id: &str) -> ChatResponse {
        let response = final_response(state, request_id);
        let output_markdown = if let Some(kind) = response_error_kind(&response) {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            format!("**{kind}**: {message} (request `{request_id}`)")
        } else {
            let text = response
                .get("message")
                .or_else(|| response.get("markdown"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    serde_json::to_string_pretty(&response)
                        .map(|s| format!("```json\n{s}\n```"))
                        .unwrap_or_default()
                });
            strip_prosody_markers(&text)
        };
        let artifacts = response
            .get("artifacts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        ChatResponse {
            request_id: request_id.to_string(),
            output_markdown,
            artifacts,
        }
    }

    /// Serialises one run event into a stream frame, envelope applied. Token
    /// contents are stripped like final output.
    pub fn frame(event: &RunEvent, envelope: &mut EnvelopeState) -> Option<Value> {
        let event = match event {
            RunEvent::Token { content } => RunEvent::Token {
                content: strip_prosody_markers(content),
            },
            other => other.clone(),
        };
        to_json(&event, envelope).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{fields, StateSchema, StateUpdate};
    use serde_json::json;

    fn state_with_response(value: Value) -> PipelineState {
        let mut state = PipelineState::new();
        state
            .apply(
                &StateUpdate::new().set(fields::FINAL_RESPONSE, value),
                &StateSchema::pipeline_defaults(),
            )
            .unwrap();
        state
    }

    /// **Scenario**: Message text is stripped of prosody markers on egress.
    #[test]
    fn egress_strips_markers() {
        let state = state_with_response(json!({"message": "Done[[pause:200]]!"}));
        let response = ChatAdapter::egress(&state, "req-1");
        assert_eq!(response.output_markdown, "Done!");
        assert_eq!(response.request_id, "req-1");
    }

    /// **Scenario**: Structured responses render as fenced JSON.
    #[test]
    fn egress_fences_structured_output() {
        let state = state_with_response(json!({"story_id": "S-1", "url": "https://x"}));
        let response = ChatAdapter::egress(&state, "req-1");
        assert!(response.output_markdown.starts_with("```json"));
        assert!(response.output_markdown.contains("S-1"));
    }

    /// **Scenario**: Degraded responses render the error kind and request id.
    #[test]
    fn egress_renders_errors() {
        let state = state_with_response(json!({
            "error_kind": "policy_violation",
            "message": "request not permitted",
        }));
        let response = ChatAdapter::egress(&state, "req-9");
        assert!(response.output_markdown.contains("policy_violation"));
        assert!(response.output_markdown.contains("req-9"));
    }

    /// **Scenario**: Ingress assigns a request id and carries the session id.
    #[test]
    fn ingress_builds_envelope() {
        let envelope = ChatAdapter::ingress(ChatRequest {
            tenant: "acme".into(),
            actor: "u1".into(),
            session_id: Some("sess-1".into()),
            input_text: "hello".into(),
            deadline_ms: Some(2000),
        });
        assert_eq!(envelope.channel, Channel::Chat);
        assert_eq!(envelope.session_key(), "sess-1");
        assert!(envelope.deadline.is_some());
        assert!(!envelope.request_id.as_str().is_empty());
    }
}
