//! Channel adapters: transport ↔ neutral message shape.
//!
//! An adapter builds the [`RequestEnvelope`] at ingress and serialises the
//! final state at egress. Within one request, run events are delivered in
//! executor-completion order; across requests no ordering is promised.

mod api;
mod chat;
mod markup;
mod voice;

pub use api::{ApiAdapter, ApiRequest, ApiResponse};
pub use chat::{ChatAdapter, ChatRequest, ChatResponse};
pub use markup::{strip_prosody_markers, PROSODY_MARKERS};
pub use voice::{VoiceAdapter, VoiceControl, VoiceTurn};

use serde_json::Value;

use crate::error::{ErrorKind, ErrorResponse};
use crate::state::{fields, PipelineState};

/// Pulls the final response object out of a finished state. The executor
/// guarantees `io_out` ran, so a missing value is an internal fault.
pub(crate) fn final_response(state: &PipelineState, request_id: &str) -> Value {
    match state.get(fields::FINAL_RESPONSE) {
        Some(value) if !value.is_null() => value.clone(),
        _ => serde_json::to_value(ErrorResponse::new(
            ErrorKind::Internal,
            "pipeline produced no response",
            request_id,
        ))
        .unwrap_or(Value::Null),
    }
}

/// True when the response is a degraded `{error_kind, ...}` object.
pub fn response_error_kind(response: &Value) -> Option<&str> {
    response.get("error_kind").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateSchema, StateUpdate};

    /// **Scenario**: A finished state without a final response degrades to an
    /// internal error carrying the request id.
    #[test]
    fn missing_final_response_degrades() {
        let state = PipelineState::new();
        let value = final_response(&state, "req-1");
        assert_eq!(response_error_kind(&value), Some("internal"));
        assert_eq!(value["request_id"], "req-1");
    }

    /// **Scenario**: A present final response is returned verbatim.
    #[test]
    fn present_final_response_passes_through() {
        let mut state = PipelineState::new();
        state
            .apply(
                &StateUpdate::new().set(fields::FINAL_RESPONSE, serde_json::json!({"ok": true})),
                &StateSchema::pipeline_defaults(),
            )
            .unwrap();
        let value = final_response(&state, "req-1");
        assert_eq!(value["ok"], true);
        assert_eq!(response_error_kind(&value), None);
    }
}
