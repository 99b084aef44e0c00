//! API adapter: structured JSON in, structured JSON out, no markup handling.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{Channel, Deadline, InputPart, RequestEnvelope, Scope};
use crate::state::PipelineState;

use super::final_response;

#[derive(Clone, Debug, Deserialize)]
pub struct ApiRequest {
    pub tenant: String,
    pub actor: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub input_json: Value,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ApiResponse {
    pub request_id: String,
    pub output_json: Value,
}

pub struct ApiAdapter;

impl ApiAdapter {
    pub fn ingress(request: ApiRequest) -> RequestEnvelope {
        let mut envelope = RequestEnvelope::new(
            Scope::tenant(request.tenant),
            request.actor,
            Channel::Api,
            vec![InputPart::Structured {
                payload: request.input_json,
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

    /// Passes the final response through untouched.
    pub fn egress(state: &PipelineState, request_id: &str) -> ApiResponse {
        ApiResponse {
            request_id: request_id.to_string(),
            output_json: final_response(state, request_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{fields, StateSchema, StateUpdate};
    use serde_json::json;

    /// **Scenario**: No stripping happens on the API channel; markers pass through.
    #[test]
    fn egress_preserves_markers() {
        let mut state = PipelineState::new();
        state
            .apply(
                &StateUpdate::new().set(
                    fields::FINAL_RESPONSE,
                    json!({"message": "keep [[pause:100]] these"}),
                ),
                &StateSchema::pipeline_defaults(),
            )
            .unwrap();
        let response = ApiAdapter::egress(&state, "req-1");
        assert_eq!(response.output_json["message"], "keep [[pause:100]] these");
    }

    /// **Scenario**: Structured input lands as a structured part.
    #[test]
    fn ingress_structured_part() {
        let envelope = ApiAdapter::ingress(ApiRequest {
            tenant: "acme".into(),
            actor: "u1".into(),
            session_id: None,
            input_json: json!({"intent": "create_story"}),
            deadline_ms: None,
        });
        assert_eq!(envelope.channel, Channel::Api);
        assert_eq!(
            envelope.input,
            vec![InputPart::Structured {
                payload: json!({"intent": "create_story"})
            }]
        );
    }
}
