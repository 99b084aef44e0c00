//! Tool protocol envelope: the uniform request/response shape every tool
//! server implements.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::content_hash;

/// Request half of the envelope. `deadline_ms` is the remaining budget at
/// dispatch time; servers are expected to give up within it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolRequest {
    pub tool_name: String,
    pub arguments: Value,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    pub request_id: String,
    pub tenant: String,
}

/// Classified result of one invocation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok,
    RetriableError,
    FatalError,
    Timeout,
}

impl ToolOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolOutcome::Ok => "ok",
            ToolOutcome::RetriableError => "retriable_error",
            ToolOutcome::FatalError => "fatal_error",
            ToolOutcome::Timeout => "timeout",
        }
    }
}

/// Response half of the envelope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolResponse {
    pub outcome: ToolOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    pub fn ok(value: Value) -> Self {
        Self {
            outcome: ToolOutcome::Ok,
            value: Some(value),
            error: None,
        }
    }

    pub fn retriable(error: impl Into<String>) -> Self {
        Self {
            outcome: ToolOutcome::RetriableError,
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            outcome: ToolOutcome::FatalError,
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            outcome: ToolOutcome::Timeout,
            value: None,
            error: Some("tool timed out".into()),
        }
    }

    /// Hash of the response value for audit metadata; absent values hash as null.
    pub fn response_hash(&self) -> String {
        content_hash(self.value.as_ref().unwrap_or(&Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Outcomes serialise snake_case per the collaborator contract.
    #[test]
    fn outcome_wire_names() {
        let v = serde_json::to_value(ToolOutcome::RetriableError).unwrap();
        assert_eq!(v, "retriable_error");
        assert_eq!(ToolOutcome::FatalError.as_str(), "fatal_error");
    }

    /// **Scenario**: The envelope round-trips through JSON.
    #[test]
    fn envelope_round_trip() {
        let request = ToolRequest {
            tool_name: "tasks.create_story".into(),
            arguments: serde_json::json!({"epic": "Checkout"}),
            idempotency_key: "abc".into(),
            deadline_ms: Some(1500),
            request_id: "req-1".into(),
            tenant: "acme".into(),
        };
        let back: ToolRequest =
            serde_json::from_value(serde_json::to_value(&request).unwrap()).unwrap();
        assert_eq!(back, request);
    }
}
