//! Wire-level event types (type + payload).
//! State-carrying variants use `serde_json::Value`; the runtime serializes into that.

use serde::Serialize;
use serde_json::Value;

/// Run event: wire shape for one streamed event (type + payload).
/// The envelope (request_id, seq) is applied separately.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    NodeEntered {
        id: String,
    },
    NodeExited {
        id: String,
        outcome: String,
        duration_ms: u64,
    },
    Token {
        content: String,
    },
    ToolInvoked {
        tool: String,
        attempt: u32,
    },
    ToolReturned {
        tool: String,
        outcome: String,
    },
    GovernanceDenied {
        policy: String,
    },
    Final {
        response: Value,
    },
    ErrorEvent {
        error_kind: String,
        message: String,
    },
}

impl RunEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Tagged serialization uses snake_case type names.
    #[test]
    fn event_type_tags_are_snake_case() {
        let v = RunEvent::NodeEntered { id: "io_in".into() }.to_value().unwrap();
        assert_eq!(v["type"], "node_entered");
        let v = RunEvent::ToolReturned {
            tool: "tasks.create_story".into(),
            outcome: "ok".into(),
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "tool_returned");
        assert_eq!(v["tool"], "tasks.create_story");
    }

    /// **Scenario**: Final event carries the response value verbatim.
    #[test]
    fn final_event_carries_response() {
        let v = RunEvent::Final {
            response: serde_json::json!({"story_id": "S-1"}),
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "final");
        assert_eq!(v["response"]["story_id"], "S-1");
    }
}
