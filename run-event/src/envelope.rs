//! Envelope (request_id, seq) injected into each serialized frame.
//! EnvelopeState hands out monotonically increasing sequence numbers per request.

use crate::event::RunEvent;
use serde_json::Value;

/// Envelope fields carried on every frame of a run stream.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    /// Request ID; constant for every frame of one run.
    pub request_id: Option<String>,
    /// Per-frame sequence number; monotonically increasing within a stream.
    pub seq: Option<u64>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Merges envelope fields into the given JSON object (top-level only).
    /// Does not overwrite existing keys.
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(ref id) = self.request_id {
            obj.entry("request_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(seq) = self.seq {
            obj.entry("seq")
                .or_insert_with(|| Value::Number(serde_json::Number::from(seq)));
        }
    }
}

/// Envelope state for one run: request_id and the next sequence number.
pub struct EnvelopeState {
    pub request_id: String,
    pub next_seq: u64,
}

impl EnvelopeState {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            next_seq: 1,
        }
    }

    /// Injects the envelope into the event value and advances the sequence.
    pub fn inject_into(&mut self, value: &mut Value) {
        let env = Envelope::new()
            .with_request_id(&self.request_id)
            .with_seq(self.next_seq);
        self.next_seq += 1;
        env.inject_into(value);
    }
}

/// Converts a run event to JSON and injects the envelope using the given state.
/// Returns the final frame (type + payload + request_id, seq).
pub fn to_json(event: &RunEvent, state: &mut EnvelopeState) -> Result<Value, serde_json::Error> {
    let mut value = event.to_value()?;
    state.inject_into(&mut value);
    Ok(value)
}
