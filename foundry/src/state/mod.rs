//! Pipeline state: a field map with declared per-field merge policies.
//!
//! Nodes never mutate state in place. Each handler returns a [`StateUpdate`]
//! (partial write set); the executor merges it into the request's state per the
//! field's [`MergePolicy`]. A write to a field with no declared policy is a
//! schema violation.

mod canonical;

pub use canonical::{bytes_hash, canonical_string, content_hash};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Required pipeline fields. Application graphs may declare more.
pub mod fields {
    pub const MESSAGES: &str = "messages";
    pub const WORKER_RESPONSES: &str = "worker_responses";
    pub const CONTEXT: &str = "context";
    pub const TRACE: &str = "trace";
    pub const FINAL_RESPONSE: &str = "final_response";
}

/// How concurrent writes to one field combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Last write wins. Ties between parallel branches resolve in completion order.
    Replace,
    /// Ordered concatenation of sequences, completion order across branches.
    Append,
    /// Dictionary union; later key overrides earlier.
    Merge,
}

/// Per-field merge policies for one graph. The executor rejects a graph at
/// compile time if a node writes a field that is not declared here.
#[derive(Clone, Debug, Default)]
pub struct StateSchema {
    policies: BTreeMap<String, MergePolicy>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five required pipeline fields with their standard policies.
    pub fn pipeline_defaults() -> Self {
        Self::new()
            .with_field(fields::MESSAGES, MergePolicy::Append)
            .with_field(fields::WORKER_RESPONSES, MergePolicy::Merge)
            .with_field(fields::CONTEXT, MergePolicy::Merge)
            .with_field(fields::TRACE, MergePolicy::Append)
            .with_field(fields::FINAL_RESPONSE, MergePolicy::Replace)
    }

    pub fn with_field(mut self, name: impl Into<String>, policy: MergePolicy) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    pub fn policy(&self, field: &str) -> Option<MergePolicy> {
        self.policies.get(field).copied()
    }

    pub fn declares(&self, field: &str) -> bool {
        self.policies.contains_key(field)
    }
}

/// State schema violation. Compile-time when detectable from declared writes,
/// otherwise raised at merge time and fatal to the request.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StateError {
    #[error("field '{0}' has no declared merge policy")]
    UndeclaredField(String),
    #[error("field '{field}' expects {expected} for {policy:?} merges")]
    Shape {
        field: String,
        expected: &'static str,
        policy: MergePolicy,
    },
}

/// A node's partial write set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateUpdate {
    writes: BTreeMap<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.writes.insert(field.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.writes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.writes.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The typed state one request flows through the graph.
///
/// Values are schema-agnostic JSON; the executor owns the instance for the
/// request's lifetime and hands it to the channel adapter on terminal reach.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineState {
    values: BTreeMap<String, Value>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Direct insert, bypassing merge policies. Used only to seed initial state
    /// before execution starts.
    pub fn seed(&mut self, field: impl Into<String>, value: Value) {
        self.values.insert(field.into(), value);
    }

    /// Merges one update per the schema's field policies.
    ///
    /// `Append` concatenates sequences (a non-array update value appends as one
    /// element); `Merge` unions objects with the update overriding; `Replace`
    /// overwrites. Existing values of the wrong shape are a schema violation.
    pub fn apply(&mut self, update: &StateUpdate, schema: &StateSchema) -> Result<(), StateError> {
        for (field, value) in update.iter() {
            let policy = schema
                .policy(field)
                .ok_or_else(|| StateError::UndeclaredField(field.to_string()))?;
            match policy {
                MergePolicy::Replace => {
                    self.values.insert(field.to_string(), value.clone());
                }
                MergePolicy::Append => {
                    let entry = self
                        .values
                        .entry(field.to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    let Value::Array(items) = entry else {
                        return Err(StateError::Shape {
                            field: field.to_string(),
                            expected: "array",
                            policy,
                        });
                    };
                    match value {
                        Value::Array(new_items) => items.extend(new_items.iter().cloned()),
                        other => items.push(other.clone()),
                    }
                }
                MergePolicy::Merge => {
                    let entry = self
                        .values
                        .entry(field.to_string())
                        .or_insert_with(|| Value::Object(serde_json::Map::new()));
                    let Value::Object(map) = entry else {
                        return Err(StateError::Shape {
                            field: field.to_string(),
                            expected: "object",
                            policy,
                        });
                    };
                    let Value::Object(new_map) = value else {
                        return Err(StateError::Shape {
                            field: field.to_string(),
                            expected: "object",
                            policy,
                        });
                    };
                    for (k, v) in new_map {
                        map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Whole state as one JSON object (canonical serialisation input).
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self {
                values: map.into_iter().collect(),
            }),
            _ => None,
        }
    }

    /// SHA-256 over the canonical-JSON serialisation. Identical states hash
    /// identically regardless of write order.
    pub fn content_hash(&self) -> String {
        content_hash(&self.to_value())
    }
}

/// Message role within the `messages` log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Assistant,
    Tool,
    Governance,
}

/// One structured message in the `messages` field.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Value,
}

impl Message {
    pub fn new(role: Role, content: Value) -> Self {
        Self { role, content }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, Value::String(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Value::String(text.into()))
    }

    pub fn governance(text: impl Into<String>) -> Self {
        Self::new(Role::Governance, Value::String(text.into()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> StateSchema {
        StateSchema::pipeline_defaults()
    }

    /// **Scenario**: Replace overwrites, Append concatenates, Merge unions with override.
    #[test]
    fn apply_respects_policies() {
        let mut state = PipelineState::new();
        state
            .apply(
                &StateUpdate::new()
                    .set(fields::MESSAGES, json!([{"role":"user","content":"hi"}]))
                    .set(fields::CONTEXT, json!({"lang":"en"}))
                    .set(fields::FINAL_RESPONSE, json!("draft")),
                &schema(),
            )
            .unwrap();
        state
            .apply(
                &StateUpdate::new()
                    .set(fields::MESSAGES, json!([{"role":"assistant","content":"yo"}]))
                    .set(fields::CONTEXT, json!({"lang":"fr","tz":"UTC"}))
                    .set(fields::FINAL_RESPONSE, json!("final")),
                &schema(),
            )
            .unwrap();

        assert_eq!(state.get(fields::MESSAGES).unwrap().as_array().unwrap().len(), 2);
        assert_eq!(state.get(fields::CONTEXT).unwrap()["lang"], "fr");
        assert_eq!(state.get(fields::CONTEXT).unwrap()["tz"], "UTC");
        assert_eq!(state.get(fields::FINAL_RESPONSE).unwrap(), "final");
    }

    /// **Scenario**: A write to an undeclared field is rejected.
    #[test]
    fn apply_rejects_undeclared_field() {
        let mut state = PipelineState::new();
        let err = state
            .apply(&StateUpdate::new().set("rogue", json!(1)), &schema())
            .unwrap_err();
        assert_eq!(err, StateError::UndeclaredField("rogue".into()));
    }

    /// **Scenario**: Appending a scalar pushes it as one element.
    #[test]
    fn append_scalar_pushes_one_element() {
        let mut state = PipelineState::new();
        state
            .apply(&StateUpdate::new().set(fields::TRACE, json!({"node":"io_in"})), &schema())
            .unwrap();
        state
            .apply(&StateUpdate::new().set(fields::TRACE, json!({"node":"governance"})), &schema())
            .unwrap();
        assert_eq!(state.get(fields::TRACE).unwrap().as_array().unwrap().len(), 2);
    }

    /// **Scenario**: Merging a non-object into a merge field is a shape violation.
    #[test]
    fn merge_requires_objects() {
        let mut state = PipelineState::new();
        let err = state
            .apply(&StateUpdate::new().set(fields::CONTEXT, json!([1, 2])), &schema())
            .unwrap_err();
        assert!(matches!(err, StateError::Shape { policy: MergePolicy::Merge, .. }));
    }

    /// **Scenario**: Canonical serialise→deserialise of a state is a fixed point.
    #[test]
    fn canonical_round_trip_fixed_point() {
        let mut state = PipelineState::new();
        state
            .apply(
                &StateUpdate::new()
                    .set(fields::CONTEXT, json!({"b":2,"a":{"y":true,"x":null}}))
                    .set(fields::MESSAGES, json!(["m1"])),
                &schema(),
            )
            .unwrap();
        let first = canonical_string(&state.to_value());
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        let second = canonical_string(&reparsed);
        assert_eq!(first, second);
        assert_eq!(
            PipelineState::from_value(reparsed).unwrap().content_hash(),
            state.content_hash()
        );
    }
}
