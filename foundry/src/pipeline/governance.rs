//! Governance stage: policy screening before any worker runs.
//!
//! Disallowed-topic patterns short-circuit to `io_out` with a policy-violation
//! response; PII patterns are masked into the governance field so downstream
//! stages can prefer the scrubbed text.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use run_event::RunEvent;

use crate::audit::AuditDraft;
use crate::error::ErrorKind;
use crate::graph::{Handler, HandlerError, NodeOutput, Route, RunContext};
use crate::state::{fields, Message, PipelineState, StateUpdate};

use super::{pipeline_fields, routes};

/// Compiled policy: denial patterns and masking rules.
#[derive(Clone, Debug)]
pub struct GovernancePolicy {
    denied: Vec<(String, Regex)>,
    masks: Vec<(Regex, String)>,
}

impl GovernancePolicy {
    /// Masks nothing, denies nothing.
    pub fn permissive() -> Self {
        Self {
            denied: Vec::new(),
            masks: Vec::new(),
        }
    }

    /// Baseline PII masking: email addresses and long digit runs (cards, SSNs).
    pub fn standard() -> Self {
        Self::permissive()
            .mask(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", "[email]")
            .mask(r"\b\d{9,}\b", "[number]")
    }

    /// Adds a disallowed-topic pattern. Invalid regexes are rejected eagerly in
    /// `try_deny`; this variant panics and is meant for literal patterns.
    pub fn deny(mut self, name: impl Into<String>, pattern: &str) -> Self {
        let compiled = Regex::new(pattern).unwrap_or_else(|e| {
            // A literal-pattern typo is a programming error, surfaced at build.
            panic!("invalid governance pattern: {e}")
        });
        self.denied.push((name.into(), compiled));
        self
    }

    pub fn try_deny(mut self, name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        self.denied.push((name.into(), Regex::new(pattern)?));
        Ok(self)
    }

    pub fn mask(mut self, pattern: &str, replacement: &str) -> Self {
        if let Ok(compiled) = Regex::new(pattern) {
            self.masks.push((compiled, replacement.to_string()));
        }
        self
    }

    fn first_denial(&self, text: &str) -> Option<&str> {
        self.denied
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(name, _)| name.as_str())
    }

    fn apply_masks(&self, text: &str) -> (String, bool) {
        let mut masked = text.to_string();
        let mut changed = false;
        for (re, replacement) in &self.masks {
            if re.is_match(&masked) {
                masked = re.replace_all(&masked, replacement.as_str()).into_owned();
                changed = true;
            }
        }
        (masked, changed)
    }
}

impl Default for GovernancePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Decision stage: `pass` to context or `deny` straight to `io_out`.
pub struct GovernanceHandler {
    policy: GovernancePolicy,
}

impl GovernanceHandler {
    pub fn new(policy: GovernancePolicy) -> Self {
        Self { policy }
    }

    fn user_text(state: &PipelineState) -> String {
        let Some(Value::Array(messages)) = state.get(fields::MESSAGES) else {
            return String::new();
        };
        messages
            .iter()
            .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .filter_map(|m| match m.get("content") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
                None => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Handler for GovernanceHandler {
    async fn run(&self, state: &PipelineState, ctx: &RunContext) -> Result<NodeOutput, HandlerError> {
        let text = Self::user_text(state);

        if let Some(policy_name) = self.policy.first_denial(&text) {
            ctx.resources.audit.record(
                AuditDraft::new(
                    ctx.request_id(),
                    ctx.tenant(),
                    &ctx.envelope.actor,
                    "governance.deny",
                )
                .resource("policy", policy_name)
                .outcome("denied"),
            );
            ctx.emit(RunEvent::GovernanceDenied {
                policy: policy_name.to_string(),
            });
            let update = StateUpdate::new()
                .set(
                    fields::FINAL_RESPONSE,
                    json!({
                        "error_kind": ErrorKind::PolicyViolation.as_str(),
                        "message": "request not permitted",
                    }),
                )
                .set(
                    fields::MESSAGES,
                    json!([Message::governance(format!("denied by policy '{policy_name}'")).to_value()]),
                )
                .set(pipeline_fields::GOVERNANCE, json!({ "denied_by": policy_name }));
            return Ok(NodeOutput {
                update,
                route: Some(Route::Label(routes::DENY.into())),
            });
        }

        let (masked, masked_any) = self.policy.apply_masks(&text);
        let mut update = StateUpdate::new().set(
            pipeline_fields::GOVERNANCE,
            json!({ "masked_input": masked, "masked": masked_any }),
        );
        if masked_any {
            update = update.set(
                fields::MESSAGES,
                json!([Message::governance("input masked").to_value()]),
            );
        }
        Ok(NodeOutput {
            update,
            route: Some(Route::Label(routes::PASS.into())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Standard masking scrubs emails and long digit runs.
    #[test]
    fn standard_masking() {
        let policy = GovernancePolicy::standard();
        let (masked, changed) = policy.apply_masks("mail me at jo@example.com re 4111111111111111");
        assert!(changed);
        assert!(!masked.contains("jo@example.com"));
        assert!(!masked.contains("4111111111111111"));
        assert!(masked.contains("[email]"));
        assert!(masked.contains("[number]"));
    }

    /// **Scenario**: Denial patterns match case-sensitively as written.
    #[test]
    fn denial_patterns() {
        let policy = GovernancePolicy::permissive().deny("weapons", r"(?i)build a bomb");
        assert_eq!(policy.first_denial("how to Build a Bomb"), Some("weapons"));
        assert_eq!(policy.first_denial("build a birdhouse"), None);
    }
}
