//! Pipeline-neutral request envelope.
//!
//! Built by a channel adapter at transport ingress and handed to every node by
//! reference. The identity triplet is authoritative for isolation: handlers can
//! read it but never rewrite it.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 128-bit request id, assigned once at transport ingress and propagated on every
/// sub-call and log entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity triplet: tenant is the isolation boundary; domain and instance narrow it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl Scope {
    pub fn tenant(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            domain: None,
            instance: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Cache/key prefix for tenant isolation: `tenant` or `tenant/domain`.
    pub fn key_prefix(&self) -> String {
        match &self.domain {
            Some(d) => format!("{}/{}", self.tenant, d),
            None => self.tenant.clone(),
        }
    }
}

/// Transport channel the request arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Chat,
    Voice,
    Api,
}

/// One typed part of the request input.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputPart {
    Text { text: String },
    Structured { payload: serde_json::Value },
    AudioStream { handle: String },
}

/// Absolute deadline carried down every call. Monotonically tightening: a child
/// deadline can only move earlier, never later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn in_duration(d: Duration) -> Self {
        Self(Instant::now() + d)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Remaining budget, `Duration::ZERO` once elapsed.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_elapsed(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// A sub-call deadline must not exceed its parent's: the result is the earlier
    /// of `self` and `now + budget`.
    pub fn tighten(&self, budget: Duration) -> Deadline {
        let candidate = Instant::now() + budget;
        Deadline(self.0.min(candidate))
    }
}

/// Pipeline-neutral request envelope.
#[derive(Clone, Debug)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub scope: Scope,
    /// Principal id; `"service"` for internal callers.
    pub actor: String,
    pub channel: Channel,
    pub input: Vec<InputPart>,
    /// Wall-clock and monotonic arrival pair.
    pub arrived_at: (DateTime<Utc>, Instant),
    pub deadline: Option<Deadline>,
    /// Session key for drafts/history; defaults to the request id when absent.
    pub session_id: Option<String>,
}

impl RequestEnvelope {
    pub fn new(scope: Scope, actor: impl Into<String>, channel: Channel, input: Vec<InputPart>) -> Self {
        Self {
            request_id: RequestId::generate(),
            scope,
            actor: actor.into(),
            channel,
            input,
            arrived_at: (Utc::now(), Instant::now()),
            deadline: None,
            session_id: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Draft-store key: explicit session id, else the request id.
    pub fn session_key(&self) -> &str {
        self.session_id
            .as_deref()
            .unwrap_or_else(|| self.request_id.as_str())
    }

    /// Deadline for a sub-call with its own budget, tightened under the request's.
    pub fn sub_deadline(&self, budget: Duration) -> Deadline {
        match self.deadline {
            Some(d) => d.tighten(budget),
            None => Deadline::in_duration(budget),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Tightening never extends a deadline.
    #[test]
    fn deadline_tighten_is_monotonic() {
        let parent = Deadline::in_duration(Duration::from_millis(100));
        let child = parent.tighten(Duration::from_secs(60));
        assert!(child.instant() <= parent.instant());

        let tighter = parent.tighten(Duration::from_millis(10));
        assert!(tighter.instant() < parent.instant());
    }

    /// **Scenario**: session_key falls back to the request id without a session.
    #[test]
    fn session_key_defaults_to_request_id() {
        let env = RequestEnvelope::new(Scope::tenant("acme"), "u1", Channel::Api, vec![]);
        assert_eq!(env.session_key(), env.request_id.as_str());
        let env = env.with_session_id("sess-7");
        assert_eq!(env.session_key(), "sess-7");
    }

    /// **Scenario**: Tenant-scoped key prefixes differ per tenant and domain.
    #[test]
    fn scope_key_prefix() {
        assert_eq!(Scope::tenant("t1").key_prefix(), "t1");
        assert_eq!(
            Scope::tenant("t1").with_domain("support").key_prefix(),
            "t1/support"
        );
    }
}
