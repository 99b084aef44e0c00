//! Request-level error taxonomy.
//!
//! Every degraded response carries an [`ErrorKind`]; the per-component error enums
//! (`ToolError`, `SecretError`, `AuthzError`, `StoreError`, …) map into it at the
//! point where an error becomes actor-visible.

use serde::{Deserialize, Serialize};

/// Actor-visible error classification.
///
/// Boot-time kinds (`Configuration`, `BundleIntegrity`) are fatal to the process;
/// the rest are per-request or per-node. `Unauthorized` always renders with an
/// opaque message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    BundleIntegrity,
    Unauthorized,
    UnknownTool,
    ArgumentValidation,
    NotFound,
    DeadlineExceeded,
    RecursionLimitExceeded,
    UnroutableState,
    AmbiguousEdge,
    WorkerQuorumFailure,
    PolicyViolation,
    Retriable,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// Wire name, matching the serde rename.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::BundleIntegrity => "bundle_integrity",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::ArgumentValidation => "argument_validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::RecursionLimitExceeded => "recursion_limit_exceeded",
            ErrorKind::UnroutableState => "unroutable_state",
            ErrorKind::AmbiguousEdge => "ambiguous_edge",
            ErrorKind::WorkerQuorumFailure => "worker_quorum_failure",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::Retriable => "retriable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{error_kind, message, request_id}` triple actors see on failure.
///
/// `Unauthorized` is constructed through [`ErrorResponse::unauthorized`] so the
/// message can never leak the denied relation or object.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error_kind: ErrorKind,
    pub message: String,
    pub request_id: String,
}

impl ErrorResponse {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
            request_id: request_id.into(),
        }
    }

    /// Opaque denial. The message is fixed; nothing about the check is echoed back.
    pub fn unauthorized(request_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, "request not permitted", request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Wire names are snake_case and stable.
    #[test]
    fn error_kind_wire_names() {
        assert_eq!(ErrorKind::DeadlineExceeded.as_str(), "deadline_exceeded");
        assert_eq!(ErrorKind::WorkerQuorumFailure.as_str(), "worker_quorum_failure");
        let v = serde_json::to_value(ErrorKind::UnroutableState).unwrap();
        assert_eq!(v, "unroutable_state");
    }

    /// **Scenario**: Unauthorized responses carry the fixed opaque message.
    #[test]
    fn unauthorized_is_opaque() {
        let r = ErrorResponse::unauthorized("req-1");
        assert_eq!(r.error_kind, ErrorKind::Unauthorized);
        assert_eq!(r.message, "request not permitted");
        assert_eq!(r.request_id, "req-1");
    }
}
