//! Scoped secret retrieval with blind writes.
//!
//! Paths are deterministic: `env/tenant[/domain]/name`. The runtime may `get`
//! values internally; any externally reachable surface sees only `status`.
//! `put` is gated on a `can_update` check and never returns the value. Secret
//! values never reach audit entries, drafts, or trace events.

mod backend;

pub use backend::{HttpSecretBackend, MemorySecretBackend};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audit::{AuditDraft, AuditLog};
use crate::authz::{AuthzError, AuthzOracle, ObjectRef, Relation};
use crate::error::ErrorKind;

/// An in-memory secret value. No `Clone`, no `Serialize`; `Debug` redacts.
/// The only way to read it is scoped exposure via [`SecretValue::with_str`].
pub struct SecretValue {
    inner: String,
}

impl SecretValue {
    fn new(inner: String) -> Self {
        Self { inner }
    }

    /// Scoped exposure: the value is only visible inside the closure.
    pub fn with_str<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(&self.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Externally visible state of one secret: configured or not, never the value.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SecretStatus {
    pub configured: bool,
    pub last_rotated: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// Fatal to the requesting node.
    #[error("secret not found: {0}")]
    NotFound(String),

    /// Denied by the authorization oracle. Rendered opaquely.
    #[error("denied")]
    Denied,

    /// Network/backend failure after the retry budget.
    #[error("secret backend: {0}")]
    Backend(String),

    #[error("cancelled")]
    Cancelled,
}

impl SecretError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretError::NotFound(_) => ErrorKind::NotFound,
            SecretError::Denied => ErrorKind::Unauthorized,
            SecretError::Backend(_) => ErrorKind::Retriable,
            SecretError::Cancelled => ErrorKind::DeadlineExceeded,
        }
    }
}

impl From<AuthzError> for SecretError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::Denied => SecretError::Denied,
            AuthzError::Backend(msg) => SecretError::Backend(msg),
        }
    }
}

/// Renders the deterministic path `env/tenant[/domain]/name`.
pub fn secret_path(env: &str, tenant: &str, domain: Option<&str>, name: &str) -> String {
    match domain {
        Some(d) => format!("{env}/{tenant}/{d}/{name}"),
        None => format!("{env}/{tenant}/{name}"),
    }
}

/// Raw storage operations. Implementations never interpret values.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn get_value(&self, path: &str) -> Result<Option<String>, SecretError>;

    async fn put_value(&self, path: &str, value: String) -> Result<(), SecretError>;

    async fn describe(&self, path: &str) -> Result<Option<SecretStatus>, SecretError>;

    async fn delete(&self, path: &str) -> Result<(), SecretError>;
}

/// Authorised, audited, retrying front over a [`SecretBackend`].
///
/// **Interaction**: part of [`crate::runtime::Resources`]; nodes reach it
/// through the run context. `get` is internal-only by construction — the serve
/// surface wires up `status` exclusively.
pub struct SecretsClient {
    backend: Arc<dyn SecretBackend>,
    authz: Arc<AuthzOracle>,
    audit: AuditLog,
    environment: String,
    max_attempts: u32,
    retry_base: Duration,
}

impl SecretsClient {
    pub fn new(
        backend: Arc<dyn SecretBackend>,
        authz: Arc<AuthzOracle>,
        audit: AuditLog,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            authz,
            audit,
            environment: environment.into(),
            max_attempts: 3,
            retry_base: Duration::from_millis(100),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn path(&self, tenant: &str, domain: Option<&str>, name: &str) -> String {
        secret_path(&self.environment, tenant, domain, name)
    }

    fn audit_secret(
        &self,
        request_id: &str,
        tenant: &str,
        actor: &str,
        action: &str,
        path: &str,
        outcome: &str,
    ) {
        self.audit.record(
            AuditDraft::new(request_id, tenant, actor, action)
                .resource("secret", path)
                .outcome(outcome),
        );
    }

    /// Internal read. Requires `can_read` on the secret's object; retries
    /// network errors with jittered backoff; `NotFound` is fatal to the caller.
    pub async fn get(
        &self,
        request_id: &str,
        actor: &str,
        tenant: &str,
        domain: Option<&str>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<SecretValue, SecretError> {
        let path = self.path(tenant, domain, name);
        if let Err(err) = self
            .authz
            .require(actor, Relation::CanRead, &ObjectRef::secret(&path))
            .await
        {
            if matches!(err, AuthzError::Denied) {
                self.audit
                    .record(AuditDraft::new(request_id, tenant, actor, "auth.deny").resource("secret", &path));
                self.audit_secret(request_id, tenant, actor, "secret.get", &path, "denied");
            }
            return Err(err.into());
        }

        let mut attempt = 0u32;
        loop {
            let fetch = self.backend.get_value(&path);
            let result = tokio::select! {
                r = fetch => r,
                _ = cancel.cancelled() => {
                    self.audit_secret(request_id, tenant, actor, "secret.get", &path, "cancelled");
                    return Err(SecretError::Cancelled);
                }
            };
            match result {
                Ok(Some(value)) => {
                    self.audit_secret(request_id, tenant, actor, "secret.get", &path, "ok");
                    return Ok(SecretValue::new(value));
                }
                Ok(None) => {
                    self.audit_secret(request_id, tenant, actor, "secret.get", &path, "not_found");
                    return Err(SecretError::NotFound(path));
                }
                Err(SecretError::Backend(msg)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        self.audit_secret(request_id, tenant, actor, "secret.get", &path, "error");
                        return Err(SecretError::Backend(msg));
                    }
                    let delay = jittered_backoff(self.retry_base, attempt, &path);
                    debug!(%path, attempt, delay_ms = delay.as_millis() as u64, "secret fetch retry");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(SecretError::Cancelled),
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Blind write. Requires `can_update`; a denial is audited without ever
    /// touching the backend. Success returns nothing.
    pub async fn put(
        &self,
        request_id: &str,
        actor: &str,
        tenant: &str,
        domain: Option<&str>,
        name: &str,
        value: String,
    ) -> Result<(), SecretError> {
        let path = self.path(tenant, domain, name);
        if let Err(err) = self
            .authz
            .require(actor, Relation::CanUpdate, &ObjectRef::secret(&path))
            .await
        {
            if matches!(err, AuthzError::Denied) {
                self.audit
                    .record(AuditDraft::new(request_id, tenant, actor, "auth.deny").resource("secret", &path));
                self.audit_secret(request_id, tenant, actor, "secret.put", &path, "denied");
            }
            return Err(err.into());
        }
        self.backend.put_value(&path, value).await?;
        self.audit_secret(request_id, tenant, actor, "secret.put", &path, "ok");
        Ok(())
    }

    /// Externally callable: whether the secret is configured and when it was
    /// last rotated. Never the value.
    pub async fn status(
        &self,
        request_id: &str,
        actor: &str,
        tenant: &str,
        domain: Option<&str>,
        name: &str,
    ) -> Result<SecretStatus, SecretError> {
        let path = self.path(tenant, domain, name);
        let status = self.backend.describe(&path).await?.unwrap_or(SecretStatus {
            configured: false,
            last_rotated: None,
        });
        self.audit_secret(request_id, tenant, actor, "secret.status", &path, "ok");
        Ok(status)
    }
}

/// Deterministic jitter: no RNG in the stack, so the spread comes from hashing
/// the path and attempt number.
fn jittered_backoff(base: Duration, attempt: u32, path: &str) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(6));
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    let spread = u64::from_le_bytes(digest[..8].try_into().unwrap_or([0u8; 8]));
    let jitter_ms = spread % (exp.as_millis().max(1) as u64 / 2 + 1);
    exp + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditQuery, MemoryAuditSink};
    use crate::authz::StaticAuthzBackend;

    fn client_with(
        backend: Arc<dyn SecretBackend>,
        authz_backend: StaticAuthzBackend,
    ) -> (SecretsClient, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = AuditLog::new(sink.clone());
        let authz = Arc::new(AuthzOracle::new(Arc::new(authz_backend)));
        (
            SecretsClient::new(backend, authz, audit, "prod"),
            sink,
        )
    }

    /// **Scenario**: Debug formatting never shows the value.
    #[test]
    fn secret_value_debug_is_redacted() {
        let v = SecretValue::new("hunter2".into());
        assert_eq!(format!("{v:?}"), "[REDACTED]");
        assert_eq!(v.with_str(str::len), 7);
    }

    /// **Scenario**: The path scheme is env/tenant[/domain]/name.
    #[test]
    fn path_scheme() {
        assert_eq!(secret_path("prod", "acme", None, "api_key"), "prod/acme/api_key");
        assert_eq!(
            secret_path("prod", "acme", Some("support"), "api_key"),
            "prod/acme/support/api_key"
        );
    }

    /// **Scenario**: A put by an actor without can_update is denied, audited
    /// with outcome=denied, and never reaches the backend.
    #[tokio::test]
    async fn unauthorized_put_never_touches_backend() {
        let backend = Arc::new(MemorySecretBackend::new());
        let (client, sink) = client_with(backend.clone(), StaticAuthzBackend::new());

        let err = client
            .put("req-1", "mallory", "acme", None, "api_key", "v".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::Denied));
        assert!(backend.describe("prod/acme/api_key").await.unwrap().is_none());

        client.audit_test_flush().await;
        let entries = sink.raw_entries();
        assert!(entries
            .iter()
            .any(|e| e.action == "secret.put" && e.outcome == "denied"));
        assert!(entries.iter().any(|e| e.action == "auth.deny"));
    }

    /// **Scenario**: A get without can_read never reaches the backend and is
    /// denied with an auth.deny audit entry.
    #[tokio::test]
    async fn unauthorized_get_is_denied() {
        let backend = Arc::new(MemorySecretBackend::new());
        backend.seed("prod/acme/api_key", "shh");
        let (client, sink) = client_with(backend, StaticAuthzBackend::new());

        let err = client
            .get("req-1", "mallory", "acme", None, "api_key", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::Denied));

        client.audit_test_flush().await;
        let entries = sink.raw_entries();
        assert!(entries.iter().any(|e| e.action == "auth.deny"));
        assert!(entries
            .iter()
            .any(|e| e.action == "secret.get" && e.outcome == "denied"));
    }

    /// **Scenario**: A missing secret is NotFound after an authorised read.
    #[tokio::test]
    async fn get_missing_is_not_found() {
        let backend = Arc::new(MemorySecretBackend::new());
        let authz = StaticAuthzBackend::allow_all();
        let (client, _) = client_with(backend, authz);
        let err = client
            .get("req-1", "u1", "acme", None, "missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::NotFound(_)));
    }

    /// **Scenario**: An authorised round trip: blind put then scoped get.
    #[tokio::test]
    async fn put_then_get_round_trip() {
        let backend = Arc::new(MemorySecretBackend::new());
        let (client, sink) = client_with(backend, StaticAuthzBackend::allow_all());
        client
            .put("req-1", "admin", "acme", Some("support"), "token", "tok-123".into())
            .await
            .unwrap();
        let value = client
            .get("req-2", "svc", "acme", Some("support"), "token", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value.with_str(str::to_owned), "tok-123");

        // No audit entry ever contains the value.
        client.audit_test_flush().await;
        for entry in sink.raw_entries() {
            let rendered = serde_json::to_string(&entry).unwrap();
            assert!(!rendered.contains("tok-123"));
        }
    }

    impl SecretsClient {
        async fn audit_test_flush(&self) {
            let _ = self.audit.flush_once().await;
        }
    }
}
