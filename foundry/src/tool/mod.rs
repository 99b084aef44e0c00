//! Tool protocol client: at-most-once, authorised, audited tool invocation.
//!
//! Every call goes through the idempotency cache (single-flight under
//! concurrent identical keys), a per-tool concurrency cap, and the retry
//! policy: retriable errors and timeouts back off exponentially (base 200 ms,
//! cap 5 s, 3 attempts) within the remaining deadline; fatal errors never
//! retry. Every attempt is audited.

mod binding;
mod envelope;
mod idempotency;
mod transport;

pub use binding::{ArgField, ArgKind, ToolBinding, ToolCatalog};
pub use envelope::{ToolOutcome, ToolRequest, ToolResponse};
pub use idempotency::{derive_key, IdempotencyCache};
pub use transport::{HttpToolTransport, MockBehavior, MockToolTransport, ToolTransport};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audit::{AuditDraft, AuditLog};
use crate::authz::{AuthzError, AuthzOracle, ObjectRef, Relation};
use crate::envelope::Deadline;
use crate::error::ErrorKind;
use crate::state::content_hash;

use idempotency::{Begin, LeadGuard};

/// Ceiling on one dispatch when the request carries no deadline.
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy constants.
const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_CAP: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;

/// One tool invocation as seen by the client.
#[derive(Clone, Debug)]
pub struct ToolCall {
    pub request_id: String,
    pub tenant: String,
    pub actor: String,
    pub tool_name: String,
    pub arguments: Value,
    pub deadline: Option<Deadline>,
    /// Stable suffix folded into the idempotency key. Empty by default; set it
    /// to scope retries narrower than (tool, arguments).
    pub idempotency_suffix: String,
}

impl ToolCall {
    pub fn new(
        request_id: impl Into<String>,
        tenant: impl Into<String>,
        actor: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            tenant: tenant.into(),
            actor: actor.into(),
            tool_name: tool_name.into(),
            arguments,
            deadline: None,
            idempotency_suffix: String::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_idempotency_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.idempotency_suffix = suffix.into();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    ArgumentValidation(String),

    #[error("denied")]
    Unauthorized,

    #[error("tool failed: {0}")]
    Fatal(String),

    #[error("tool timed out after retry budget")]
    Timeout,

    #[error("retriable failure after retry budget: {0}")]
    Retriable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::UnknownTool(_) => ErrorKind::UnknownTool,
            ToolError::ArgumentValidation(_) => ErrorKind::ArgumentValidation,
            ToolError::Unauthorized => ErrorKind::Unauthorized,
            ToolError::Timeout => ErrorKind::Timeout,
            ToolError::Retriable(_) => ErrorKind::Retriable,
            ToolError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            ToolError::Fatal(_) | ToolError::Cancelled | ToolError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// The C4 client: one per runtime instance, shared by all requests.
///
/// **Interaction**: part of [`crate::runtime::Resources`]; worker and tool
/// nodes reach it through the run context.
pub struct ToolClient {
    catalog: ToolCatalog,
    transport: Arc<dyn ToolTransport>,
    cache: IdempotencyCache,
    limits: DashMap<String, Arc<Semaphore>>,
    authz: Arc<AuthzOracle>,
    audit: AuditLog,
}

impl ToolClient {
    pub fn new(
        catalog: ToolCatalog,
        transport: Arc<dyn ToolTransport>,
        authz: Arc<AuthzOracle>,
        audit: AuditLog,
    ) -> Self {
        Self {
            catalog,
            transport,
            cache: IdempotencyCache::new(),
            limits: DashMap::new(),
            authz,
            audit,
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Invokes a tool with at-most-once semantics.
    ///
    /// Returns the tool's value on success. A cached response within the TTL is
    /// returned without any network traffic; a concurrent identical call awaits
    /// the in-flight invocation.
    pub async fn invoke(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<Value, ToolError> {
        let binding = self
            .catalog
            .resolve(&call.tool_name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(call.tool_name.clone()))?;
        binding
            .validate(&call.arguments)
            .map_err(ToolError::ArgumentValidation)?;

        match self
            .authz
            .require(&call.actor, Relation::CanExecute, &ObjectRef::agent(&call.tool_name))
            .await
        {
            Ok(()) => {}
            Err(AuthzError::Denied) => {
                self.audit.record(
                    AuditDraft::new(&call.request_id, &call.tenant, &call.actor, "auth.deny")
                        .resource("tool", &call.tool_name)
                        .outcome("denied"),
                );
                return Err(ToolError::Unauthorized);
            }
            Err(AuthzError::Backend(msg)) => return Err(ToolError::Internal(msg)),
        }

        let key = derive_key(
            &call.tenant,
            &call.tool_name,
            &call.arguments,
            &call.idempotency_suffix,
        );

        loop {
            match self.cache.begin(&key, binding.idempotency_ttl) {
                Begin::Cached(response) => {
                    debug!(tool = %call.tool_name, "idempotency cache hit");
                    return unwrap_response(response);
                }
                Begin::Wait(mut rx) => {
                    let settled = loop {
                        let current = rx.borrow().clone();
                        if let Some(result) = current {
                            break result;
                        }
                        tokio::select! {
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    break Err("leader departed".to_string());
                                }
                            }
                            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
                            _ = sleep_until_deadline(call.deadline) => {
                                return Err(ToolError::DeadlineExceeded)
                            }
                        }
                    };
                    match settled {
                        Ok(response) => return unwrap_response(response),
                        // Leader aborted: compete for leadership and invoke.
                        Err(_) => continue,
                    }
                }
                Begin::Lead(guard) => return self.lead(call, &binding, &key, guard, cancel).await,
            }
        }
    }

    async fn lead(
        &self,
        call: &ToolCall,
        binding: &ToolBinding,
        key: &str,
        guard: LeadGuard,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        // Per-tool concurrency cap: park until a slot frees or the deadline
        // elapses. The guard is dropped on every early return, clearing the
        // in-flight slot for this request.
        let semaphore = self.limit_for(binding);
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| ToolError::Internal("tool semaphore closed".into()))?
            }
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            _ = sleep_until_deadline(call.deadline) => return Err(ToolError::DeadlineExceeded),
        };

        let mut attempt: u32 = 1;
        loop {
            let remaining = call.deadline.map(|d| d.remaining());
            if remaining == Some(Duration::ZERO) {
                return Err(ToolError::DeadlineExceeded);
            }
            let attempt_budget = remaining
                .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT)
                .min(DEFAULT_ATTEMPT_TIMEOUT);
            let request = ToolRequest {
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
                idempotency_key: key.to_string(),
                deadline_ms: Some(attempt_budget.as_millis() as u64),
                request_id: call.request_id.clone(),
                tenant: call.tenant.clone(),
            };

            let started = Instant::now();
            let response = tokio::select! {
                result = tokio::time::timeout(
                    attempt_budget,
                    self.transport.dispatch(&binding.endpoint, &request),
                ) => match result {
                    Ok(Ok(response)) => response,
                    Ok(Err(transport_err)) => ToolResponse::retriable(transport_err),
                    Err(_elapsed) => ToolResponse::timeout(),
                },
                _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            };
            let duration_ms = started.elapsed().as_millis() as u64;
            self.audit_attempt(call, key, attempt, duration_ms, &response);

            match response.outcome {
                ToolOutcome::Ok => {
                    let value = response.value.clone().unwrap_or(Value::Null);
                    guard.complete(response, true);
                    return Ok(value);
                }
                ToolOutcome::FatalError => {
                    let message = response.error.clone().unwrap_or_default();
                    guard.complete(response, true);
                    return Err(ToolError::Fatal(message));
                }
                ToolOutcome::RetriableError | ToolOutcome::Timeout => {
                    if attempt >= MAX_ATTEMPTS {
                        let err = match response.outcome {
                            ToolOutcome::Timeout => ToolError::Timeout,
                            _ => ToolError::Retriable(response.error.clone().unwrap_or_default()),
                        };
                        guard.fail(response.error.unwrap_or_else(|| "retry budget exhausted".into()));
                        return Err(err);
                    }
                    let delay = backoff_delay(attempt);
                    if let Some(d) = call.deadline {
                        if delay >= d.remaining() {
                            guard.fail("deadline elapsed during backoff");
                            return Err(ToolError::DeadlineExceeded);
                        }
                    }
                    debug!(tool = %call.tool_name, attempt, delay_ms = delay.as_millis() as u64, "tool retry");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ToolError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn limit_for(&self, binding: &ToolBinding) -> Arc<Semaphore> {
        self.limits
            .entry(binding.name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(binding.concurrency_cap)))
            .clone()
    }

    fn audit_attempt(
        &self,
        call: &ToolCall,
        key: &str,
        attempt: u32,
        duration_ms: u64,
        response: &ToolResponse,
    ) {
        let action = match response.outcome {
            ToolOutcome::FatalError => "tool.fatal",
            _ => "tool.invoke",
        };
        let mut metadata = serde_json::json!({
            "arguments_hash": content_hash(&call.arguments),
            "idempotency_key": key,
            "attempt": attempt,
            "duration_ms": duration_ms,
        });
        if response.outcome == ToolOutcome::Ok {
            metadata["response_hash"] = Value::String(response.response_hash());
        }
        self.audit.record(
            AuditDraft::new(&call.request_id, &call.tenant, &call.actor, action)
                .resource("tool", &call.tool_name)
                .outcome(response.outcome.as_str())
                .metadata(metadata),
        );
    }
}

fn unwrap_response(response: ToolResponse) -> Result<Value, ToolError> {
    match response.outcome {
        ToolOutcome::Ok => Ok(response.value.unwrap_or(Value::Null)),
        ToolOutcome::FatalError => Err(ToolError::Fatal(response.error.unwrap_or_default())),
        ToolOutcome::Timeout => Err(ToolError::Timeout),
        ToolOutcome::RetriableError => {
            Err(ToolError::Retriable(response.error.unwrap_or_default()))
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE
        .saturating_mul(1u32 << (attempt - 1).min(8))
        .min(RETRY_CAP)
}

async fn sleep_until_deadline(deadline: Option<Deadline>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d.instant())).await,
        None => std::future::pending::<()>().await,
    }
}
