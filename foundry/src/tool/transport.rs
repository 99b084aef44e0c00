//! Tool transports: how an envelope reaches a tool server.
//!
//! The HTTP transport is the production path; the mock transport is the test
//! seam (programmable responses, invocation counters, artificial latency).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::registry::ServiceRegistry;

use super::envelope::{ToolRequest, ToolResponse};

/// Delivers one request to the server behind `endpoint`. Transport-level
/// failures (connect, 5xx, decode) return `Err` and are treated as retriable.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn dispatch(&self, endpoint: &str, request: &ToolRequest) -> Result<ToolResponse, String>;
}

/// POSTs the envelope to `{base}/v1/tools/invoke`. `endpoint` is a literal URL
/// or a logical service name resolved through the registry.
pub struct HttpToolTransport {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
}

impl HttpToolTransport {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self, endpoint: &str) -> Result<String, String> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        self.registry
            .resolve(endpoint)
            .map(|e| e.base_url())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn dispatch(&self, endpoint: &str, request: &ToolRequest) -> Result<ToolResponse, String> {
        let base = self.base_url(endpoint)?;
        self.client
            .post(format!("{base}/v1/tools/invoke"))
            .json(request)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json::<ToolResponse>()
            .await
            .map_err(|e| e.to_string())
    }
}

/// Programmable behaviour of one mock tool.
pub enum MockBehavior {
    /// Fixed response.
    Respond(ToolResponse),
    /// Computed from the request.
    Compute(Arc<dyn Fn(&ToolRequest) -> ToolResponse + Send + Sync>),
    /// Sleeps, then responds. For deadline and timeout tests.
    Delay(Duration, ToolResponse),
    /// Fails at the transport level (network-style error).
    TransportError(String),
}

/// Test transport: behaviours registered per tool name, with counters.
#[derive(Default)]
pub struct MockToolTransport {
    behaviors: DashMap<String, MockBehavior>,
    counters: DashMap<String, Arc<AtomicUsize>>,
}

impl MockToolTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, tool_name: impl Into<String>, response: ToolResponse) {
        self.behaviors
            .insert(tool_name.into(), MockBehavior::Respond(response));
    }

    pub fn respond_ok(&self, tool_name: impl Into<String>, value: Value) {
        self.respond(tool_name, ToolResponse::ok(value));
    }

    pub fn respond_with(
        &self,
        tool_name: impl Into<String>,
        f: impl Fn(&ToolRequest) -> ToolResponse + Send + Sync + 'static,
    ) {
        self.behaviors
            .insert(tool_name.into(), MockBehavior::Compute(Arc::new(f)));
    }

    pub fn delay(&self, tool_name: impl Into<String>, delay: Duration, response: ToolResponse) {
        self.behaviors
            .insert(tool_name.into(), MockBehavior::Delay(delay, response));
    }

    pub fn transport_error(&self, tool_name: impl Into<String>, message: impl Into<String>) {
        self.behaviors
            .insert(tool_name.into(), MockBehavior::TransportError(message.into()));
    }

    /// Upstream invocations observed for one tool.
    pub fn invocations(&self, tool_name: &str) -> usize {
        self.counters
            .get(tool_name)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn counter(&self, tool_name: &str) -> Arc<AtomicUsize> {
        self.counters
            .entry(tool_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }
}

#[async_trait]
impl ToolTransport for MockToolTransport {
    async fn dispatch(&self, _endpoint: &str, request: &ToolRequest) -> Result<ToolResponse, String> {
        self.counter(&request.tool_name).fetch_add(1, Ordering::SeqCst);
        let Some(behavior) = self.behaviors.get(&request.tool_name) else {
            return Err(format!("mock has no behaviour for '{}'", request.tool_name));
        };
        match behavior.value() {
            MockBehavior::Respond(response) => Ok(response.clone()),
            MockBehavior::Compute(f) => Ok(f(request)),
            MockBehavior::Delay(delay, response) => {
                let (delay, response) = (*delay, response.clone());
                drop(behavior);
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            MockBehavior::TransportError(message) => Err(message.clone()),
        }
    }
}
