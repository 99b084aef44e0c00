//! Run context handed to every node handler.
//!
//! Bundles the request envelope, the boot-time resource set, the cancellation
//! token, and the optional run-event stream. Cheap to clone; everything shared
//! is behind an `Arc`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use run_event::RunEvent;

use crate::envelope::{Deadline, RequestEnvelope};
use crate::runtime::Resources;

/// Per-request execution context.
///
/// Handlers receive `&RunContext`; sub-graphs reuse the same context so the
/// deadline, cancellation, and identity propagate unchanged.
#[derive(Clone)]
pub struct RunContext {
    pub envelope: Arc<RequestEnvelope>,
    pub resources: Arc<Resources>,
    /// Cancelled on deadline elapse or client abort; cooperative but mandatory
    /// for every handler that suspends.
    pub cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl RunContext {
    pub fn new(envelope: RequestEnvelope, resources: Arc<Resources>) -> Self {
        Self {
            envelope: Arc::new(envelope),
            resources,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Attaches a run-event stream; adapters consume the receiving end.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Emits a run event if a stream is attached. Send failures are ignored:
    /// a departed listener must not fail the request.
    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.envelope.deadline
    }

    pub fn request_id(&self) -> &str {
        self.envelope.request_id.as_str()
    }

    pub fn tenant(&self) -> &str {
        &self.envelope.scope.tenant
    }
}
