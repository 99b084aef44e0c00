//! Append-only audit log.
//!
//! Every tool invocation, auth decision, graph transition of interest, and
//! secret access records an entry. Writes are asynchronous with bounded
//! buffering: overflow drops the oldest non-critical entries, but entries for
//! `auth.deny`, `secret.*`, and `tool.fatal` are never dropped. A dedicated
//! flusher task batches entries to an [`AuditSink`] every 100 ms.

mod sink;

pub use sink::{AuditSink, JsonlAuditSink, MemoryAuditSink};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Flush cadence of the background task.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Metadata keys whose values are masked on the query path. Stored entries
/// remain raw for forensics.
const REDACTED_METADATA_KEYS: &[&str] = &["arguments", "input", "output", "value"];

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("sink: {0}")]
    Sink(String),
}

/// One audit record. `metadata` may carry hashes of inputs and
/// outputs but never plaintext secrets or bulk content.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Total order within one request is `request_id` + `seq`.
    pub seq: u64,
    pub request_id: String,
    pub tenant: String,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Unstamped entry; the log assigns `timestamp` and `seq` on record.
#[derive(Clone, Debug)]
pub struct AuditDraft {
    pub request_id: String,
    pub tenant: String,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: String,
    pub metadata: Value,
}

impl AuditDraft {
    pub fn new(
        request_id: impl Into<String>,
        tenant: impl Into<String>,
        actor: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            tenant: tenant.into(),
            actor: actor.into(),
            action: action.into(),
            resource_type: String::new(),
            resource_id: String::new(),
            outcome: "ok".into(),
            metadata: Value::Null,
        }
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = resource_id.into();
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = outcome.into();
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Entries that survive buffer overflow unconditionally.
fn is_critical(entry: &AuditEntry) -> bool {
    entry.action == "auth.deny"
        || entry.action == "tool.fatal"
        || entry.action.starts_with("secret.")
}

/// Query filter; all conditions are conjunctive.
#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub tenant: Option<String>,
    pub actor: Option<String>,
    pub action_prefix: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(t) = &self.tenant {
            if &entry.tenant != t {
                return false;
            }
        }
        if let Some(a) = &self.actor {
            if &entry.actor != a {
                return false;
            }
        }
        if let Some(p) = &self.action_prefix {
            if !entry.action.starts_with(p.as_str()) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// One page of query results.
#[derive(Clone, Debug)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    /// Offset for the next page; `None` when the result set is exhausted.
    pub next_offset: Option<usize>,
}

/// Masks sensitive metadata keys. Applied on the query path only.
pub fn redact(mut entry: AuditEntry) -> AuditEntry {
    if let Value::Object(map) = &mut entry.metadata {
        for key in REDACTED_METADATA_KEYS {
            if let Some(v) = map.get_mut(*key) {
                *v = Value::String("[redacted]".into());
            }
        }
    }
    entry
}

struct Shared {
    buffer: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    seq: AtomicU64,
    dropped: AtomicU64,
    sink: Arc<dyn AuditSink>,
}

/// In-process audit front: bounded buffer plus background flusher.
///
/// **Interaction**: one per runtime instance, injected via
/// [`crate::runtime::Resources`]; the flusher is spawned at boot and drained on
/// shutdown.
#[derive(Clone)]
pub struct AuditLog {
    shared: Arc<Shared>,
}

impl AuditLog {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self::with_capacity(sink, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(VecDeque::new()),
                capacity,
                seq: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
                sink,
            }),
        }
    }

    /// Stamps and buffers one entry. Non-blocking; overflow evicts the oldest
    /// non-critical entry.
    pub fn record(&self, draft: AuditDraft) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            request_id: draft.request_id,
            tenant: draft.tenant,
            actor: draft.actor,
            action: draft.action,
            resource_type: draft.resource_type,
            resource_id: draft.resource_id,
            outcome: draft.outcome,
            metadata: draft.metadata,
        };
        let mut buffer = match self.shared.buffer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.push_back(entry);
        if buffer.len() > self.shared.capacity {
            if let Some(pos) = buffer.iter().position(|e| !is_critical(e)) {
                buffer.remove(pos);
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "audit buffer overflow, dropped oldest non-critical entry");
            }
            // All-critical buffers are allowed to exceed capacity.
        }
    }

    /// Entries evicted because of overflow since boot.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Drains the buffer into the sink. Used by the flusher and by shutdown.
    pub async fn flush_once(&self) -> Result<usize, AuditError> {
        let batch: Vec<AuditEntry> = {
            let mut buffer = match self.shared.buffer.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        self.shared.sink.append(&batch).await?;
        Ok(count)
    }

    /// Filtered, paginated read with query-time redaction.
    pub async fn query(&self, query: AuditQuery) -> Result<AuditPage, AuditError> {
        let mut page = self.shared.sink.query(&query).await?;
        page.entries = page.entries.into_iter().map(redact).collect();
        Ok(page)
    }

    /// Spawns the 100 ms flusher. Stops on cancellation, draining in-flight
    /// entries within the shutdown grace.
    pub fn spawn_flusher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = log.flush_once().await {
                            warn!(error = %e, "audit flush failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        if let Err(e) = log.flush_once().await {
                            warn!(error = %e, "audit drain on shutdown failed");
                        }
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(action: &str) -> AuditDraft {
        AuditDraft::new("req-1", "acme", "u1", action)
    }

    /// **Scenario**: Overflow drops the oldest non-critical entry, never auth.deny.
    #[tokio::test]
    async fn overflow_preserves_critical_entries() {
        let sink = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::with_capacity(sink.clone(), 2);
        log.record(draft("auth.deny").outcome("denied"));
        log.record(draft("graph.transition"));
        log.record(draft("graph.transition"));
        log.record(draft("graph.transition"));

        log.flush_once().await.unwrap();
        let page = log.query(AuditQuery { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(page.entries.iter().any(|e| e.action == "auth.deny"));
        assert_eq!(log.dropped_count(), 2);
    }

    /// **Scenario**: seq values are strictly increasing, giving a total order per request.
    #[tokio::test]
    async fn seq_orders_entries() {
        let sink = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::new(sink);
        log.record(draft("tool.invoke"));
        log.record(draft("tool.invoke"));
        log.flush_once().await.unwrap();
        let page = log.query(AuditQuery { limit: 10, ..Default::default() }).await.unwrap();
        assert!(page.entries[0].seq < page.entries[1].seq);
    }

    /// **Scenario**: Query-time redaction masks sensitive metadata but the
    /// stored entry stays raw.
    #[tokio::test]
    async fn query_redacts_metadata() {
        let sink = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::new(sink.clone());
        log.record(draft("tool.invoke").metadata(json!({"arguments": "plain", "hash": "abc"})));
        log.flush_once().await.unwrap();

        let page = log.query(AuditQuery { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.entries[0].metadata["arguments"], "[redacted]");
        assert_eq!(page.entries[0].metadata["hash"], "abc");

        let raw = sink.raw_entries();
        assert_eq!(raw[0].metadata["arguments"], "plain");
    }

    /// **Scenario**: Filters compose conjunctively and pagination reports the next offset.
    #[tokio::test]
    async fn query_filters_and_paginates() {
        let sink = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::new(sink);
        for i in 0..5 {
            let tenant = if i % 2 == 0 { "acme" } else { "globex" };
            log.record(AuditDraft::new(format!("req-{i}"), tenant, "u1", "tool.invoke"));
        }
        log.flush_once().await.unwrap();

        let page = log
            .query(AuditQuery {
                tenant: Some("acme".into()),
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_offset, Some(2));

        let rest = log
            .query(AuditQuery {
                tenant: Some("acme".into()),
                offset: 2,
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert_eq!(rest.next_offset, None);
    }
}
