//! Audit sinks: where flushed batches land.
//!
//! `MemoryAuditSink` backs tests and dev mode; `JsonlAuditSink` appends one
//! JSON object per line to a file, the durable default for single-node
//! deployments.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{AuditEntry, AuditError, AuditPage, AuditQuery};

/// Append-only storage for audit batches plus the filtered read path.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), AuditError>;

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError>;
}

fn paginate(matching: Vec<AuditEntry>, query: &AuditQuery) -> AuditPage {
    let limit = if query.limit == 0 { 50 } else { query.limit };
    let total = matching.len();
    let entries: Vec<AuditEntry> = matching
        .into_iter()
        .skip(query.offset)
        .take(limit)
        .collect();
    let consumed = query.offset + entries.len();
    AuditPage {
        entries,
        next_offset: (consumed < total).then_some(consumed),
    }
}

/// In-memory sink. Keeps raw entries; `raw_entries` is for test assertions.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), AuditError> {
        let mut guard = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend_from_slice(entries);
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        let matching: Vec<AuditEntry> = self
            .raw_entries()
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        Ok(paginate(matching, query))
    }
}

/// One JSON object per line, appended. File IO goes through `spawn_blocking`.
pub struct JsonlAuditSink {
    path: PathBuf,
    // Serialises appends from concurrent flushes.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let mut lines = String::new();
        for entry in entries {
            let line =
                serde_json::to_string(entry).map_err(|e| AuditError::Sink(e.to_string()))?;
            lines.push_str(&line);
            lines.push('\n');
        }
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            file.write_all(lines.as_bytes())
        })
        .await
        .map_err(|e| AuditError::Sink(e.to_string()))?
        .map_err(|e| AuditError::Sink(e.to_string()))
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        let path = self.path.clone();
        let content = tokio::task::spawn_blocking(move || std::fs::read_to_string(path))
            .await
            .map_err(|e| AuditError::Sink(e.to_string()))?
            .unwrap_or_default();
        let matching: Vec<AuditEntry> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .filter(|e| query.matches(e))
            .collect();
        Ok(paginate(matching, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(action: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            seq: 1,
            request_id: "req-1".into(),
            tenant: "acme".into(),
            actor: "u1".into(),
            action: action.into(),
            resource_type: "tool".into(),
            resource_id: "tasks.create_story".into(),
            outcome: "ok".into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// **Scenario**: JSONL sink round-trips entries through the file.
    #[tokio::test]
    async fn jsonl_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit.jsonl"));
        sink.append(&[entry("tool.invoke"), entry("auth.check")])
            .await
            .unwrap();

        let page = sink
            .query(&AuditQuery {
                action_prefix: Some("tool.".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].action, "tool.invoke");
    }

    /// **Scenario**: Querying a sink whose file does not exist yet yields an empty page.
    #[tokio::test]
    async fn jsonl_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("never-written.jsonl"));
        let page = sink
            .query(&AuditQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.next_offset, None);
    }
}
