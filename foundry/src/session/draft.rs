//! In-memory draft store with TTL eviction, plus the checkpointer bridge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::graph::{CheckpointError, CheckpointRecord, Checkpointer};

use super::{DraftStore, StoreError};

/// TTL from last write.
pub const DRAFT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cadence of the background sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct DraftEntry {
    owner: String,
    snapshot: Value,
    expires_at: Instant,
}

/// DashMap-backed draft store. Per-key writes serialise on the shard entry.
pub struct InMemoryDraftStore {
    entries: DashMap<String, DraftEntry>,
    ttl: Duration,
}

impl InMemoryDraftStore {
    pub fn new() -> Self {
        Self::with_ttl(DRAFT_TTL)
    }

    /// Shorter TTLs for tests.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryDraftStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DraftStore for InMemoryDraftStore {
    async fn save(&self, key: &str, owner: &str, snapshot: Value) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            DraftEntry {
                owner: owner.to_string(),
                snapshot,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        // The read guard must drop before the removal below touches the shard.
        let hit = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.snapshot.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if hit.is_none() {
            // Expired entry hit between sweeps.
            self.entries.remove(key);
        }
        Ok(hit)
    }

    async fn list(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.owner == owner && e.expires_at > now)
            .map(|e| e.key().clone())
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        Ok(before - self.entries.len())
    }
}

/// Spawns the 60 s draft sweeper. Stops on cancellation.
pub fn spawn_draft_sweeper(
    store: Arc<dyn DraftStore>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => match store.evict_expired().await {
                    Ok(0) => {}
                    Ok(count) => debug!(count, "evicted expired drafts"),
                    Err(e) => warn!(error = %e, "draft sweep failed"),
                },
                _ = cancel.cancelled() => return,
            }
        }
    })
}

/// Executor checkpoints stored as drafts keyed by request id.
pub struct DraftCheckpointer {
    store: Arc<dyn DraftStore>,
}

impl DraftCheckpointer {
    pub fn new(store: Arc<dyn DraftStore>) -> Self {
        Self { store }
    }

    fn key(request_id: &str) -> String {
        format!("ckpt:{request_id}")
    }
}

#[async_trait]
impl Checkpointer for DraftCheckpointer {
    async fn save(&self, request_id: &str, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let value = record.to_value()?;
        self.store
            .save(&Self::key(request_id), "checkpoint", value)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))
    }

    async fn load(&self, request_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let value = self
            .store
            .load(&Self::key(request_id))
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        value.map(CheckpointRecord::from_value).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: Saves overwrite and reset the TTL; loads return the latest.
    #[tokio::test]
    async fn save_overwrites() {
        let store = InMemoryDraftStore::new();
        store.save("k", "sess-1", json!({"v": 1})).await.unwrap();
        store.save("k", "sess-1", json!({"v": 2})).await.unwrap();
        assert_eq!(store.load("k").await.unwrap().unwrap()["v"], 2);
        assert_eq!(store.len(), 1);
    }

    /// **Scenario**: Expired entries vanish from load, list, and the sweep.
    #[tokio::test]
    async fn expiry_evicts() {
        let store = InMemoryDraftStore::with_ttl(Duration::from_millis(10));
        store.save("old", "sess-1", json!(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.save("fresh", "sess-1", json!(2)).await.unwrap();

        assert_eq!(store.load("old").await.unwrap(), None);
        assert_eq!(store.list("sess-1").await.unwrap(), vec!["fresh".to_string()]);
        assert_eq!(store.evict_expired().await.unwrap(), 0); // "old" already lazily dropped
    }

    /// **Scenario**: list is owner-scoped.
    #[tokio::test]
    async fn list_is_owner_scoped() {
        let store = InMemoryDraftStore::new();
        store.save("a", "sess-1", json!(1)).await.unwrap();
        store.save("b", "sess-2", json!(2)).await.unwrap();
        assert_eq!(store.list("sess-1").await.unwrap(), vec!["a".to_string()]);
    }

    /// **Scenario**: Checkpoint records round-trip through the draft store.
    #[tokio::test]
    async fn checkpointer_round_trip() {
        let store = Arc::new(InMemoryDraftStore::new());
        let ckpt = DraftCheckpointer::new(store);
        let record = CheckpointRecord::capture(
            &crate::state::PipelineState::new(),
            vec!["supervisor".into()],
            2,
        );
        ckpt.save("req-1", &record).await.unwrap();
        let loaded = ckpt.load("req-1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(ckpt.load("req-other").await.unwrap(), None);
    }
}
