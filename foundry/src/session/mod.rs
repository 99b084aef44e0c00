//! Session & draft store: per-conversation ephemeral state plus committed,
//! content-addressed versions.
//!
//! Drafts are TTL-bound (24 h from last write) and swept by a background task;
//! a failed draft save never fails the request. Versions are immutable rows
//! with strictly increasing numbers per graph id; committing an already-stored
//! content hash is idempotent. Commits are authorised through the oracle and
//! audited.

mod draft;
mod version;

pub use draft::{spawn_draft_sweeper, DraftCheckpointer, InMemoryDraftStore, DRAFT_TTL, SWEEP_INTERVAL};
pub use version::{SqliteVersionStore, VersionRecord};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::audit::{AuditDraft, AuditLog};
use crate::authz::{AuthzError, AuthzOracle, ObjectRef, Relation};
use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("denied")]
    Denied,

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("storage: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Denied => ErrorKind::Unauthorized,
            StoreError::Serialization(_) | StoreError::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl From<AuthzError> for StoreError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::Denied => StoreError::Denied,
            AuthzError::Backend(msg) => StoreError::Storage(msg),
        }
    }
}

/// Ephemeral per-conversation snapshots. Writes overwrite; no history.
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Saves (or overwrites) a snapshot, resetting the key's TTL.
    async fn save(&self, key: &str, owner: &str, snapshot: Value) -> Result<(), StoreError>;

    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn list(&self, owner: &str) -> Result<Vec<String>, StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Drops expired entries; returns how many were evicted.
    async fn evict_expired(&self) -> Result<usize, StoreError>;
}

/// Committed immutable versions of one graph.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Commits a snapshot. Returns the existing version when the content hash
    /// is already stored for this graph id.
    async fn commit(
        &self,
        graph_id: &str,
        snapshot: &Value,
        message: &str,
        actor: &str,
    ) -> Result<VersionRecord, StoreError>;

    /// Versions in ascending order, capped at `limit` when given.
    async fn list_versions(
        &self,
        graph_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<VersionRecord>, StoreError>;

    async fn get(&self, graph_id: &str, version: i64) -> Result<Value, StoreError>;

    /// Re-commits an old snapshot as a new version whose `parent_hash` is the
    /// restored content hash. Later versions are not deleted.
    async fn restore(
        &self,
        graph_id: &str,
        version: i64,
        actor: &str,
    ) -> Result<VersionRecord, StoreError>;
}

/// Authorised, audited front over the two stores.
///
/// **Interaction**: part of [`crate::runtime::Resources`]. Draft operations are
/// unguarded (keys are request/session scoped); `commit` and `restore` require
/// `can_update` on the session object and are audited.
pub struct SessionStore {
    drafts: Arc<dyn DraftStore>,
    versions: Arc<dyn VersionStore>,
    authz: Arc<AuthzOracle>,
    audit: AuditLog,
}

impl SessionStore {
    pub fn new(
        drafts: Arc<dyn DraftStore>,
        versions: Arc<dyn VersionStore>,
        authz: Arc<AuthzOracle>,
        audit: AuditLog,
    ) -> Self {
        Self {
            drafts,
            versions,
            authz,
            audit,
        }
    }

    pub fn drafts(&self) -> &Arc<dyn DraftStore> {
        &self.drafts
    }

    pub fn versions(&self) -> &Arc<dyn VersionStore> {
        &self.versions
    }

    async fn require_commit(
        &self,
        request_id: &str,
        tenant: &str,
        actor: &str,
        graph_id: &str,
        action: &str,
    ) -> Result<(), StoreError> {
        match self
            .authz
            .require(actor, Relation::CanUpdate, &ObjectRef::session(graph_id))
            .await
        {
            Ok(()) => Ok(()),
            Err(AuthzError::Denied) => {
                self.audit.record(
                    AuditDraft::new(request_id, tenant, actor, "auth.deny")
                        .resource("session", graph_id)
                        .outcome("denied"),
                );
                self.audit.record(
                    AuditDraft::new(request_id, tenant, actor, action)
                        .resource("session", graph_id)
                        .outcome("denied"),
                );
                Err(StoreError::Denied)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Authorised commit. Fatal to the caller on backend failure.
    pub async fn commit(
        &self,
        request_id: &str,
        tenant: &str,
        actor: &str,
        graph_id: &str,
        snapshot: &Value,
        message: &str,
    ) -> Result<VersionRecord, StoreError> {
        self.require_commit(request_id, tenant, actor, graph_id, "session.commit")
            .await?;
        let record = self.versions.commit(graph_id, snapshot, message, actor).await?;
        self.audit.record(
            AuditDraft::new(request_id, tenant, actor, "session.commit")
                .resource("session", graph_id)
                .metadata(serde_json::json!({
                    "version": record.version,
                    "content_hash": record.content_hash,
                })),
        );
        Ok(record)
    }

    /// Authorised restore; a new version, never a rewind.
    pub async fn restore(
        &self,
        request_id: &str,
        tenant: &str,
        actor: &str,
        graph_id: &str,
        version: i64,
    ) -> Result<VersionRecord, StoreError> {
        self.require_commit(request_id, tenant, actor, graph_id, "session.restore")
            .await?;
        let record = self.versions.restore(graph_id, version, actor).await?;
        self.audit.record(
            AuditDraft::new(request_id, tenant, actor, "session.restore")
                .resource("session", graph_id)
                .metadata(serde_json::json!({
                    "version": record.version,
                    "content_hash": record.content_hash,
                })),
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::authz::{AuthzOracle, ObjectType, StaticAuthzBackend};

    fn store_with(authz_backend: StaticAuthzBackend) -> (SessionStore, Arc<MemoryAuditSink>, AuditLog) {
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = AuditLog::new(sink.clone());
        let authz = Arc::new(AuthzOracle::new(Arc::new(authz_backend)));
        let store = SessionStore::new(
            Arc::new(InMemoryDraftStore::new()),
            Arc::new(SqliteVersionStore::in_memory().unwrap()),
            authz,
            audit.clone(),
        );
        (store, sink, audit)
    }

    /// **Scenario**: An authorised commit lands a version and an audit entry.
    #[tokio::test]
    async fn authorised_commit_is_audited() {
        let backend = StaticAuthzBackend::new().grant(
            "alice",
            Relation::CanUpdate,
            &ObjectRef::new(ObjectType::Session, "g1"),
        );
        let (store, sink, audit) = store_with(backend);

        let record = store
            .commit("req-1", "acme", "alice", "g1", &serde_json::json!({"rev": 1}), "init")
            .await
            .unwrap();
        assert_eq!(record.version, 1);

        audit.flush_once().await.unwrap();
        assert!(sink
            .raw_entries()
            .iter()
            .any(|e| e.action == "session.commit" && e.outcome == "ok"));
    }

    /// **Scenario**: A commit without can_update is denied, audited, and never
    /// reaches the version store.
    #[tokio::test]
    async fn unauthorised_commit_is_denied() {
        let (store, sink, audit) = store_with(StaticAuthzBackend::new());

        let err = store
            .commit("req-1", "acme", "mallory", "g1", &serde_json::json!({}), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Denied));
        assert!(store.versions().list_versions("g1", None).await.unwrap().is_empty());

        audit.flush_once().await.unwrap();
        let entries = sink.raw_entries();
        assert!(entries.iter().any(|e| e.action == "auth.deny"));
        assert!(entries
            .iter()
            .any(|e| e.action == "session.commit" && e.outcome == "denied"));
    }

    /// **Scenario**: Restore through the authorised front produces the new
    /// version and its audit entry.
    #[tokio::test]
    async fn authorised_restore() {
        let backend = StaticAuthzBackend::new().grant(
            "alice",
            Relation::CanUpdate,
            &ObjectRef::new(ObjectType::Session, "g1"),
        );
        let (store, _sink, _audit) = store_with(backend);

        store
            .commit("req-1", "acme", "alice", "g1", &serde_json::json!({"rev": 1}), "m1")
            .await
            .unwrap();
        store
            .commit("req-2", "acme", "alice", "g1", &serde_json::json!({"rev": 2}), "m2")
            .await
            .unwrap();
        let restored = store.restore("req-3", "acme", "alice", "g1", 1).await.unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(
            store.versions().get("g1", 3).await.unwrap(),
            store.versions().get("g1", 1).await.unwrap()
        );
    }
}
