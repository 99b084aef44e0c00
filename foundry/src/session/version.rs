//! SQLite-backed version store: the `graph_versions` table.
//!
//! Rows are immutable; `version` is strictly increasing per `graph_id`;
//! `content_hash` is the canonical-JSON SHA-256 of the snapshot. Commit of an
//! already-stored hash returns the existing row. All connection use goes
//! through `spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::state::content_hash;

use super::{StoreError, VersionStore};

/// One committed version row (without the blob).
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct VersionRecord {
    pub graph_id: String,
    pub version: i64,
    pub content_hash: String,
    pub parent_hash: Option<String>,
    pub committed_at: DateTime<Utc>,
    pub committed_by: String,
    pub message: String,
}

/// Holds one connection behind a mutex; in-memory databases stay alive that
/// way, and version writes for one process are serialised anyway.
pub struct SqliteVersionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVersionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // No UNIQUE(graph_id, content_hash) constraint here:
        // restore re-commits an existing hash as a new version; idempotence of
        // plain commits is enforced by lookup instead.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS graph_versions (
                graph_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                parent_hash TEXT,
                committed_at TEXT NOT NULL,
                committed_by TEXT NOT NULL,
                message TEXT NOT NULL,
                blob TEXT NOT NULL,
                PRIMARY KEY (graph_id, version)
            )
            "#,
            [],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = match conn.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRecord> {
    let committed_at: String = row.get(4)?;
    Ok(VersionRecord {
        graph_id: row.get(0)?,
        version: row.get(1)?,
        content_hash: row.get(2)?,
        parent_hash: row.get(3)?,
        committed_at: committed_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        committed_by: row.get(5)?,
        message: row.get(6)?,
    })
}

const RECORD_COLUMNS: &str =
    "graph_id, version, content_hash, parent_hash, committed_at, committed_by, message";

fn insert_version(
    conn: &Connection,
    graph_id: &str,
    snapshot_json: &str,
    hash: &str,
    parent_hash: Option<&str>,
    message: &str,
    actor: &str,
) -> Result<VersionRecord, StoreError> {
    let next_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM graph_versions WHERE graph_id = ?1",
            params![graph_id],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
    let committed_at = Utc::now();
    conn.execute(
        r#"
        INSERT INTO graph_versions
            (graph_id, version, content_hash, parent_hash, committed_at, committed_by, message, blob)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            graph_id,
            next_version,
            hash,
            parent_hash,
            committed_at.to_rfc3339(),
            actor,
            message,
            snapshot_json,
        ],
    )
    .map_err(|e| StoreError::Storage(e.to_string()))?;
    Ok(VersionRecord {
        graph_id: graph_id.to_string(),
        version: next_version,
        content_hash: hash.to_string(),
        parent_hash: parent_hash.map(str::to_string),
        committed_at,
        committed_by: actor.to_string(),
        message: message.to_string(),
    })
}

#[async_trait]
impl VersionStore for SqliteVersionStore {
    async fn commit(
        &self,
        graph_id: &str,
        snapshot: &Value,
        message: &str,
        actor: &str,
    ) -> Result<VersionRecord, StoreError> {
        let hash = content_hash(snapshot);
        let snapshot_json =
            serde_json::to_string(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let graph_id = graph_id.to_string();
        let message = message.to_string();
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            // Idempotent commit: an already-stored hash returns its earliest version.
            let existing = conn
                .query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM graph_versions
                         WHERE graph_id = ?1 AND content_hash = ?2
                         ORDER BY version ASC LIMIT 1"
                    ),
                    params![graph_id, hash],
                    row_to_record,
                )
                .optional()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            if let Some(record) = existing {
                return Ok(record);
            }
            let parent_hash: Option<String> = conn
                .query_row(
                    "SELECT content_hash FROM graph_versions
                     WHERE graph_id = ?1 ORDER BY version DESC LIMIT 1",
                    params![graph_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            insert_version(
                conn,
                &graph_id,
                &snapshot_json,
                &hash,
                parent_hash.as_deref(),
                &message,
                &actor,
            )
        })
        .await
    }

    async fn list_versions(
        &self,
        graph_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let graph_id = graph_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM graph_versions
                     WHERE graph_id = ?1 ORDER BY version ASC"
                ))
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![graph_id], row_to_record)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(|e| StoreError::Storage(e.to_string()))?);
                if let Some(limit) = limit {
                    if records.len() >= limit {
                        break;
                    }
                }
            }
            Ok(records)
        })
        .await
    }

    async fn get(&self, graph_id: &str, version: i64) -> Result<Value, StoreError> {
        let graph_id = graph_id.to_string();
        self.with_conn(move |conn| {
            let blob: Option<String> = conn
                .query_row(
                    "SELECT blob FROM graph_versions WHERE graph_id = ?1 AND version = ?2",
                    params![graph_id, version],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let blob =
                blob.ok_or_else(|| StoreError::NotFound(format!("{graph_id}@{version}")))?;
            serde_json::from_str(&blob).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .await
    }

    async fn restore(
        &self,
        graph_id: &str,
        version: i64,
        actor: &str,
    ) -> Result<VersionRecord, StoreError> {
        let graph_id = graph_id.to_string();
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT blob, content_hash FROM graph_versions
                     WHERE graph_id = ?1 AND version = ?2",
                    params![graph_id, version],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let (blob, hash) =
                row.ok_or_else(|| StoreError::NotFound(format!("{graph_id}@{version}")))?;
            insert_version(
                conn,
                &graph_id,
                &blob,
                &hash,
                Some(&hash),
                &format!("restore of v{version}"),
                &actor,
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteVersionStore {
        SqliteVersionStore::in_memory().unwrap()
    }

    /// **Scenario**: Committing the same snapshot twice returns the same
    /// (version, content_hash) pair.
    #[tokio::test]
    async fn commit_is_idempotent() {
        let store = store().await;
        let snapshot = json!({"nodes": ["io_in", "io_out"]});
        let first = store.commit("g", &snapshot, "init", "alice").await.unwrap();
        let second = store.commit("g", &snapshot, "again", "bob").await.unwrap();
        assert_eq!(first.version, second.version);
        assert_eq!(first.content_hash, second.content_hash);
    }

    /// **Scenario**: Versions increase strictly and carry the parent's hash.
    #[tokio::test]
    async fn versions_increase_with_parent_chain() {
        let store = store().await;
        let v1 = store.commit("g", &json!({"rev": 1}), "m1", "a").await.unwrap();
        let v2 = store.commit("g", &json!({"rev": 2}), "m2", "a").await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v1.parent_hash, None);
        assert_eq!(v2.parent_hash.as_deref(), Some(v1.content_hash.as_str()));
    }

    /// **Scenario**: S5 — restore(g, 1) after v1 (hash A) and v2 (hash B)
    /// produces v3 with content_hash = parent_hash = A; list shows all three;
    /// get(g, 3) equals get(g, 1) by content.
    #[tokio::test]
    async fn restore_recommits_old_content() {
        let store = store().await;
        let v1 = store.commit("g", &json!({"rev": 1}), "m1", "a").await.unwrap();
        let _v2 = store.commit("g", &json!({"rev": 2}), "m2", "a").await.unwrap();

        let v3 = store.restore("g", 1, "a").await.unwrap();
        assert_eq!(v3.version, 3);
        assert_eq!(v3.content_hash, v1.content_hash);
        assert_eq!(v3.parent_hash.as_deref(), Some(v1.content_hash.as_str()));

        let versions = store.list_versions("g", None).await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            store.get("g", 3).await.unwrap(),
            store.get("g", 1).await.unwrap()
        );
    }

    /// **Scenario**: Reading a missing version is NotFound.
    #[tokio::test]
    async fn get_missing_version() {
        let store = store().await;
        let err = store.get("g", 9).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    /// **Scenario**: Version numbering is per graph id.
    #[tokio::test]
    async fn numbering_is_per_graph() {
        let store = store().await;
        let a1 = store.commit("a", &json!(1), "m", "x").await.unwrap();
        let b1 = store.commit("b", &json!(2), "m", "x").await.unwrap();
        assert_eq!(a1.version, 1);
        assert_eq!(b1.version, 1);
    }
}
