//! Relationship-based authorization oracle.
//!
//! Answers "may actor A perform relation R on object O?". Objects are typed;
//! relations are direct (`owner`, `admin`, `viewer`, `executor`) or computed
//! (`can_execute`, `can_update`, `can_read`). Every write to the secret store,
//! every session commit, and every tool-kind node execution is gated on a
//! successful check. Decisions can be cached with a TTL capped at 60 seconds.

mod backend;

pub use backend::{HttpAuthzBackend, StaticAuthzBackend};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Typed object kinds the oracle knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Organization,
    Domain,
    Agent,
    Secret,
    Session,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Organization => "organization",
            ObjectType::Domain => "domain",
            ObjectType::Agent => "agent",
            ObjectType::Secret => "secret",
            ObjectType::Session => "session",
        }
    }
}

/// A typed object reference, e.g. `secret:prod/acme/api_key`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: ObjectType,
    pub id: String,
}

impl ObjectRef {
    pub fn new(object_type: ObjectType, id: impl Into<String>) -> Self {
        Self {
            object_type,
            id: id.into(),
        }
    }

    pub fn secret(id: impl Into<String>) -> Self {
        Self::new(ObjectType::Secret, id)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(ObjectType::Agent, id)
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self::new(ObjectType::Session, id)
    }

    /// `type:id` key used in caches and tuple stores.
    pub fn key(&self) -> String {
        format!("{}:{}", self.object_type.as_str(), self.id)
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.object_type.as_str(), self.id)
    }
}

/// Relations: direct grants plus computed permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Owner,
    Admin,
    Viewer,
    Executor,
    CanExecute,
    CanUpdate,
    CanRead,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Owner => "owner",
            Relation::Admin => "admin",
            Relation::Viewer => "viewer",
            Relation::Executor => "executor",
            Relation::CanExecute => "can_execute",
            Relation::CanUpdate => "can_update",
            Relation::CanRead => "can_read",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    /// The check came back false. Rendered opaquely to the actor.
    #[error("denied")]
    Denied,

    #[error("authorization backend: {0}")]
    Backend(String),
}

/// Answers point checks and object listings.
#[async_trait]
pub trait AuthzBackend: Send + Sync {
    async fn check(
        &self,
        actor: &str,
        relation: Relation,
        object: &ObjectRef,
    ) -> Result<bool, AuthzError>;

    async fn list_objects(
        &self,
        actor: &str,
        relation: Relation,
        object_type: ObjectType,
    ) -> Result<Vec<ObjectRef>, AuthzError>;
}

struct CachedDecision {
    allowed: bool,
    stored_at: Instant,
}

/// Caching front over an [`AuthzBackend`].
///
/// The cache key includes the actor, so decisions never leak across actors.
/// The runtime request path uses only [`check`](Self::check) /
/// [`require`](Self::require); `list_objects` exists for UI filtering.
pub struct AuthzOracle {
    backend: Arc<dyn AuthzBackend>,
    cache: DashMap<(String, Relation, String), CachedDecision>,
    ttl: Duration,
}

impl AuthzOracle {
    /// Hard cap on the decision cache TTL.
    pub const MAX_TTL: Duration = Duration::from_secs(60);

    pub fn new(backend: Arc<dyn AuthzBackend>) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            ttl: Duration::from_secs(30),
        }
    }

    /// Sets the decision TTL, clamped to [`Self::MAX_TTL`]. Zero disables caching.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.min(Self::MAX_TTL);
        self
    }

    pub async fn check(
        &self,
        actor: &str,
        relation: Relation,
        object: &ObjectRef,
    ) -> Result<bool, AuthzError> {
        let key = (actor.to_string(), relation, object.key());
        if self.ttl > Duration::ZERO {
            if let Some(hit) = self.cache.get(&key) {
                if hit.stored_at.elapsed() < self.ttl {
                    return Ok(hit.allowed);
                }
            }
        }
        let allowed = self.backend.check(actor, relation, object).await?;
        if self.ttl > Duration::ZERO {
            self.cache.insert(
                key,
                CachedDecision {
                    allowed,
                    stored_at: Instant::now(),
                },
            );
        }
        Ok(allowed)
    }

    /// Like [`check`](Self::check) but a false decision is an error.
    pub async fn require(
        &self,
        actor: &str,
        relation: Relation,
        object: &ObjectRef,
    ) -> Result<(), AuthzError> {
        if self.check(actor, relation, object).await? {
            Ok(())
        } else {
            Err(AuthzError::Denied)
        }
    }

    pub async fn list_objects(
        &self,
        actor: &str,
        relation: Relation,
        object_type: ObjectType,
    ) -> Result<Vec<ObjectRef>, AuthzError> {
        self.backend.list_objects(actor, relation, object_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        calls: AtomicUsize,
        answer: bool,
    }

    #[async_trait]
    impl AuthzBackend for CountingBackend {
        async fn check(&self, _: &str, _: Relation, _: &ObjectRef) -> Result<bool, AuthzError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }

        async fn list_objects(
            &self,
            _: &str,
            _: Relation,
            _: ObjectType,
        ) -> Result<Vec<ObjectRef>, AuthzError> {
            Ok(vec![])
        }
    }

    /// **Scenario**: Repeated identical checks within the TTL hit the backend once.
    #[tokio::test]
    async fn cache_deduplicates_checks() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            answer: true,
        });
        let oracle = AuthzOracle::new(backend.clone());
        let obj = ObjectRef::secret("prod/acme/key");
        for _ in 0..3 {
            assert!(oracle.check("u1", Relation::CanRead, &obj).await.unwrap());
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    /// **Scenario**: The cache key includes the actor; a second actor triggers its own check.
    #[tokio::test]
    async fn cache_is_actor_scoped() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            answer: true,
        });
        let oracle = AuthzOracle::new(backend.clone());
        let obj = ObjectRef::secret("prod/acme/key");
        oracle.check("u1", Relation::CanRead, &obj).await.unwrap();
        oracle.check("u2", Relation::CanRead, &obj).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    /// **Scenario**: The TTL is clamped to 60 seconds.
    #[test]
    fn ttl_is_clamped() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            answer: true,
        });
        let oracle = AuthzOracle::new(backend).with_ttl(Duration::from_secs(600));
        assert_eq!(oracle.ttl, AuthzOracle::MAX_TTL);
    }

    /// **Scenario**: require turns a false decision into Denied.
    #[tokio::test]
    async fn require_denies() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            answer: false,
        });
        let oracle = AuthzOracle::new(backend);
        let err = oracle
            .require("u1", Relation::CanUpdate, &ObjectRef::secret("p"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Denied));
    }
}
