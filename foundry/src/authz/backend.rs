//! Authorization backends: the HTTP store client and a static in-memory
//! implementation for tests and dev mode.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;

use crate::registry::Endpoint;

use super::{AuthzBackend, AuthzError, ObjectRef, ObjectType, Relation};

/// In-memory tuple store with the organisation hierarchy.
///
/// Direct tuples are `(actor, relation, object-key)`. Computed relations
/// resolve against the object's own grants or `admin`/`owner` grants on any
/// ancestor: an org admin manages the org's domains and their agents, secrets,
/// and sessions.
#[derive(Default)]
pub struct StaticAuthzBackend {
    tuples: HashSet<(String, Relation, String)>,
    /// child object key -> parent object key
    parents: HashMap<String, String>,
    allow_all: bool,
}

impl StaticAuthzBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every check passes. Dev-mode default; never for production manifests.
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Self::default()
        }
    }

    pub fn grant(mut self, actor: impl Into<String>, relation: Relation, object: &ObjectRef) -> Self {
        self.tuples.insert((actor.into(), relation, object.key()));
        self
    }

    pub fn parent(mut self, child: &ObjectRef, parent: &ObjectRef) -> Self {
        self.parents.insert(child.key(), parent.key());
        self
    }

    fn has_direct(&self, actor: &str, relation: Relation, key: &str) -> bool {
        self.tuples
            .contains(&(actor.to_string(), relation, key.to_string()))
    }

    /// True when the actor holds admin or owner on the object or any ancestor.
    fn manages(&self, actor: &str, key: &str) -> bool {
        let mut current = Some(key.to_string());
        // parent chains are short (agent -> domain -> organization); the bound
        // guards against accidental cycles in test fixtures.
        let mut hops = 0;
        while let Some(k) = current {
            if hops > 8 {
                return false;
            }
            if self.has_direct(actor, Relation::Admin, &k)
                || self.has_direct(actor, Relation::Owner, &k)
            {
                return true;
            }
            current = self.parents.get(&k).cloned();
            hops += 1;
        }
        false
    }

    fn evaluate(&self, actor: &str, relation: Relation, object: &ObjectRef) -> bool {
        if self.allow_all {
            return true;
        }
        let key = object.key();
        match relation {
            Relation::Owner | Relation::Admin | Relation::Viewer | Relation::Executor => {
                self.has_direct(actor, relation, &key)
            }
            Relation::CanRead => {
                self.has_direct(actor, Relation::Viewer, &key)
                    || self.has_direct(actor, Relation::CanRead, &key)
                    || self.manages(actor, &key)
            }
            Relation::CanUpdate => {
                self.has_direct(actor, Relation::CanUpdate, &key) || self.manages(actor, &key)
            }
            Relation::CanExecute => {
                self.has_direct(actor, Relation::Executor, &key)
                    || self.has_direct(actor, Relation::CanExecute, &key)
                    || self.manages(actor, &key)
            }
        }
    }
}

#[async_trait]
impl AuthzBackend for StaticAuthzBackend {
    async fn check(
        &self,
        actor: &str,
        relation: Relation,
        object: &ObjectRef,
    ) -> Result<bool, AuthzError> {
        Ok(self.evaluate(actor, relation, object))
    }

    async fn list_objects(
        &self,
        actor: &str,
        relation: Relation,
        object_type: ObjectType,
    ) -> Result<Vec<ObjectRef>, AuthzError> {
        let prefix = format!("{}:", object_type.as_str());
        Ok(self
            .tuples
            .iter()
            .filter(|(a, r, key)| a == actor && *r == relation && key.starts_with(&prefix))
            .map(|(_, _, key)| ObjectRef::new(object_type, &key[prefix.len()..]))
            .collect())
    }
}

/// HTTP client for the authorization store's `check` / `list_objects` endpoints.
pub struct HttpAuthzBackend {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CheckResponse {
    allowed: bool,
}

#[derive(Deserialize)]
struct ListObjectsResponse {
    objects: Vec<WireObject>,
}

#[derive(Deserialize)]
struct WireObject {
    #[serde(rename = "type")]
    object_type: ObjectType,
    id: String,
}

impl HttpAuthzBackend {
    pub fn new(endpoint: &Endpoint) -> Self {
        Self {
            base_url: endpoint.base_url(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AuthzBackend for HttpAuthzBackend {
    async fn check(
        &self,
        actor: &str,
        relation: Relation,
        object: &ObjectRef,
    ) -> Result<bool, AuthzError> {
        let body = serde_json::json!({
            "actor": actor,
            "relation": relation.as_str(),
            "object_type": object.object_type.as_str(),
            "object_id": object.id,
        });
        let response = self
            .client
            .post(format!("{}/v1/check", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthzError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| AuthzError::Backend(e.to_string()))?
            .json::<CheckResponse>()
            .await
            .map_err(|e| AuthzError::Backend(e.to_string()))?;
        Ok(response.allowed)
    }

    async fn list_objects(
        &self,
        actor: &str,
        relation: Relation,
        object_type: ObjectType,
    ) -> Result<Vec<ObjectRef>, AuthzError> {
        let body = serde_json::json!({
            "actor": actor,
            "relation": relation.as_str(),
            "object_type": object_type.as_str(),
        });
        let response = self
            .client
            .post(format!("{}/v1/list_objects", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthzError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| AuthzError::Backend(e.to_string()))?
            .json::<ListObjectsResponse>()
            .await
            .map_err(|e| AuthzError::Backend(e.to_string()))?;
        Ok(response
            .objects
            .into_iter()
            .map(|o| ObjectRef::new(o.object_type, o.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: An org admin inherits management of the org's domains and
    /// their agents and secrets via computed relations.
    #[tokio::test]
    async fn admin_inherits_through_hierarchy() {
        let org = ObjectRef::new(ObjectType::Organization, "acme");
        let domain = ObjectRef::new(ObjectType::Domain, "acme/support");
        let agent = ObjectRef::agent("acme/support/helper");
        let secret = ObjectRef::secret("prod/acme/support/api_key");

        let backend = StaticAuthzBackend::new()
            .grant("alice", Relation::Admin, &org)
            .parent(&domain, &org)
            .parent(&agent, &domain)
            .parent(&secret, &domain);

        for (relation, object) in [
            (Relation::CanRead, &secret),
            (Relation::CanUpdate, &secret),
            (Relation::CanExecute, &agent),
        ] {
            assert!(
                backend.check("alice", relation, object).await.unwrap(),
                "alice should hold {relation:?} on {object}"
            );
        }
        assert!(!backend.check("mallory", Relation::CanRead, &secret).await.unwrap());
    }

    /// **Scenario**: A direct executor grant confers can_execute but not can_update.
    #[tokio::test]
    async fn executor_grant_is_narrow() {
        let agent = ObjectRef::agent("acme/pm");
        let backend = StaticAuthzBackend::new().grant("bot", Relation::Executor, &agent);
        assert!(backend.check("bot", Relation::CanExecute, &agent).await.unwrap());
        assert!(!backend.check("bot", Relation::CanUpdate, &agent).await.unwrap());
    }

    /// **Scenario**: list_objects returns only the actor's grants of the requested type.
    #[tokio::test]
    async fn list_objects_filters_by_type() {
        let backend = StaticAuthzBackend::new()
            .grant("alice", Relation::Viewer, &ObjectRef::agent("a1"))
            .grant("alice", Relation::Viewer, &ObjectRef::secret("s1"))
            .grant("bob", Relation::Viewer, &ObjectRef::agent("a2"));
        let objects = backend
            .list_objects("alice", Relation::Viewer, ObjectType::Agent)
            .await
            .unwrap();
        assert_eq!(objects, vec![ObjectRef::agent("a1")]);
    }
}
