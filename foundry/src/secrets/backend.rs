//! Secret backends: the HTTP store client and an in-memory map for tests/dev.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;

use crate::registry::Endpoint;

use super::{SecretBackend, SecretError, SecretStatus};

/// In-memory backend. Values live for the process lifetime.
#[derive(Default)]
pub struct MemorySecretBackend {
    values: DashMap<String, (String, DateTime<Utc>)>,
}

impl MemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a value without the authorised client path. Test fixtures only.
    pub fn seed(&self, path: impl Into<String>, value: impl Into<String>) {
        self.values.insert(path.into(), (value.into(), Utc::now()));
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn get_value(&self, path: &str) -> Result<Option<String>, SecretError> {
        Ok(self.values.get(path).map(|e| e.0.clone()))
    }

    async fn put_value(&self, path: &str, value: String) -> Result<(), SecretError> {
        self.values.insert(path.to_string(), (value, Utc::now()));
        Ok(())
    }

    async fn describe(&self, path: &str) -> Result<Option<SecretStatus>, SecretError> {
        Ok(self.values.get(path).map(|e| SecretStatus {
            configured: true,
            last_rotated: Some(e.1),
        }))
    }

    async fn delete(&self, path: &str) -> Result<(), SecretError> {
        self.values.remove(path);
        Ok(())
    }
}

/// HTTP client for the secret store's `get_value` / `put_value` / `describe` /
/// `delete` endpoints. All transport failures surface as retriable backend
/// errors; the client above owns the retry budget.
pub struct HttpSecretBackend {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GetValueResponse {
    value: String,
}

#[derive(Deserialize)]
struct DescribeResponse {
    configured: bool,
    #[serde(default)]
    last_rotated: Option<DateTime<Utc>>,
}

impl HttpSecretBackend {
    pub fn new(endpoint: &Endpoint) -> Self {
        Self {
            base_url: endpoint.base_url(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, op: &str) -> String {
        format!("{}/v1/secrets/{op}", self.base_url)
    }
}

#[async_trait]
impl SecretBackend for HttpSecretBackend {
    async fn get_value(&self, path: &str) -> Result<Option<String>, SecretError> {
        let response = self
            .client
            .post(self.url("get_value"))
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await
            .map_err(|e| SecretError::Backend(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| SecretError::Backend(e.to_string()))?
            .json::<GetValueResponse>()
            .await
            .map_err(|e| SecretError::Backend(e.to_string()))?;
        Ok(Some(response.value))
    }

    async fn put_value(&self, path: &str, value: String) -> Result<(), SecretError> {
        self.client
            .post(self.url("put_value"))
            .json(&serde_json::json!({ "path": path, "value": value }))
            .send()
            .await
            .map_err(|e| SecretError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| SecretError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn describe(&self, path: &str) -> Result<Option<SecretStatus>, SecretError> {
        let response = self
            .client
            .post(self.url("describe"))
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await
            .map_err(|e| SecretError::Backend(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| SecretError::Backend(e.to_string()))?
            .json::<DescribeResponse>()
            .await
            .map_err(|e| SecretError::Backend(e.to_string()))?;
        Ok(Some(SecretStatus {
            configured: response.configured,
            last_rotated: response.last_rotated,
        }))
    }

    async fn delete(&self, path: &str) -> Result<(), SecretError> {
        self.client
            .post(self.url("delete"))
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await
            .map_err(|e| SecretError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| SecretError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Memory backend round-trips values and reports status.
    #[tokio::test]
    async fn memory_backend_round_trip() {
        let backend = MemorySecretBackend::new();
        assert_eq!(backend.get_value("prod/acme/k").await.unwrap(), None);

        backend.put_value("prod/acme/k", "v1".into()).await.unwrap();
        assert_eq!(
            backend.get_value("prod/acme/k").await.unwrap().as_deref(),
            Some("v1")
        );

        let status = backend.describe("prod/acme/k").await.unwrap().unwrap();
        assert!(status.configured);
        assert!(status.last_rotated.is_some());

        backend.delete("prod/acme/k").await.unwrap();
        assert_eq!(backend.get_value("prod/acme/k").await.unwrap(), None);
    }
}
