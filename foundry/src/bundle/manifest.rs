//! Instance Manifest: the human-editable declaration of one runtime instance.
//! YAML on disk; JSON parses identically.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::BundleError;

pub const API_VERSION: &str = "foundry/v1";
pub const MANIFEST_KIND: &str = "InstanceManifest";

/// One tool binding declaration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManifestTool {
    pub name: String,
    /// Logical service name or literal URL.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_cap: Option<usize>,
}

/// One secret scope the instance may read.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManifestSecret {
    pub name: String,
    /// `tenant` or `tenant/domain`.
    pub scope: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceManifest {
    pub api_version: String,
    pub kind: String,
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub environment: String,
    pub instance: String,
    /// Content-hash ref of the pipeline spec blob.
    pub graph: String,
    /// Content-hash refs of worker descriptor blobs.
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ManifestTool>,
    #[serde(default)]
    pub secrets: Vec<ManifestSecret>,
}

impl InstanceManifest {
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.kind != MANIFEST_KIND {
            return Err(BundleError::Manifest(format!(
                "kind must be '{MANIFEST_KIND}', got '{}'",
                self.kind
            )));
        }
        if self.api_version != API_VERSION {
            return Err(BundleError::Manifest(format!(
                "unsupported apiVersion '{}'",
                self.api_version
            )));
        }
        if self.tenant.is_empty() {
            return Err(BundleError::Manifest("tenant must not be empty".into()));
        }
        if self.graph.is_empty() {
            return Err(BundleError::Manifest("graph ref must not be empty".into()));
        }
        for secret in &self.secrets {
            let in_tenant = secret.scope == self.tenant
                || secret.scope.starts_with(&format!("{}/", self.tenant));
            if !in_tenant {
                return Err(BundleError::Manifest(format!(
                    "secret '{}' scope '{}' lies outside tenant '{}'",
                    secret.name, secret.scope, self.tenant
                )));
            }
        }
        Ok(())
    }
}

/// Reads and validates a manifest file (YAML or JSON).
pub fn load_manifest(path: impl AsRef<Path>) -> Result<InstanceManifest, BundleError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let manifest: InstanceManifest =
        serde_yaml::from_str(&content).map_err(|e| BundleError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    manifest.validate()?;
    Ok(manifest)
}
