//! Boot: environment → manifest → bundle → runtime instance.
//!
//! Failure classes map to the server exit codes: 64 for manifest/bundle
//! problems, 65 for configuration problems, 70 for anything else.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use foundry::authz::HttpAuthzBackend;
use foundry::bundle::{build_instance, load_manifest, Bundle, BundleError, WorkerRegistry};
use foundry::secrets::HttpSecretBackend;
use foundry::session::SqliteVersionStore;
use foundry::tool::HttpToolTransport;
use foundry::{JsonlAuditSink, Resources, RuntimeInstance, ServiceRegistry};

/// Manifest file path. Required.
pub const ENV_MANIFEST: &str = "FOUNDRY_MANIFEST";
/// Bundle directory. Required.
pub const ENV_BUNDLE_DIR: &str = "FOUNDRY_BUNDLE_DIR";
/// Optional JSONL audit sink path; in-memory sink when unset.
pub const ENV_AUDIT_LOG: &str = "FOUNDRY_AUDIT_LOG";
/// Optional sqlite path for graph versions; in-memory when unset.
pub const ENV_VERSIONS_DB: &str = "FOUNDRY_VERSIONS_DB";

#[derive(Debug, Error)]
pub enum BootError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Bundle(#[from] BundleError),
}

/// Exit code: 64 manifest/bundle, 65 configuration, 70 internal.
pub fn exit_code(err: &BootError) -> i32 {
    match err {
        BootError::Bundle(_) => 64,
        BootError::Configuration(_) => 65,
    }
}

fn required_env(key: &str) -> Result<String, BootError> {
    std::env::var(key).map_err(|_| BootError::Configuration(format!("{key} is not set")))
}

/// Builds the runtime instance: loads the manifest and bundle, compiles the
/// pipeline, and wires backends from the service registry snapshot.
pub async fn boot(workers: WorkerRegistry) -> Result<RuntimeInstance, BootError> {
    let registry = ServiceRegistry::from_env()
        .map_err(|e| BootError::Configuration(e.to_string()))?;

    let manifest_path = required_env(ENV_MANIFEST)?;
    let bundle_dir = required_env(ENV_BUNDLE_DIR)?;

    let manifest = load_manifest(&manifest_path)?;
    let bundle = Bundle::open(&bundle_dir)?;
    let plan = build_instance(manifest, &bundle, &workers)?;
    info!(
        tenant = %plan.manifest.tenant,
        instance = %plan.manifest.instance,
        environment = %plan.manifest.environment,
        "manifest loaded and pipeline compiled"
    );

    let mut builder = Resources::builder().registry(registry.clone());
    builder = builder.tool_transport(Arc::new(HttpToolTransport::new(Arc::new(registry.clone()))));

    match registry.resolve("secret_store") {
        Ok(endpoint) => {
            builder = builder.secret_backend(Arc::new(HttpSecretBackend::new(&endpoint)));
        }
        Err(_) => warn!("no secret_store endpoint configured; using in-memory secrets"),
    }
    match registry.resolve("authz") {
        Ok(endpoint) => {
            builder = builder.authz_backend(Arc::new(HttpAuthzBackend::new(&endpoint)));
        }
        Err(_) => warn!("no authz endpoint configured; allowing all (dev only)"),
    }
    if let Ok(path) = std::env::var(ENV_AUDIT_LOG) {
        builder = builder.audit_sink(Arc::new(JsonlAuditSink::new(path)));
    }
    if let Ok(path) = std::env::var(ENV_VERSIONS_DB) {
        let store = SqliteVersionStore::open(path)
            .map_err(|e| BootError::Configuration(e.to_string()))?;
        builder = builder.versions(Arc::new(store));
    }

    Ok(RuntimeInstance::from_plan(plan, builder))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Missing manifest env is a configuration error (exit 65);
    /// bundle problems map to 64.
    #[test]
    fn exit_codes() {
        let config = BootError::Configuration("x".into());
        assert_eq!(exit_code(&config), 65);
        let bundle = BootError::Bundle(BundleError::UnknownRef("y".into()));
        assert_eq!(exit_code(&bundle), 64);
    }
}
