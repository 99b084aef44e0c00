//! Bundle resolution and instance assembly.
//!
//! A bundle is a directory of blobs named by their SHA-256. Every resolve
//! re-hashes the blob; a mismatch is a `BundleIntegrityError` and the process
//! must refuse traffic (exit 64).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::graph::CompiledGraph;
use crate::pipeline::{
    GovernancePolicy, PipelineBuilder, SelectAllWorkers, ToolWorker, Worker, WorkerSelector,
};
use crate::state::{canonical_string, content_hash, fields, PipelineState};
use crate::tool::{ToolBinding, ToolCatalog};

use super::manifest::InstanceManifest;
use super::BundleError;

/// Code-registered workers and selectors, resolvable from worker descriptors.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
    selectors: HashMap<String, Arc<dyn WorkerSelector>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_worker(mut self, name: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(name.into(), worker);
        self
    }

    pub fn register_selector(
        mut self,
        name: impl Into<String>,
        selector: Arc<dyn WorkerSelector>,
    ) -> Self {
        self.selectors.insert(name.into(), selector);
        self
    }

    fn worker(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    fn selector(&self, name: &str) -> Option<Arc<dyn WorkerSelector>> {
        self.selectors.get(name).cloned()
    }
}

/// An opened, integrity-checked bundle directory.
#[derive(Debug)]
pub struct Bundle {
    dir: PathBuf,
}

impl Bundle {
    /// Opens a bundle directory, verifying every blob's name matches its hash.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, BundleError> {
        let dir = dir.as_ref().to_path_buf();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let bytes = std::fs::read(entry.path())?;
            let actual = crate::state::bytes_hash(&bytes);
            if actual != name {
                return Err(BundleError::IntegrityMismatch {
                    reference: name,
                    actual,
                });
            }
        }
        Ok(Self { dir })
    }

    /// Resolves a content-hash ref to its parsed JSON value, re-verifying the
    /// hash on read.
    pub fn resolve(&self, reference: &str) -> Result<Value, BundleError> {
        let path = self.dir.join(reference);
        if !path.is_file() {
            return Err(BundleError::UnknownRef(reference.to_string()));
        }
        let bytes = std::fs::read(&path)?;
        let actual = crate::state::bytes_hash(&bytes);
        if actual != reference {
            return Err(BundleError::IntegrityMismatch {
                reference: reference.to_string(),
                actual,
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| BundleError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Writes a blob, returning its ref. Used by tests and packaging tools.
    pub fn store(&self, value: &Value) -> Result<String, BundleError> {
        let bytes = canonical_string(value).into_bytes();
        let reference = crate::state::bytes_hash(&bytes);
        std::fs::write(self.dir.join(&reference), bytes)?;
        Ok(reference)
    }

    /// Creates an empty bundle directory wrapper without scanning.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, BundleError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }
}

/// Pipeline spec blob (the `graph` ref).
#[derive(Debug, Deserialize)]
struct PipelineSpecBlob {
    #[serde(default)]
    governance: GovernanceBlob,
    #[serde(default)]
    context_defaults: Option<Value>,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    recursion_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct GovernanceBlob {
    #[serde(default = "default_true")]
    standard_masks: bool,
    #[serde(default)]
    deny: Vec<DenyBlob>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DenyBlob {
    name: String,
    pattern: String,
}

/// Worker descriptor blob (one per `workers[]` ref).
#[derive(Debug, Deserialize)]
struct WorkerBlob {
    id: String,
    #[serde(flatten)]
    kind: WorkerKindBlob,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerKindBlob {
    /// Single tool call with arguments picked off the structured input.
    Tool {
        tool_name: String,
        #[serde(default)]
        argument_keys: Vec<String>,
    },
    /// Resolved from the code-registered worker registry.
    Registered { name: String },
}

/// Everything the runtime needs from one manifest + bundle.
#[derive(Debug)]
pub struct InstancePlan {
    pub manifest: InstanceManifest,
    pub pipeline: Arc<CompiledGraph>,
    pub catalog: ToolCatalog,
}

/// Gathers the structured fields of the user input, newest message last.
fn structured_input(state: &PipelineState) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    if let Some(Value::Array(messages)) = state.get(fields::MESSAGES) {
        for message in messages {
            if message.get("role").and_then(Value::as_str) != Some("user") {
                continue;
            }
            if let Some(Value::Object(content)) = message.get("content") {
                for (k, v) in content {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
    }
    out
}

fn tool_worker(tool_name: String, argument_keys: Vec<String>) -> Arc<dyn Worker> {
    Arc::new(ToolWorker::new(tool_name, move |state| {
        let input = structured_input(state);
        if argument_keys.is_empty() {
            return Value::Object(input);
        }
        let mut args = serde_json::Map::new();
        for key in &argument_keys {
            if let Some(value) = input.get(key) {
                args.insert(key.clone(), value.clone());
            }
        }
        Value::Object(args)
    }))
}

/// Resolves every ref, compiles the pipeline, and binds tools.
pub fn build_instance(
    manifest: InstanceManifest,
    bundle: &Bundle,
    registry: &WorkerRegistry,
) -> Result<InstancePlan, BundleError> {
    manifest.validate()?;

    let spec_value = bundle.resolve(&manifest.graph)?;
    let spec: PipelineSpecBlob =
        serde_json::from_value(spec_value.clone()).map_err(|e| BundleError::Parse {
            path: manifest.graph.clone(),
            message: e.to_string(),
        })?;

    let mut governance = if spec.governance.standard_masks {
        GovernancePolicy::standard()
    } else {
        GovernancePolicy::permissive()
    };
    for deny in &spec.governance.deny {
        governance = governance
            .try_deny(&deny.name, &deny.pattern)
            .map_err(|e| BundleError::Parse {
                path: manifest.graph.clone(),
                message: format!("governance pattern '{}': {e}", deny.name),
            })?;
    }

    let mut builder = PipelineBuilder::new().with_governance(governance);
    if let Some(defaults) = spec.context_defaults {
        builder = builder.with_context_defaults(defaults);
    }
    if let Some(limit) = spec.recursion_limit {
        builder = builder.with_recursion_limit(limit);
    }
    builder = match &spec.selector {
        Some(name) => builder.with_selector(
            registry
                .selector(name)
                .ok_or_else(|| BundleError::WorkerUnresolved(format!("selector '{name}'")))?,
        ),
        None => builder.with_selector(Arc::new(SelectAllWorkers)),
    };

    for worker_ref in &manifest.workers {
        let blob: WorkerBlob =
            serde_json::from_value(bundle.resolve(worker_ref)?).map_err(|e| BundleError::Parse {
                path: worker_ref.clone(),
                message: e.to_string(),
            })?;
        let worker = match blob.kind {
            WorkerKindBlob::Tool {
                tool_name,
                argument_keys,
            } => tool_worker(tool_name, argument_keys),
            WorkerKindBlob::Registered { name } => registry
                .worker(&name)
                .ok_or(BundleError::WorkerUnresolved(name))?,
        };
        builder = builder.with_worker(blob.id, worker);
    }

    let mut catalog = ToolCatalog::new();
    for tool in &manifest.tools {
        let mut binding = ToolBinding::new(&tool.name, &tool.endpoint);
        if let Some(secs) = tool.idempotency_ttl_secs {
            binding = binding.with_idempotency_ttl(Duration::from_secs(secs));
        }
        if let Some(cap) = tool.concurrency_cap {
            binding = binding.with_concurrency_cap(cap);
        }
        catalog.insert(binding);
    }

    let pipeline = Arc::new(builder.build()?);
    // The spec blob's own hash doubles as the compiled pipeline's identity.
    tracing::info!(
        graph = %manifest.graph,
        content_hash = %content_hash(&spec_value),
        workers = manifest.workers.len(),
        "instance pipeline compiled"
    );

    Ok(InstancePlan {
        manifest,
        pipeline,
        catalog,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_with(graph: String, workers: Vec<String>) -> InstanceManifest {
        InstanceManifest {
            api_version: super::super::API_VERSION.into(),
            kind: super::super::MANIFEST_KIND.into(),
            tenant: "acme".into(),
            domain: None,
            environment: "test".into(),
            instance: "i1".into(),
            graph,
            workers,
            tools: vec![crate::bundle::ManifestTool {
                name: "tasks".into(),
                endpoint: "tool_gateway".into(),
                idempotency_ttl_secs: Some(60),
                concurrency_cap: Some(2),
            }],
            secrets: vec![],
        }
    }

    /// **Scenario**: A manifest + bundle resolves into a compiled pipeline with
    /// bound tools.
    #[test]
    fn build_from_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path()).unwrap();
        let graph_ref = bundle
            .store(&json!({"governance": {"standard_masks": true}, "context_defaults": {"team": "core"}}))
            .unwrap();
        let worker_ref = bundle
            .store(&json!({
                "id": "pm",
                "type": "tool",
                "tool_name": "tasks.create_story",
                "argument_keys": ["epic", "title"],
            }))
            .unwrap();

        let plan = build_instance(
            manifest_with(graph_ref, vec![worker_ref]),
            &bundle,
            &WorkerRegistry::new(),
        )
        .unwrap();
        assert!(plan.pipeline.node_names().any(|n| n == "pm"));
        assert!(plan.catalog.resolve("tasks.create_story").is_some());
        assert_eq!(
            plan.catalog.resolve("tasks").unwrap().idempotency_ttl,
            Duration::from_secs(60)
        );
    }

    /// **Scenario**: A tampered blob fails integrity verification on open.
    #[test]
    fn tampered_blob_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path()).unwrap();
        let reference = bundle.store(&json!({"a": 1})).unwrap();
        std::fs::write(dir.path().join(&reference), b"{\"a\":2}").unwrap();

        let err = Bundle::open(dir.path()).unwrap_err();
        assert!(matches!(err, BundleError::IntegrityMismatch { .. }));
    }

    /// **Scenario**: A manifest naming a missing ref fails with UnknownRef.
    #[test]
    fn missing_ref_fails() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path()).unwrap();
        let err = build_instance(
            manifest_with("deadbeef".into(), vec![]),
            &bundle,
            &WorkerRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BundleError::UnknownRef(_)));
    }

    /// **Scenario**: An unregistered named worker fails resolution.
    #[test]
    fn unresolved_registered_worker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path()).unwrap();
        let graph_ref = bundle.store(&json!({})).unwrap();
        let worker_ref = bundle
            .store(&json!({"id": "custom", "type": "registered", "name": "nope"}))
            .unwrap();
        let err = build_instance(
            manifest_with(graph_ref, vec![worker_ref]),
            &bundle,
            &WorkerRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BundleError::WorkerUnresolved(_)));
    }
}
