//! Runtime bundle loading.
//!
//! At boot the process reads one Instance Manifest, resolves every ref against
//! the accompanying content-addressed bundle, verifies integrity, compiles the
//! pipeline, and binds tools and secret scopes. Any mismatch refuses traffic.

mod loader;
mod manifest;

pub use loader::{build_instance, Bundle, InstancePlan, WorkerRegistry};
pub use manifest::{
    load_manifest, InstanceManifest, ManifestSecret, ManifestTool, API_VERSION, MANIFEST_KIND,
};

use thiserror::Error;

use crate::graph::CompilationError;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("read: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest: {0}")]
    Manifest(String),

    #[error("parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("bundle integrity: blob '{reference}' hashes to {actual}")]
    IntegrityMismatch { reference: String, actual: String },

    #[error("unknown ref '{0}'")]
    UnknownRef(String),

    #[error("worker ref '{0}' does not resolve")]
    WorkerUnresolved(String),

    #[error("pipeline compile: {0}")]
    Compile(#[from] CompilationError),
}
