//! Runtime instance assembly.
//!
//! Everything that was a process-wide singleton in older agent stacks is an
//! explicit resource here: built once at boot, injected into every request
//! context, no ambient globals. The instance owns the compiled pipeline, the
//! background tasks (draft sweeper, audit flusher), and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use run_event::RunEvent;

use crate::audit::{AuditLog, AuditSink, MemoryAuditSink};
use crate::authz::{AuthzBackend, AuthzOracle, StaticAuthzBackend};
use crate::bundle::InstancePlan;
use crate::envelope::RequestEnvelope;
use crate::error::ErrorResponse;
use crate::graph::{CompiledGraph, ExecError, RunContext};
use crate::registry::ServiceRegistry;
use crate::secrets::{MemorySecretBackend, SecretBackend, SecretsClient};
use crate::session::{
    spawn_draft_sweeper, DraftStore, InMemoryDraftStore, SessionStore, SqliteVersionStore,
    VersionStore,
};
use crate::state::PipelineState;
use crate::tool::{MockToolTransport, ToolCatalog, ToolClient, ToolTransport};

/// Shutdown drain budget for background tasks.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The boot-time resource set shared by every request.
pub struct Resources {
    pub registry: Arc<ServiceRegistry>,
    pub secrets: Arc<SecretsClient>,
    pub authz: Arc<AuthzOracle>,
    pub tools: Arc<ToolClient>,
    pub sessions: Arc<SessionStore>,
    pub audit: AuditLog,
}

impl Resources {
    pub fn builder() -> ResourcesBuilder {
        ResourcesBuilder::default()
    }

    /// Fully in-memory wiring: permissive authz, memory-backed secrets, mock
    /// tool transport, sqlite-in-memory versions. Dev mode and tests.
    pub fn in_memory() -> Self {
        Self::builder().build()
    }
}

/// Assembles a [`Resources`] from parts, with in-memory defaults for anything
/// not provided.
#[derive(Default)]
pub struct ResourcesBuilder {
    registry: Option<ServiceRegistry>,
    authz_backend: Option<Arc<dyn AuthzBackend>>,
    secret_backend: Option<Arc<dyn SecretBackend>>,
    environment: Option<String>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    tool_transport: Option<Arc<dyn ToolTransport>>,
    catalog: Option<ToolCatalog>,
    drafts: Option<Arc<dyn DraftStore>>,
    versions: Option<Arc<dyn VersionStore>>,
}

impl ResourcesBuilder {
    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn authz_backend(mut self, backend: Arc<dyn AuthzBackend>) -> Self {
        self.authz_backend = Some(backend);
        self
    }

    pub fn secret_backend(mut self, backend: Arc<dyn SecretBackend>) -> Self {
        self.secret_backend = Some(backend);
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn tool_transport(mut self, transport: Arc<dyn ToolTransport>) -> Self {
        self.tool_transport = Some(transport);
        self
    }

    pub fn catalog(mut self, catalog: ToolCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn drafts(mut self, drafts: Arc<dyn DraftStore>) -> Self {
        self.drafts = Some(drafts);
        self
    }

    pub fn versions(mut self, versions: Arc<dyn VersionStore>) -> Self {
        self.versions = Some(versions);
        self
    }

    pub fn build(self) -> Resources {
        let registry = Arc::new(self.registry.unwrap_or_default());
        let audit = AuditLog::new(
            self.audit_sink
                .unwrap_or_else(|| Arc::new(MemoryAuditSink::new())),
        );
        let authz = Arc::new(AuthzOracle::new(
            self.authz_backend
                .unwrap_or_else(|| Arc::new(StaticAuthzBackend::allow_all())),
        ));
        let secrets = Arc::new(SecretsClient::new(
            self.secret_backend
                .unwrap_or_else(|| Arc::new(MemorySecretBackend::new())),
            authz.clone(),
            audit.clone(),
            self.environment.unwrap_or_else(|| "dev".into()),
        ));
        let tools = Arc::new(ToolClient::new(
            self.catalog.unwrap_or_default(),
            self.tool_transport
                .unwrap_or_else(|| Arc::new(MockToolTransport::new())),
            authz.clone(),
            audit.clone(),
        ));
        let drafts = self
            .drafts
            .unwrap_or_else(|| Arc::new(InMemoryDraftStore::new()));
        let versions = self.versions.unwrap_or_else(|| {
            Arc::new(
                SqliteVersionStore::in_memory()
                    .unwrap_or_else(|e| panic!("in-memory sqlite: {e}")),
            )
        });
        let sessions = Arc::new(SessionStore::new(drafts, versions, authz.clone(), audit.clone()));

        Resources {
            registry,
            secrets,
            authz,
            tools,
            sessions,
            audit,
        }
    }
}

/// One running instance: compiled pipeline + resources + background tasks.
pub struct RuntimeInstance {
    resources: Arc<Resources>,
    pipeline: Arc<CompiledGraph>,
    cancel: CancellationToken,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RuntimeInstance {
    /// Wires an instance and spawns its background tasks.
    pub fn start(pipeline: Arc<CompiledGraph>, resources: Resources) -> Self {
        let resources = Arc::new(resources);
        let cancel = CancellationToken::new();
        let background = vec![
            resources.audit.spawn_flusher(cancel.child_token()),
            spawn_draft_sweeper(resources.sessions.drafts().clone(), cancel.child_token()),
        ];
        info!("runtime instance started");
        Self {
            resources,
            pipeline,
            cancel,
            background: std::sync::Mutex::new(background),
        }
    }

    /// Wires an instance from a loaded bundle plan plus backends.
    pub fn from_plan(plan: InstancePlan, mut builder: ResourcesBuilder) -> Self {
        builder = builder
            .catalog(plan.catalog)
            .environment(plan.manifest.environment.clone());
        Self::start(plan.pipeline, builder.build())
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    pub fn pipeline(&self) -> &Arc<CompiledGraph> {
        &self.pipeline
    }

    /// Builds the per-request context. The token is a child of the instance
    /// token, so instance shutdown cancels in-flight requests too.
    pub fn context(&self, envelope: RequestEnvelope) -> RunContext {
        let mut ctx = RunContext::new(envelope, self.resources.clone());
        ctx.cancel = self.cancel.child_token();
        ctx
    }

    /// Runs one request to completion.
    pub async fn handle(&self, envelope: RequestEnvelope) -> (RunContext, Result<PipelineState, ExecError>) {
        let ctx = self.context(envelope);
        let result = self.pipeline.invoke(PipelineState::new(), &ctx).await;
        (ctx, result)
    }

    /// Runs one request with a live event stream. The receiver yields events in
    /// executor-completion order; the handle resolves to the final state.
    pub fn handle_streaming(
        &self,
        envelope: RequestEnvelope,
    ) -> (
        RunContext,
        mpsc::UnboundedReceiver<RunEvent>,
        JoinHandle<Result<PipelineState, ExecError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = self.context(envelope).with_events(tx);
        let pipeline = self.pipeline.clone();
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { pipeline.invoke(PipelineState::new(), &task_ctx).await });
        (ctx, rx, handle)
    }

    /// Channel-neutral degraded response for an execution error.
    pub fn error_response(request_id: &str, err: &ExecError) -> ErrorResponse {
        ErrorResponse::new(err.kind(), err.to_string(), request_id)
    }

    /// Cancels background work and drains it within the grace period.
    /// Idempotent; later calls find nothing left to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = match self.background.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain(..).collect()
        };
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("background tasks did not drain within grace");
        }
        info!("runtime instance stopped");
    }
}
