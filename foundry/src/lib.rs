//! # Foundry runtime
//!
//! The orchestration engine behind Foundry runtime instances: a state-graph
//! executor drives a layered agent pipeline, invoking tools through a uniform
//! protocol with at-most-once semantics, under per-tenant isolation, deadlines,
//! and an append-only audit trail.
//!
//! ## Design principles
//!
//! - **Schema-driven state**: one [`PipelineState`] flows through all nodes;
//!   every field carries a declared [`MergePolicy`], and concurrent writes
//!   merge per policy in completion order.
//! - **Compile, then run**: [`GraphSpec`] validates structure up front
//!   (exactly one entry, declared writes, reachable terminals); the resulting
//!   [`CompiledGraph`] is immutable and shared read-only across requests.
//! - **Explicit resources**: no ambient globals. Registry, secrets, authz,
//!   tools, sessions, and audit are built at boot into [`Resources`] and
//!   injected into every [`RunContext`].
//! - **Failures degrade, they don't unwind**: node errors land in
//!   `worker_responses[id].error`; only executor invariants halt a request.
//!
//! ## Main modules
//!
//! - [`graph`]: [`GraphSpec`], [`CompiledGraph`], [`Handler`], [`RunContext`] —
//!   build and run state graphs with conditional routing, fan-out, cycles,
//!   recursion limits, deadlines, and optional checkpointing.
//! - [`pipeline`]: the canonical stage graph (`io_in`, `governance`, `context`,
//!   `supervisor`, workers, `coherence`, `observability`, `io_out`).
//! - [`tool`]: [`ToolClient`], [`ToolCatalog`], idempotency cache with
//!   single-flight, retry with backoff under deadline.
//! - [`secrets`]: scoped retrieval, blind writes, status-only external surface.
//! - [`authz`]: relationship-based checks with a TTL decision cache.
//! - [`session`]: TTL drafts plus content-addressed immutable versions.
//! - [`bundle`]: Instance Manifest + content-addressed bundle loading.
//! - [`adapter`]: chat / voice / API transports ↔ the neutral envelope.
//! - [`audit`]: bounded-buffer append-only log with a background flusher.
//! - [`registry`]: logical service names → endpoints, frozen at boot.
//! - [`runtime`]: [`Resources`], [`RuntimeInstance`], background tasks.

pub mod adapter;
pub mod audit;
pub mod authz;
pub mod bundle;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod secrets;
pub mod session;
pub mod state;
pub mod tool;

pub use adapter::{ApiAdapter, ApiRequest, ApiResponse, ChatAdapter, ChatRequest, ChatResponse};
pub use audit::{AuditDraft, AuditEntry, AuditLog, AuditQuery, AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use authz::{AuthzBackend, AuthzOracle, ObjectRef, ObjectType, Relation, StaticAuthzBackend};
pub use bundle::{build_instance, load_manifest, Bundle, InstanceManifest, InstancePlan, WorkerRegistry};
pub use envelope::{Channel, Deadline, InputPart, RequestEnvelope, RequestId, Scope};
pub use error::{ErrorKind, ErrorResponse};
pub use graph::{
    CompilationError, CompiledGraph, ExecError, GraphSpec, Handler, HandlerError, NodeKind,
    NodeOutput, NodeSpec, Route, RunContext, TraceEvent,
};
pub use pipeline::{
    GovernancePolicy, PipelineBuilder, SelectAllWorkers, SubGraphWorker, ToolWorker, Worker,
    WorkerSelector,
};
pub use registry::{Endpoint, ServiceRegistry};
pub use runtime::{Resources, ResourcesBuilder, RuntimeInstance};
pub use secrets::{MemorySecretBackend, SecretBackend, SecretError, SecretStatus, SecretValue, SecretsClient};
pub use session::{
    DraftCheckpointer, DraftStore, InMemoryDraftStore, SessionStore, SqliteVersionStore,
    StoreError, VersionRecord, VersionStore,
};
pub use state::{
    content_hash, fields, MergePolicy, Message, PipelineState, Role, StateSchema, StateUpdate,
};
pub use tool::{
    MockToolTransport, ToolBinding, ToolCall, ToolCatalog, ToolClient, ToolError, ToolOutcome,
    ToolResponse, ToolTransport,
};
