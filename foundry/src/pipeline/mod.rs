//! The canonical agent pipeline, expressed as an executor graph.
//!
//! Fixed stage roles with configurable handlers:
//! `io_in → governance → context → supervisor → worker_* → coherence →
//! observability → io_out`. Governance may short-circuit straight to `io_out`;
//! the supervisor fans out to the selected workers, which re-join at
//! coherence. Worker failures degrade, they never unwind.

mod coherence;
mod context;
mod governance;
mod io;
mod observability;
mod supervisor;
mod worker;

pub use coherence::CoherenceHandler;
pub use context::ContextHandler;
pub use governance::{GovernanceHandler, GovernancePolicy};
pub use io::{session_draft_key, IoInHandler, IoOutHandler};
pub use observability::ObservabilityHandler;
pub use supervisor::{SelectAllWorkers, SupervisorHandler, WorkerSelector};
pub use worker::{worker_fn, SubGraphWorker, ToolWorker, Worker, WorkerNode};

use std::sync::Arc;

use crate::graph::{CompilationError, CompiledGraph, GraphSpec, NodeKind, NodeSpec};
use crate::state::{fields, MergePolicy, StateSchema};

/// Fixed stage node names.
pub mod stage {
    pub const IO_IN: &str = "io_in";
    pub const GOVERNANCE: &str = "governance";
    pub const CONTEXT: &str = "context";
    pub const SUPERVISOR: &str = "supervisor";
    pub const COHERENCE: &str = "coherence";
    pub const OBSERVABILITY: &str = "observability";
    pub const IO_OUT: &str = "io_out";
}

/// Governance routing labels.
pub mod routes {
    pub const PASS: &str = "pass";
    pub const DENY: &str = "deny";
}

/// Pipeline-private state fields, declared on top of the required set.
pub mod pipeline_fields {
    /// Supervisor plan: `{selected: [...], required: bool}` (merge).
    pub const SUPERVISOR: &str = "supervisor";
    /// Governance verdict and masked input (merge).
    pub const GOVERNANCE: &str = "governance";
}

/// Builds the canonical pipeline graph for one runtime instance.
pub struct PipelineBuilder {
    governance: GovernancePolicy,
    context_defaults: serde_json::Value,
    selector: Arc<dyn WorkerSelector>,
    workers: Vec<(String, Arc<dyn Worker>)>,
    extra_fields: Vec<(String, MergePolicy)>,
    recursion_limit: usize,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            governance: GovernancePolicy::default(),
            context_defaults: serde_json::Value::Object(Default::default()),
            selector: Arc::new(SelectAllWorkers),
            workers: Vec::new(),
            extra_fields: Vec::new(),
            recursion_limit: GraphSpec::DEFAULT_RECURSION_LIMIT,
        }
    }

    pub fn with_governance(mut self, policy: GovernancePolicy) -> Self {
        self.governance = policy;
        self
    }

    /// Static enrichment merged into `context` on every request
    /// (e.g. tenant-wide user preferences).
    pub fn with_context_defaults(mut self, defaults: serde_json::Value) -> Self {
        self.context_defaults = defaults;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn WorkerSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Registers a worker node. The id doubles as the supervisor routing label
    /// and the `worker_responses` key.
    pub fn with_worker(mut self, id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.workers.push((id.into(), worker));
        self
    }

    /// Application-specific state fields beyond the required set.
    pub fn with_field(mut self, name: impl Into<String>, policy: MergePolicy) -> Self {
        self.extra_fields.push((name.into(), policy));
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn build(self) -> Result<CompiledGraph, CompilationError> {
        let mut schema = StateSchema::pipeline_defaults()
            .with_field(pipeline_fields::SUPERVISOR, MergePolicy::Merge)
            .with_field(pipeline_fields::GOVERNANCE, MergePolicy::Merge);
        for (name, policy) in &self.extra_fields {
            schema = schema.with_field(name.clone(), *policy);
        }

        let worker_ids: Vec<String> = self.workers.iter().map(|(id, _)| id.clone()).collect();

        let mut graph = GraphSpec::new(schema).with_recursion_limit(self.recursion_limit);
        graph.add_node(
            NodeSpec::new(stage::IO_IN, NodeKind::Entry, Arc::new(IoInHandler))
                .writes(&[fields::MESSAGES]),
        );
        graph.add_node(
            NodeSpec::new(
                stage::GOVERNANCE,
                NodeKind::Decision,
                Arc::new(GovernanceHandler::new(self.governance)),
            )
            .reads(&[fields::MESSAGES])
            .writes(&[fields::FINAL_RESPONSE, fields::MESSAGES, pipeline_fields::GOVERNANCE]),
        );
        graph.add_node(
            NodeSpec::new(
                stage::CONTEXT,
                NodeKind::Process,
                Arc::new(ContextHandler::new(self.context_defaults)),
            )
            .reads(&[fields::MESSAGES])
            .writes(&[fields::CONTEXT]),
        );
        graph.add_node(
            NodeSpec::new(
                stage::SUPERVISOR,
                NodeKind::Decision,
                Arc::new(SupervisorHandler::new(self.selector, worker_ids.clone())),
            )
            .reads(&[fields::MESSAGES, fields::CONTEXT])
            .writes(&[pipeline_fields::SUPERVISOR]),
        );
        for (id, worker) in &self.workers {
            graph.add_node(
                NodeSpec::new(
                    id.clone(),
                    NodeKind::Tool,
                    Arc::new(WorkerNode::new(id.clone(), worker.clone())),
                )
                .reads(&[fields::MESSAGES, fields::CONTEXT])
                .writes(&[fields::WORKER_RESPONSES]),
            );
            graph.add_edge(id.clone(), stage::COHERENCE);
        }
        graph.add_node(
            NodeSpec::new(stage::COHERENCE, NodeKind::Process, Arc::new(CoherenceHandler))
                .reads(&[fields::WORKER_RESPONSES, pipeline_fields::SUPERVISOR])
                .writes(&[fields::FINAL_RESPONSE]),
        );
        graph.add_node(
            NodeSpec::new(
                stage::OBSERVABILITY,
                NodeKind::Process,
                Arc::new(ObservabilityHandler),
            )
            .reads(&[fields::TRACE, fields::WORKER_RESPONSES])
            .writes(&[fields::TRACE]),
        );
        graph.add_node(
            NodeSpec::new(stage::IO_OUT, NodeKind::Terminal, Arc::new(IoOutHandler))
                .reads(&[fields::FINAL_RESPONSE, fields::WORKER_RESPONSES, fields::MESSAGES])
                .writes(&[fields::FINAL_RESPONSE]),
        );

        graph.add_edge(stage::IO_IN, stage::GOVERNANCE);
        // The short-circuit edge is part of the compiled graph, per contract.
        graph.add_conditional_edges(
            stage::GOVERNANCE,
            [
                (routes::PASS, stage::CONTEXT),
                (routes::DENY, stage::IO_OUT),
            ],
            Some(stage::CONTEXT.into()),
        );
        graph.add_edge(stage::CONTEXT, stage::SUPERVISOR);
        let supervisor_labels: Vec<(String, String)> = worker_ids
            .iter()
            .map(|id| (id.clone(), id.clone()))
            .collect();
        graph.add_conditional_edges(
            stage::SUPERVISOR,
            supervisor_labels,
            Some(stage::COHERENCE.into()),
        );
        graph.add_edge(stage::COHERENCE, stage::OBSERVABILITY);
        graph.add_edge(stage::OBSERVABILITY, stage::IO_OUT);

        graph.compile()
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: The canonical pipeline with no workers compiles.
    #[test]
    fn empty_pipeline_compiles() {
        assert!(PipelineBuilder::new().build().is_ok());
    }

    /// **Scenario**: Worker ids become routable nodes feeding coherence.
    #[test]
    fn pipeline_with_workers_compiles() {
        let graph = PipelineBuilder::new()
            .with_worker("pm", Arc::new(crate::pipeline::worker::NoopWorker))
            .with_worker("qa", Arc::new(crate::pipeline::worker::NoopWorker))
            .build()
            .unwrap();
        let names: Vec<&str> = graph.node_names().collect();
        assert!(names.contains(&"pm"));
        assert!(names.contains(&"qa"));
        assert!(names.contains(&stage::SUPERVISOR));
    }

    /// **Scenario**: A worker id clashing with a stage name fails compilation.
    #[test]
    fn worker_named_like_stage_fails() {
        let err = PipelineBuilder::new()
            .with_worker("coherence", Arc::new(crate::pipeline::worker::NoopWorker))
            .build()
            .unwrap_err();
        assert!(matches!(err, CompilationError::DuplicateNode(_)));
    }
}
