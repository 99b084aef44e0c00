//! Compiled graph: immutable arena of node slots, executed superstep by superstep.
//!
//! Built by `GraphSpec::compile`. One request owns one run: a frontier of active
//! nodes executes concurrently against a shared read-only snapshot, completions
//! merge into the state in the order they actually finish (per field policy),
//! and the next frontier is derived from the completed nodes' edges. Shared
//! read-only across requests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::debug;

use run_event::RunEvent;

use crate::envelope::Deadline;
use crate::error::ErrorKind;
use crate::state::{fields, PipelineState, StateError, StateSchema, StateUpdate};

use super::checkpoint::{CheckpointError, CheckpointRecord, Checkpointer};
use super::node::{Handler, HandlerError, NodeKind, NodeOutput, Route};
use super::{RunContext, TraceEvent};

/// Arena index of one node. Stable for the life of the compiled graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(super) usize);

pub(super) enum OutEdges {
    None,
    Single(NodeId),
    Conditional {
        labels: BTreeMap<String, NodeId>,
        catch_all: Option<NodeId>,
    },
}

pub(super) struct NodeSlot {
    pub(super) name: String,
    pub(super) kind: NodeKind,
    #[allow(dead_code)]
    pub(super) reads: Vec<String>,
    pub(super) writes: Vec<String>,
    pub(super) handler: Arc<dyn Handler>,
    pub(super) out: OutEdges,
}

/// Execution failure. Only executor-internal invariant violations and routing
/// dead ends halt a request; ordinary node failures are recorded in state.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("request cancelled")]
    Cancelled,

    #[error("recursion limit {limit} exceeded")]
    RecursionLimitExceeded { limit: usize },

    #[error("no edge for label '{label}' from node '{node}'")]
    Unroutable { node: String, label: String },

    #[error("node '{node}' failed fatally: {source}")]
    NodeFailed {
        node: String,
        source: HandlerError,
    },

    #[error(transparent)]
    Schema(#[from] StateError),

    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("executor invariant: {0}")]
    Internal(String),
}

impl ExecError {
    /// Actor-visible classification for the degraded response.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            ExecError::Cancelled => ErrorKind::Internal,
            ExecError::RecursionLimitExceeded { .. } => ErrorKind::RecursionLimitExceeded,
            ExecError::Unroutable { .. } => ErrorKind::UnroutableState,
            ExecError::NodeFailed { source, .. } => source.kind,
            ExecError::Schema(_) | ExecError::Checkpoint(_) | ExecError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Immutable executable graph. `Arc`-share it; state is per-request.
pub struct CompiledGraph {
    slots: Vec<NodeSlot>,
    by_name: HashMap<String, NodeId>,
    entry: NodeId,
    schema: StateSchema,
    recursion_limit: usize,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("entry", &self.entry)
            .field("node_count", &self.slots.len())
            .finish()
    }
}

impl CompiledGraph {
    pub(super) fn new(
        slots: Vec<NodeSlot>,
        by_name: HashMap<String, NodeId>,
        entry: NodeId,
        schema: StateSchema,
        recursion_limit: usize,
    ) -> Self {
        Self {
            slots,
            by_name,
            entry,
            schema,
            recursion_limit,
        }
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_str())
    }

    pub fn writes_of(&self, node: &str) -> Option<&[String]> {
        self.by_name
            .get(node)
            .map(|id| self.slots[id.0].writes.as_slice())
    }

    /// Runs the graph from its entry until a terminal is reached, the recursion
    /// limit is hit, the deadline elapses, or a fatal error is raised.
    pub async fn invoke(
        &self,
        state: PipelineState,
        ctx: &RunContext,
    ) -> Result<PipelineState, ExecError> {
        self.run(state, vec![self.entry], 0, ctx, None).await
    }

    /// Like [`invoke`](Self::invoke), persisting a snapshot after every superstep.
    pub async fn invoke_checkpointed(
        &self,
        state: PipelineState,
        ctx: &RunContext,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Result<PipelineState, ExecError> {
        self.run(state, vec![self.entry], 0, ctx, Some(checkpointer))
            .await
    }

    /// Resumes from the last checkpoint for this request id; a fresh run when
    /// none exists.
    pub async fn resume(
        &self,
        initial: PipelineState,
        ctx: &RunContext,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Result<PipelineState, ExecError> {
        let record = checkpointer.load(ctx.request_id()).await?;
        match record {
            None => {
                self.run(initial, vec![self.entry], 0, ctx, Some(checkpointer))
                    .await
            }
            Some(record) => {
                let state = PipelineState::from_value(record.state.clone()).ok_or_else(|| {
                    ExecError::Internal("checkpoint state is not an object".into())
                })?;
                let mut frontier = Vec::with_capacity(record.frontier.len());
                for name in &record.frontier {
                    let id = self.by_name.get(name).ok_or_else(|| {
                        ExecError::Internal(format!("checkpoint frontier node '{name}' unknown"))
                    })?;
                    frontier.push(*id);
                }
                if frontier.is_empty() {
                    // Terminal was already reached before the checkpoint.
                    return Ok(state);
                }
                self.run(state, frontier, record.visits, ctx, Some(checkpointer))
                    .await
            }
        }
    }

    async fn run(
        &self,
        mut state: PipelineState,
        mut frontier: Vec<NodeId>,
        mut visits: usize,
        ctx: &RunContext,
        checkpointer: Option<Arc<dyn Checkpointer>>,
    ) -> Result<PipelineState, ExecError> {
        let mut last_saved_hash: Option<String> = None;
        debug!(request_id = %ctx.request_id(), "graph run start");

        loop {
            if frontier.is_empty() {
                return Err(ExecError::Internal(
                    "frontier drained without reaching a terminal".into(),
                ));
            }
            if ctx.deadline().map_or(false, |d| d.is_elapsed()) {
                ctx.cancel.cancel();
                return Err(ExecError::DeadlineExceeded);
            }
            visits += frontier.len();
            if visits > self.recursion_limit {
                return Err(ExecError::RecursionLimitExceeded {
                    limit: self.recursion_limit,
                });
            }

            let snapshot = Arc::new(state.clone());
            let mut join: JoinSet<(
                NodeId,
                chrono::DateTime<Utc>,
                Duration,
                Result<NodeOutput, HandlerError>,
            )> = JoinSet::new();
            for id in frontier.drain(..) {
                let slot = &self.slots[id.0];
                debug!(node = %slot.name, "node start");
                ctx.emit(RunEvent::NodeEntered {
                    id: slot.name.clone(),
                });
                let handler = slot.handler.clone();
                let snap = snapshot.clone();
                let task_ctx = ctx.clone();
                join.spawn(async move {
                    let started_wall = Utc::now();
                    let started = Instant::now();
                    let result = handler.run(&snap, &task_ctx).await;
                    (id, started_wall, started.elapsed(), result)
                });
            }

            let mut terminal_reached = false;
            let mut next: Vec<NodeId> = Vec::new();

            // Merge completions in the order they actually finish.
            while !join.is_empty() {
                let joined = tokio::select! {
                    res = join.join_next() => res,
                    _ = ctx.cancel.cancelled() => {
                        join.abort_all();
                        let deadline_hit = ctx.deadline().map_or(false, |d| d.is_elapsed());
                        return Err(if deadline_hit {
                            ExecError::DeadlineExceeded
                        } else {
                            ExecError::Cancelled
                        });
                    }
                    _ = sleep_until_deadline(ctx.deadline()) => {
                        ctx.cancel.cancel();
                        join.abort_all();
                        return Err(ExecError::DeadlineExceeded);
                    }
                };
                let Some(joined) = joined else { break };
                let (id, started_wall, elapsed, result) = joined
                    .map_err(|e| ExecError::Internal(format!("node task join: {e}")))?;
                let slot = &self.slots[id.0];

                let (outcome, route) = match result {
                    Ok(output) => {
                        state.apply(&output.update, &self.schema)?;
                        ("ok".to_string(), output.route)
                    }
                    Err(err) => {
                        // Decisions can't route after failure and terminals have
                        // nothing downstream to degrade into; both are fatal. So is
                        // any failure in a graph without an error field to land in.
                        if slot.kind == NodeKind::Decision
                            || slot.kind == NodeKind::Terminal
                            || !self.schema.declares(fields::WORKER_RESPONSES)
                        {
                            return Err(ExecError::NodeFailed {
                                node: slot.name.clone(),
                                source: err,
                            });
                        }
                        let recorded = StateUpdate::new().set(
                            fields::WORKER_RESPONSES,
                            serde_json::json!({ slot.name.clone(): {"error": err.to_value()} }),
                        );
                        state.apply(&recorded, &self.schema)?;
                        (err.kind.as_str().to_string(), None)
                    }
                };

                if self.schema.declares(fields::TRACE) {
                    let event = TraceEvent {
                        node_id: slot.name.clone(),
                        started_at: started_wall,
                        duration_ms: elapsed.as_millis() as u64,
                        outcome: outcome.clone(),
                    };
                    state.apply(
                        &StateUpdate::new().set(fields::TRACE, event.to_value()),
                        &self.schema,
                    )?;
                }
                debug!(node = %slot.name, %outcome, "node complete");
                ctx.emit(RunEvent::NodeExited {
                    id: slot.name.clone(),
                    outcome,
                    duration_ms: elapsed.as_millis() as u64,
                });

                match &slot.out {
                    OutEdges::None => terminal_reached = true,
                    OutEdges::Single(target) => next.push(*target),
                    OutEdges::Conditional { labels, catch_all } => match route {
                        Some(Route::Label(label)) => {
                            next.push(self.resolve_label(slot, labels, catch_all, &label)?)
                        }
                        Some(Route::FanOut(fan)) if fan.is_empty() => {
                            next.push(self.resolve_catch_all(slot, *catch_all, "<empty set>")?)
                        }
                        Some(Route::FanOut(fan)) => {
                            for label in fan {
                                next.push(self.resolve_label(slot, labels, catch_all, &label)?);
                            }
                        }
                        None => next.push(self.resolve_catch_all(slot, *catch_all, "<no label>")?),
                    },
                }
            }

            // Branches converging on one node activate it once.
            let mut seen = HashSet::new();
            next.retain(|id| seen.insert(*id));

            if let Some(checkpointer) = &checkpointer {
                let frontier_names = if terminal_reached {
                    Vec::new()
                } else {
                    next.iter()
                        .map(|id| self.slots[id.0].name.clone())
                        .collect()
                };
                let record = CheckpointRecord::capture(&state, frontier_names, visits);
                if last_saved_hash.as_deref() != Some(record.content_hash.as_str()) {
                    checkpointer.save(ctx.request_id(), &record).await?;
                    last_saved_hash = Some(record.content_hash.clone());
                }
            }

            if terminal_reached {
                debug!(request_id = %ctx.request_id(), visits, "graph run complete");
                return Ok(state);
            }
            frontier = next;
        }
    }

    fn resolve_label(
        &self,
        slot: &NodeSlot,
        labels: &BTreeMap<String, NodeId>,
        catch_all: &Option<NodeId>,
        label: &str,
    ) -> Result<NodeId, ExecError> {
        labels
            .get(label)
            .copied()
            .or(*catch_all)
            .ok_or_else(|| ExecError::Unroutable {
                node: slot.name.clone(),
                label: label.to_string(),
            })
    }

    fn resolve_catch_all(
        &self,
        slot: &NodeSlot,
        catch_all: Option<NodeId>,
        label: &str,
    ) -> Result<NodeId, ExecError> {
        catch_all.ok_or_else(|| ExecError::Unroutable {
            node: slot.name.clone(),
            label: label.to_string(),
        })
    }
}

async fn sleep_until_deadline(deadline: Option<Deadline>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d.instant())).await,
        None => std::future::pending::<()>().await,
    }
}
