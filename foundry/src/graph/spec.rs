//! Graph builder: nodes + explicit edges (from → to) and conditional edges.
//!
//! Add nodes with `add_node`, chain them with `add_edge`, and route decisions
//! with `add_conditional_edges` (label → target plus an optional catch-all).
//! `compile()` validates the structure and produces an immutable
//! [`CompiledGraph`] backed by an arena of integer-indexed node slots.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::state::StateSchema;

use super::compile_error::CompilationError;
use super::compiled::{CompiledGraph, NodeId, NodeSlot, OutEdges};
use super::node::{Handler, NodeKind};

/// One node declaration: name, kind, read/write field sets, handler.
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub handler: Arc<dyn Handler>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: NodeKind, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            kind,
            reads: Vec::new(),
            writes: Vec::new(),
            handler,
        }
    }

    pub fn reads(mut self, fields: &[&str]) -> Self {
        self.reads = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn writes(mut self, fields: &[&str]) -> Self {
        self.writes = fields.iter().map(|s| s.to_string()).collect();
        self
    }
}

struct ConditionalEdges {
    labels: BTreeMap<String, String>,
    catch_all: Option<String>,
}

/// Mutable graph under construction. Generic-free: the state is the schema-driven
/// [`crate::state::PipelineState`].
pub struct GraphSpec {
    schema: StateSchema,
    nodes: Vec<NodeSpec>,
    edges: Vec<(String, String)>,
    conditional: HashMap<String, ConditionalEdges>,
    recursion_limit: usize,
}

impl GraphSpec {
    /// Default recursion limit: ceiling on total node visits per request.
    pub const DEFAULT_RECURSION_LIMIT: usize = 100;

    pub fn new(schema: StateSchema) -> Self {
        Self {
            schema,
            nodes: Vec::new(),
            edges: Vec::new(),
            conditional: HashMap::new(),
            recursion_limit: Self::DEFAULT_RECURSION_LIMIT,
        }
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Adds a node. Names must be unique; duplicates fail at compile.
    pub fn add_node(&mut self, node: NodeSpec) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Adds an unconditional edge. Non-decision nodes must end up with exactly one.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Adds conditional edges from a decision node: the handler's returned label
    /// selects the target; an unmatched label falls back to `catch_all` when set,
    /// otherwise the run fails with `UnroutableState`.
    pub fn add_conditional_edges<I, K, V>(
        &mut self,
        source: impl Into<String>,
        labels: I,
        catch_all: Option<String>,
    ) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.conditional.insert(
            source.into(),
            ConditionalEdges {
                labels: labels
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
                catch_all,
            },
        );
        self
    }

    /// Validates the graph and freezes it into its arena form.
    ///
    /// Checks, in order: positive recursion limit, unique names, exactly one
    /// entry, known edge endpoints, declared merge policy for every written
    /// field, out-edge shape per node kind, at least one terminal, and terminal
    /// reachability. Unreachable non-terminal nodes only produce a warning.
    pub fn compile(self) -> Result<CompiledGraph, CompilationError> {
        if self.recursion_limit == 0 {
            return Err(CompilationError::ZeroRecursionLimit);
        }

        let mut by_name: HashMap<String, NodeId> = HashMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if by_name.insert(node.name.clone(), NodeId(idx)).is_some() {
                return Err(CompilationError::DuplicateNode(node.name.clone()));
            }
        }

        let entries: Vec<&NodeSpec> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Entry)
            .collect();
        if entries.len() != 1 {
            return Err(CompilationError::EntryCount(entries.len()));
        }
        let entry = by_name[&entries[0].name];

        for node in &self.nodes {
            for field in &node.writes {
                if !self.schema.declares(field) {
                    return Err(CompilationError::UndeclaredWrite {
                        node: node.name.clone(),
                        field: field.clone(),
                    });
                }
            }
        }

        // Group unconditional edges by source.
        let mut out_by_source: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, to) in &self.edges {
            if !by_name.contains_key(from.as_str()) {
                return Err(CompilationError::UnknownNode(from.clone()));
            }
            if !by_name.contains_key(to.as_str()) {
                return Err(CompilationError::UnknownNode(to.clone()));
            }
            out_by_source.entry(from).or_default().push(to);
        }
        for (source, cond) in &self.conditional {
            if !by_name.contains_key(source.as_str()) {
                return Err(CompilationError::UnknownNode(source.clone()));
            }
            for target in cond.labels.values().chain(cond.catch_all.iter()) {
                if !by_name.contains_key(target.as_str()) {
                    return Err(CompilationError::UnknownNode(target.clone()));
                }
            }
        }

        let mut slots = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let plain = out_by_source.get(node.name.as_str());
            let cond = self.conditional.get(&node.name);
            let out = match node.kind {
                NodeKind::Terminal => {
                    if plain.is_some() || cond.is_some() {
                        return Err(CompilationError::TerminalWithEdges(node.name.clone()));
                    }
                    OutEdges::None
                }
                NodeKind::Decision => {
                    if plain.is_some() {
                        // Decisions route by label only.
                        return Err(CompilationError::AmbiguousEdge(node.name.clone()));
                    }
                    let Some(cond) = cond else {
                        return Err(CompilationError::DecisionWithoutEdges(node.name.clone()));
                    };
                    OutEdges::Conditional {
                        labels: cond
                            .labels
                            .iter()
                            .map(|(label, target)| (label.clone(), by_name[target.as_str()]))
                            .collect(),
                        catch_all: cond.catch_all.as_ref().map(|t| by_name[t.as_str()]),
                    }
                }
                NodeKind::Entry | NodeKind::Process | NodeKind::Tool => {
                    if cond.is_some() {
                        return Err(CompilationError::ConditionalOnNonDecision(node.name.clone()));
                    }
                    match plain.map(Vec::as_slice) {
                        None | Some([]) => {
                            return Err(CompilationError::MissingEdge(node.name.clone()))
                        }
                        Some([to]) => OutEdges::Single(by_name[*to]),
                        Some(_) => return Err(CompilationError::AmbiguousEdge(node.name.clone())),
                    }
                }
            };
            slots.push(NodeSlot {
                name: node.name.clone(),
                kind: node.kind,
                reads: node.reads.clone(),
                writes: node.writes.clone(),
                handler: node.handler.clone(),
                out,
            });
        }

        // Static reachability from the entry over every edge kind.
        let mut reachable: HashSet<usize> = HashSet::new();
        let mut stack = vec![entry.0];
        while let Some(idx) = stack.pop() {
            if !reachable.insert(idx) {
                continue;
            }
            match &slots[idx].out {
                OutEdges::None => {}
                OutEdges::Single(next) => stack.push(next.0),
                OutEdges::Conditional { labels, catch_all } => {
                    stack.extend(labels.values().map(|id| id.0));
                    if let Some(id) = catch_all {
                        stack.push(id.0);
                    }
                }
            }
        }

        let mut any_terminal = false;
        for (idx, slot) in slots.iter().enumerate() {
            if slot.kind == NodeKind::Terminal {
                any_terminal = true;
                if !reachable.contains(&idx) {
                    return Err(CompilationError::UnreachableTerminal(slot.name.clone()));
                }
            } else if !reachable.contains(&idx) {
                warn!(node = %slot.name, "graph node is unreachable from the entry");
            }
        }
        if !any_terminal {
            return Err(CompilationError::NoTerminal);
        }

        Ok(CompiledGraph::new(
            slots,
            by_name,
            entry,
            self.schema,
            self.recursion_limit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MergePolicy, PipelineState};

    use super::super::node::{NodeOutput, SyncHandler};

    fn noop() -> Arc<dyn Handler> {
        Arc::new(SyncHandler(|_: &PipelineState| Ok(NodeOutput::empty())))
    }

    fn schema() -> StateSchema {
        StateSchema::new().with_field("out", MergePolicy::Replace)
    }

    fn linear_graph() -> GraphSpec {
        let mut g = GraphSpec::new(schema());
        g.add_node(NodeSpec::new("in", NodeKind::Entry, noop()));
        g.add_node(NodeSpec::new("work", NodeKind::Process, noop()).writes(&["out"]));
        g.add_node(NodeSpec::new("done", NodeKind::Terminal, noop()));
        g.add_edge("in", "work");
        g.add_edge("work", "done");
        g
    }

    /// **Scenario**: A well-formed linear graph compiles.
    #[test]
    fn linear_graph_compiles() {
        assert!(linear_graph().compile().is_ok());
    }

    /// **Scenario**: Writing a field with no declared merge policy is rejected at compile.
    #[test]
    fn undeclared_write_rejected() {
        let mut g = GraphSpec::new(schema());
        g.add_node(NodeSpec::new("in", NodeKind::Entry, noop()).writes(&["mystery"]));
        g.add_node(NodeSpec::new("done", NodeKind::Terminal, noop()));
        g.add_edge("in", "done");
        assert_eq!(
            g.compile().unwrap_err(),
            CompilationError::UndeclaredWrite {
                node: "in".into(),
                field: "mystery".into()
            }
        );
    }

    /// **Scenario**: Two entries (or none) fail with the observed count.
    #[test]
    fn entry_count_enforced() {
        let mut g = GraphSpec::new(schema());
        g.add_node(NodeSpec::new("a", NodeKind::Entry, noop()));
        g.add_node(NodeSpec::new("b", NodeKind::Entry, noop()));
        g.add_node(NodeSpec::new("done", NodeKind::Terminal, noop()));
        g.add_edge("a", "done");
        g.add_edge("b", "done");
        assert_eq!(g.compile().unwrap_err(), CompilationError::EntryCount(2));
    }

    /// **Scenario**: A process node with two unconditional out-edges is ambiguous.
    #[test]
    fn ambiguous_edge_rejected() {
        let mut g = linear_graph();
        g.add_node(NodeSpec::new("other", NodeKind::Terminal, noop()));
        g.add_edge("work", "other");
        assert_eq!(
            g.compile().unwrap_err(),
            CompilationError::AmbiguousEdge("work".into())
        );
    }

    /// **Scenario**: An edge to a node that was never added fails.
    #[test]
    fn unknown_edge_endpoint_rejected() {
        let mut g = linear_graph();
        g.add_edge("done", "ghost");
        let err = g.compile().unwrap_err();
        // "done" gains an edge before "ghost" resolution, either failure is structural.
        assert!(matches!(
            err,
            CompilationError::UnknownNode(_) | CompilationError::TerminalWithEdges(_)
        ));
    }

    /// **Scenario**: A graph whose only terminal is unreachable fails compilation.
    #[test]
    fn unreachable_terminal_rejected() {
        let mut g = GraphSpec::new(schema());
        g.add_node(NodeSpec::new("in", NodeKind::Entry, noop()));
        g.add_node(NodeSpec::new("loop", NodeKind::Decision, noop()));
        g.add_node(NodeSpec::new("done", NodeKind::Terminal, noop()));
        g.add_edge("in", "loop");
        g.add_conditional_edges("loop", [("again", "loop")], None);
        assert_eq!(
            g.compile().unwrap_err(),
            CompilationError::UnreachableTerminal("done".into())
        );
    }

    /// **Scenario**: Conditional edges on a process node are rejected.
    #[test]
    fn conditional_on_process_rejected() {
        let mut g = linear_graph();
        g.add_conditional_edges("work", [("x", "done")], None);
        assert_eq!(
            g.compile().unwrap_err(),
            CompilationError::ConditionalOnNonDecision("work".into())
        );
    }

    /// **Scenario**: Cycles through a decision are legal as long as a terminal stays reachable.
    #[test]
    fn cycle_with_reachable_terminal_compiles() {
        let mut g = GraphSpec::new(schema());
        g.add_node(NodeSpec::new("in", NodeKind::Entry, noop()));
        g.add_node(NodeSpec::new("step", NodeKind::Process, noop()));
        g.add_node(NodeSpec::new("check", NodeKind::Decision, noop()));
        g.add_node(NodeSpec::new("done", NodeKind::Terminal, noop()));
        g.add_edge("in", "step");
        g.add_edge("step", "check");
        g.add_conditional_edges(
            "check",
            [("again", "step"), ("finish", "done")],
            Some("done".into()),
        );
        assert!(g.compile().is_ok());
    }
}
