//! Graph compilation errors.
//!
//! Raised by `GraphSpec::compile`. A graph that compiles is structurally sound:
//! routing can still fail at runtime (`UnroutableState`) but never because of a
//! dangling edge or an undeclared write.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CompilationError {
    #[error("duplicate node '{0}'")]
    DuplicateNode(String),

    #[error("graph must have exactly one entry node, found {0}")]
    EntryCount(usize),

    #[error("edge references unknown node '{0}'")]
    UnknownNode(String),

    #[error("node '{node}' writes field '{field}' with no declared merge policy")]
    UndeclaredWrite { node: String, field: String },

    #[error("graph has no terminal node")]
    NoTerminal,

    #[error("terminal '{0}' is not reachable from the entry")]
    UnreachableTerminal(String),

    #[error("node '{0}' has no outgoing edge")]
    MissingEdge(String),

    #[error("node '{0}' has more than one unconditional outgoing edge")]
    AmbiguousEdge(String),

    #[error("conditional edges declared on non-decision node '{0}'")]
    ConditionalOnNonDecision(String),

    #[error("decision node '{0}' has no conditional edges")]
    DecisionWithoutEdges(String),

    #[error("terminal node '{0}' has outgoing edges")]
    TerminalWithEdges(String),

    #[error("recursion limit must be positive")]
    ZeroRecursionLimit,
}
