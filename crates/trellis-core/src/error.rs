//! Error types for the Trellis engine.

use crate::ids::NodeId;
use thiserror::Error;

/// Errors raised while turning a document into an execution graph.
///
/// All resolution errors are fatal before any execution starts and
/// carry the node-id chain needed to locate the offending declaration.
/// The run never partially starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("template not found: {name} (referenced from {chain})")]
    TemplateNotFound { name: String, chain: NodePath },

    #[error("template parameter `{parameter}` required by {template} but not supplied at {chain}")]
    MissingParameter {
        template: String,
        parameter: String,
        chain: NodePath,
    },

    #[error("cyclic template reference: {}", chain_display(.chain))]
    CyclicTemplate { chain: Vec<String> },

    #[error("unknown `needs` reference `{reference}` at {node}")]
    DanglingNeeds { node: NodeId, reference: String },

    #[error("node {node} lists itself in `needs`")]
    SelfReference { node: NodeId },

    #[error("`needs` reference `{reference}` at {node} points outside its containment scope")]
    CrossScopeNeeds { node: NodeId, reference: String },

    #[error("cycle in execution graph: {}", cycle_display(.nodes))]
    Cycle { nodes: Vec<NodeId> },

    #[error("barrier name `{name}` reused across sibling scopes")]
    AmbiguousBarrier { name: String },

    #[error("empty pipeline")]
    EmptyPipeline,

    #[error("duplicate node id `{id}`")]
    DuplicateId { id: NodeId },
}

/// Chain of node ids from the document root to an offending node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodePath(pub Vec<String>);

impl NodePath {
    pub fn push(&self, segment: impl Into<String>) -> Self {
        let mut inner = self.0.clone();
        inner.push(segment.into());
        Self(inner)
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        write!(f, "{}", self.0.join("/"))
    }
}

fn chain_display(chain: &[String]) -> String {
    chain.join(" -> ")
}

fn cycle_display(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("node {node} failed: {message}")]
    NodeFailed { node: NodeId, message: String },

    #[error("node {node} timed out after {seconds}s")]
    NodeTimeout { node: NodeId, seconds: u64 },

    #[error("run canceled: {reason}")]
    Canceled { reason: String },

    // Double-admission for a held concurrency key. Internal invariant
    // violation, not a user-facing error.
    #[error("concurrency conflict on key `{key}`")]
    ConcurrencyConflict { key: String },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
