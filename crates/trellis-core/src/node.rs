//! The unit of scheduling.
//!
//! A [`Node`] is one concrete step or container after template and
//! strategy expansion. Nodes form a containment tree (group/parallel
//! to children) overlaid with a DAG of `needs` edges.

use crate::document::{QueueScope, StepPayload};
use crate::failure::FailureStrategy;
use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Step,
    Stage,
    Group,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded
                | NodeStatus::Failed
                | NodeStatus::Skipped
                | NodeStatus::Canceled
        )
    }

    /// Whether a dependent may proceed past this status. Skipped
    /// predecessors satisfy dependents; failed or canceled ones do
    /// not.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Skipped)
    }
}

/// What the scheduler does with a node once it becomes ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeWork {
    /// Dispatch the payload to the external executor and wait for
    /// exactly one terminal report.
    Execute(StepPayload),
    /// Dispatch without waiting; the node is marked succeeded at
    /// dispatch and never gates dependents.
    Background(StepPayload),
    /// Register arrival at the named rendezvous; succeed on release.
    Barrier { name: String },
    /// Acquire the named token in scope before the wrapped payload
    /// may run; release on completion.
    Queue { key: String, scope: QueueScope },
    /// A container; it succeeds or fails with its children.
    Container,
}

/// One concrete scheduling unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    /// Resolved to instance ids; empty means only the positional
    /// predecessor (if any) applies.
    pub needs: Vec<NodeId>,
    pub if_expr: Option<String>,
    /// Materialized at build time from the nearest ancestor, never
    /// looked up through parent pointers at schedule time.
    pub failure_strategy: FailureStrategy,
    pub timeout_seconds: Option<u64>,
    /// Parallelism cap for container nodes; the innermost cap wins.
    pub parallel_cap: Option<u32>,
    /// Matrix axis values this instance was expanded with.
    pub matrix: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub disabled: bool,
    pub work: NodeWork,
    pub status: NodeStatus,
}

impl Node {
    pub fn is_container(&self) -> bool {
        matches!(self.work, NodeWork::Container)
    }

    pub fn is_background(&self) -> bool {
        matches!(self.work, NodeWork::Background(_))
    }
}

/// Terminal report delivered by the external executor, exactly once
/// per dispatched node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ExecutionReport {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            exit_code: Some(0),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            exit_code: None,
        }
    }
}
