//! Node and run state-change events for external telemetry consumers.

use crate::ids::{NodeId, RunId};
use crate::node::NodeStatus;
use crate::run::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),
    RunCanceled(RunCanceledPayload),

    // Node lifecycle
    NodeReady(NodePayload),
    NodeStarted(NodePayload),
    NodeCompleted(NodeCompletedPayload),
    NodeSkipped(NodeSkippedPayload),
    NodeRetrying(NodeRetryingPayload),

    // Synchronization
    BarrierReleased(BarrierPayload),
    QueueAcquired(QueuePayload),
    QueueReleased(QueuePayload),
}

impl Event {
    /// Returns the routing subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::RunQueued(p) => format!("run.queued.{}", p.run_id),
            Event::RunStarted(p) => format!("run.started.{}", p.run_id),
            Event::RunCompleted(p) => format!("run.completed.{}", p.run_id),
            Event::RunCanceled(p) => format!("run.canceled.{}", p.run_id),
            Event::NodeReady(p) => format!("run.{}.node.{}.ready", p.run_id, p.node_id),
            Event::NodeStarted(p) => format!("run.{}.node.{}.started", p.run_id, p.node_id),
            Event::NodeCompleted(p) => format!("run.{}.node.{}.completed", p.run_id, p.node_id),
            Event::NodeSkipped(p) => format!("run.{}.node.{}.skipped", p.run_id, p.node_id),
            Event::NodeRetrying(p) => format!("run.{}.node.{}.retrying", p.run_id, p.node_id),
            Event::BarrierReleased(p) => format!("run.{}.barrier.{}.released", p.run_id, p.name),
            Event::QueueAcquired(p) => format!("run.{}.queue.{}.acquired", p.run_id, p.key),
            Event::QueueReleased(p) => format!("run.{}.queue.{}.released", p.run_id, p.key),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCanceledPayload {
    pub run_id: RunId,
    pub reason: String,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePayload {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCompletedPayload {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSkippedPayload {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub reason: SkipReason,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ConditionFalse,
    AncestorFailed,
    AncestorSkipped,
    Disabled,
    EmptyExpansion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRetryingPayload {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub max_attempts: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierPayload {
    pub run_id: RunId,
    pub name: String,
    pub arrived: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePayload {
    pub run_id: RunId,
    pub key: String,
    pub node_id: NodeId,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_subjects() {
        let run_id = RunId::new();
        let event = Event::NodeCompleted(NodeCompletedPayload {
            run_id,
            node_id: NodeId::new("build"),
            status: NodeStatus::Succeeded,
            error: None,
            at: Utc::now(),
        });
        assert_eq!(
            event.subject(),
            format!("run.{}.node.build.completed", run_id)
        );
    }
}
