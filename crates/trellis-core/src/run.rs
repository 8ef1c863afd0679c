//! Run status and final result types.

use crate::ids::{NodeId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

/// Final result of a run. Runtime failures always produce a result
/// reflecting exactly which nodes failed, were skipped, or had their
/// failures ignored — never a bare "run failed".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub failed: Vec<NodeId>,
    pub skipped: Vec<NodeId>,
    /// Nodes that failed under an `ignore` strategy. Non-empty means
    /// the run completed with ignored failures.
    pub ignored_failures: Vec<NodeId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    pub fn completed_with_ignored_failures(&self) -> bool {
        self.status == RunStatus::Succeeded && !self.ignored_failures.is_empty()
    }
}
