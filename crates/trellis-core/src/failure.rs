//! Failure handling strategies.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error handling policy for a node, inherited from the nearest
/// ancestor when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Mark all not-yet-started siblings and their subtrees skipped,
    /// mark the enclosing container failed, propagate upward.
    Abort,
    /// The node's failure does not fail the container; dependents run
    /// as if it had succeeded. The run result is still flagged as
    /// completed with ignored failures.
    Ignore,
    /// Re-enqueue the failed node up to `max_attempts` total attempts
    /// before falling back to abort.
    Retry {
        max_attempts: u32,
        #[serde(default)]
        backoff: Backoff,
    },
}

impl Default for FailureStrategy {
    fn default() -> Self {
        Self::Abort
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Backoff {
    #[serde(default = "default_delay")]
    pub delay_seconds: u32,
    #[serde(default = "default_true")]
    pub exponential: bool,
}

fn default_delay() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay_seconds: default_delay(),
            exponential: true,
        }
    }
}

impl Backoff {
    /// Delay before the given retry attempt (the second attempt is
    /// attempt 2).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_seconds as u64;
        if self.exponential {
            Duration::from_secs(base * 2u64.pow(attempt.saturating_sub(2).min(16)))
        } else {
            Duration::from_secs(base)
        }
    }
}
