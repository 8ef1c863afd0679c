//! Failure propagation.
//!
//! Consumes node failures and decides which pending nodes are
//! skipped, retried, or still run. Propagation travels upward through
//! the containment tree and forward through `needs` edges only; a
//! failure never implicitly affects unrelated branches outside its
//! dependency closure.

use std::time::Duration;

use trellis_core::failure::FailureStrategy;
use trellis_core::ids::NodeId;
use trellis_core::node::NodeStatus;

use crate::dag::ExecutionGraph;

/// The state changes a node failure implies.
#[derive(Debug, Default)]
pub struct Propagation {
    /// Not-yet-started nodes to mark skipped, in no particular order.
    pub skipped: Vec<NodeId>,
    /// Containers to mark failed, innermost first.
    pub failed_containers: Vec<NodeId>,
    /// The failed node should be re-enqueued instead of failing.
    pub retry: Option<RetryDirective>,
    /// The failure is ignored; dependents run as if it succeeded.
    pub ignored: bool,
}

#[derive(Debug)]
pub struct RetryDirective {
    pub node: NodeId,
    /// The attempt about to be made (the second attempt is 2).
    pub attempt: u32,
    pub delay: Duration,
}

/// Decide the consequences of a node reaching `failed`.
///
/// `attempts_made` counts completed attempts, including the one that
/// just failed.
pub fn on_node_failed(
    graph: &ExecutionGraph,
    failed: &NodeId,
    attempts_made: u32,
) -> Propagation {
    let mut propagation = Propagation::default();
    let Some(node) = graph.node(failed) else {
        return propagation;
    };

    match &node.failure_strategy {
        FailureStrategy::Retry {
            max_attempts,
            backoff,
        } if attempts_made < *max_attempts => {
            let attempt = attempts_made + 1;
            propagation.retry = Some(RetryDirective {
                node: failed.clone(),
                attempt,
                delay: backoff.delay_for_attempt(attempt),
            });
            return propagation;
        }
        FailureStrategy::Ignore => {
            propagation.ignored = true;
            return propagation;
        }
        // Retry attempts exhausted falls through to abort.
        FailureStrategy::Retry { .. } | FailureStrategy::Abort => {}
    }

    abort_upward(graph, failed, &mut propagation);
    propagation
}

/// Abort: skip not-yet-started siblings and their subtrees, fail the
/// enclosing container, then let the container's own strategy govern
/// the next level up.
fn abort_upward(graph: &ExecutionGraph, failed: &NodeId, propagation: &mut Propagation) {
    let mut current = failed.clone();

    loop {
        let Some(parent) = graph.node(&current).and_then(|n| n.parent.clone()) else {
            break;
        };

        for sibling in graph.children(&parent) {
            if sibling == &current {
                continue;
            }
            let Some(status) = graph.status_of(sibling) else {
                continue;
            };
            if matches!(status, NodeStatus::Pending | NodeStatus::Ready) {
                propagation.skipped.push(sibling.clone());
                for descendant in graph.descendants(sibling) {
                    if graph
                        .status_of(&descendant)
                        .is_some_and(|s| !s.is_terminal())
                    {
                        propagation.skipped.push(descendant);
                    }
                }
            }
        }

        propagation.failed_containers.push(parent.clone());

        // The container failed; its own materialized strategy decides
        // whether the failure climbs further. A retry strategy on a
        // container falls back to abort.
        let container_strategy = graph
            .node(&parent)
            .map(|n| n.failure_strategy.clone())
            .unwrap_or_default();
        if container_strategy == FailureStrategy::Ignore {
            break;
        }
        current = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::GraphBuilder;
    use std::collections::HashMap;
    use trellis_core::document::{Pipeline, Stage, StagePayload, Step};
    use trellis_core::failure::Backoff;

    fn step(id: &str) -> Step {
        let mut step = Step::from_script(format!("run {id}"));
        step.id = Some(id.to_string());
        step
    }

    fn build(stages: Vec<Stage>) -> ExecutionGraph {
        GraphBuilder::new()
            .build(&Pipeline {
                id: Some("pipeline".to_string()),
                name: "test".to_string(),
                env: HashMap::new(),
                concurrency: None,
                stages,
                timeout_seconds: None,
            })
            .unwrap()
    }

    fn stage_of(id: &str, steps: Vec<Step>) -> Stage {
        Stage {
            id: Some(id.to_string()),
            name: None,
            if_expr: None,
            strategy: None,
            failure_strategy: None,
            timeout_seconds: None,
            payload: StagePayload::Steps(steps),
        }
    }

    #[test]
    fn test_abort_skips_unstarted_siblings() {
        let graph = build(vec![stage_of("s", vec![step("a"), step("b"), step("c")])]);

        let propagation = on_node_failed(&graph, &NodeId::new("b"), 1);
        assert!(propagation.retry.is_none());
        assert!(!propagation.ignored);
        assert!(propagation.skipped.contains(&NodeId::new("c")));
        // `a` is pending in this unscheduled graph, so abort takes it
        // too; the scheduler only reaches this path after `a` is
        // already terminal.
        assert!(propagation
            .failed_containers
            .contains(&NodeId::new("s")));
        assert!(propagation
            .failed_containers
            .contains(&NodeId::new("pipeline")));
    }

    #[test]
    fn test_ignore_swallows_failure() {
        let mut failing = step("flaky");
        failing.on_failure = Some(FailureStrategy::Ignore);
        let graph = build(vec![stage_of("s", vec![failing, step("next")])]);

        let propagation = on_node_failed(&graph, &NodeId::new("flaky"), 1);
        assert!(propagation.ignored);
        assert!(propagation.skipped.is_empty());
        assert!(propagation.failed_containers.is_empty());
    }

    #[test]
    fn test_retry_until_attempts_exhausted() {
        let mut flaky = step("flaky");
        flaky.on_failure = Some(FailureStrategy::Retry {
            max_attempts: 3,
            backoff: Backoff {
                delay_seconds: 1,
                exponential: false,
            },
        });
        let graph = build(vec![stage_of("s", vec![flaky])]);

        let first = on_node_failed(&graph, &NodeId::new("flaky"), 1);
        let directive = first.retry.expect("first failure retries");
        assert_eq!(directive.attempt, 2);

        let second = on_node_failed(&graph, &NodeId::new("flaky"), 2);
        assert!(second.retry.is_some());

        let third = on_node_failed(&graph, &NodeId::new("flaky"), 3);
        assert!(third.retry.is_none());
        assert!(third
            .failed_containers
            .contains(&NodeId::new("s")));
    }

    #[test]
    fn test_ignore_on_container_stops_climb() {
        let mut stage = stage_of("tolerant", vec![step("a")]);
        stage.failure_strategy = Some(FailureStrategy::Ignore);
        // The step's own strategy is inherited from the stage, so give
        // the step an explicit abort to exercise the climb.
        let StagePayload::Steps(steps) = &mut stage.payload else {
            unreachable!()
        };
        steps[0].on_failure = Some(FailureStrategy::Abort);

        let graph = build(vec![stage, stage_of("later", vec![step("z")])]);

        let propagation = on_node_failed(&graph, &NodeId::new("a"), 1);
        assert_eq!(
            propagation.failed_containers,
            vec![NodeId::new("tolerant")]
        );
        assert!(!propagation.skipped.contains(&NodeId::new("z")));
    }
}
