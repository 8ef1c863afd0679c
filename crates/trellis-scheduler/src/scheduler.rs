//! The run loop.
//!
//! One scheduler drives one run from a single control loop: every
//! state change anywhere in the graph re-evaluates the full ready-set
//! (level-triggered; pipeline graphs are small). Node payloads are
//! dispatched to the external executor on spawned tasks that report
//! exactly one terminal status back over a channel, which keeps the
//! loop single-threaded and the no-double-dispatch and barrier-count
//! invariants free of locking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use trellis_core::events::{
    BarrierPayload, Event, NodeCompletedPayload, NodePayload, NodeRetryingPayload,
    NodeSkippedPayload, QueuePayload, RunCanceledPayload, RunCompletedPayload, RunStartedPayload,
    SkipReason,
};
use trellis_core::failure::FailureStrategy;
use trellis_core::ids::{NodeId, RunId};
use trellis_core::node::{ExecutionReport, NodeStatus, NodeWork};
use trellis_core::ports::{ConditionContext, ConditionEvaluator, EventSink, NodeExecutor};
use trellis_core::run::{RunResult, RunStatus};

use crate::dag::ExecutionGraph;
use crate::failure as failure_propagation;
use crate::sync::{BarrierTable, QueueTable, TokenKey};

/// Receiver half of a run-level cancellation signal; carries the
/// cancel reason once set.
pub type CancelSignal = watch::Receiver<Option<String>>;

/// Drives one execution graph to completion.
pub struct Scheduler {
    executor: Arc<dyn NodeExecutor>,
    events: Arc<dyn EventSink>,
    evaluator: Arc<dyn ConditionEvaluator>,
}

enum Completion {
    Terminal { node: NodeId, report: ExecutionReport },
    TimedOut { node: NodeId },
    RetryDue { node: NodeId },
}

#[derive(Default)]
struct RunState {
    /// Completed attempts per node.
    attempts: HashMap<NodeId, u32>,
    /// Failed nodes whose failure was ignored.
    ignored: HashSet<NodeId>,
    /// Dispatch tasks still awaiting a terminal report.
    inflight: HashMap<NodeId, tokio::task::JoinHandle<()>>,
    barriers: BarrierTable,
    queues: QueueTable,
    canceled: Option<String>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn NodeExecutor>,
        events: Arc<dyn EventSink>,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        Self {
            executor,
            events,
            evaluator,
        }
    }

    /// Run the graph to exhaustion or abort. Cancellation is
    /// idempotent: every non-terminal node transitions to canceled
    /// and in-flight reports are ignored afterwards.
    pub async fn run(
        &self,
        graph: &mut ExecutionGraph,
        run_id: RunId,
        cancel: Option<CancelSignal>,
    ) -> RunResult {
        let started_at = Utc::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();

        let mut state = RunState {
            barriers: BarrierTable::new(graph.barriers()),
            ..Default::default()
        };

        self.emit(Event::RunStarted(RunStartedPayload {
            run_id,
            started_at,
        }))
        .await;

        for (id, reason) in graph.pre_skipped().to_vec() {
            self.skip(graph, &mut state, run_id, &id, reason).await;
        }

        let root = graph.root().clone();
        if let Some(node) = graph.node_mut(&root) {
            node.status = NodeStatus::Running;
        }
        let deadline = graph
            .node(&root)
            .and_then(|n| n.timeout_seconds)
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        // Hold a sender so a missing cancel signal reads as
        // never-canceled rather than a closed channel.
        let (_standby_tx, standby_rx) = watch::channel(None);
        let mut cancel = cancel.unwrap_or(standby_rx);

        loop {
            self.sweep(graph, &mut state, run_id, &tx).await;
            if graph.all_terminal() {
                break;
            }

            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(completion) => {
                            self.apply(graph, &mut state, run_id, completion, &tx).await;
                        }
                        None => break,
                    }
                }
                reason = wait_canceled(&mut cancel) => {
                    self.cancel_all(graph, &mut state, run_id, &reason).await;
                }
                _ = maybe_sleep(deadline), if state.canceled.is_none() => {
                    self.cancel_all(graph, &mut state, run_id, "timeout").await;
                }
            }
        }

        self.finalize(graph, &state, run_id, started_at).await
    }

    /// One level-triggered pass: keep applying transitions until the
    /// graph is quiescent.
    async fn sweep(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        tx: &mpsc::UnboundedSender<Completion>,
    ) {
        loop {
            let mut changed = false;

            for id in graph.order().to_vec() {
                let Some(node) = graph.node(&id) else {
                    continue;
                };
                match node.status {
                    NodeStatus::Pending => {
                        if self.try_promote(graph, state, run_id, &id).await {
                            changed = true;
                        }
                    }
                    NodeStatus::Ready => {
                        if self.try_dispatch(graph, state, run_id, &id, tx).await {
                            changed = true;
                        }
                    }
                    NodeStatus::Running if node.is_container() => {
                        if self.try_complete_container(graph, state, run_id, &id).await {
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Pending -> ready|skipped|canceled.
    async fn try_promote(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        id: &NodeId,
    ) -> bool {
        let Some(node) = graph.node(id) else {
            return false;
        };

        if node.disabled {
            self.skip(graph, state, run_id, id, SkipReason::Disabled)
                .await;
            return true;
        }

        // Containment gate: the parent container must be active.
        if let Some(parent) = node.parent.clone() {
            match graph.status_of(&parent) {
                Some(NodeStatus::Running) => {}
                Some(NodeStatus::Canceled) => {
                    self.set_terminal(graph, run_id, id, NodeStatus::Canceled, None)
                        .await;
                    return true;
                }
                Some(status) if status.is_terminal() => {
                    let reason = if status == NodeStatus::Failed {
                        SkipReason::AncestorFailed
                    } else {
                        SkipReason::AncestorSkipped
                    };
                    self.skip(graph, state, run_id, id, reason).await;
                    return true;
                }
                _ => return false,
            }
        }

        // Dependency gate: every predecessor terminal and satisfying.
        let needs = node.needs.clone();
        for need in &needs {
            let Some(status) = graph.status_of(need) else {
                continue;
            };
            if !status.is_terminal() {
                return false;
            }
            if !status.satisfies_dependents() && !state.ignored.contains(need) {
                self.skip(graph, state, run_id, id, SkipReason::AncestorFailed)
                    .await;
                return true;
            }
        }

        // Condition gate.
        if let Some(expr) = node.if_expr.clone() {
            let context = ConditionContext {
                env: node.env.clone(),
                matrix: node.matrix.clone(),
            };
            if !self.evaluator.evaluate(&expr, &context) {
                self.skip(graph, state, run_id, id, SkipReason::ConditionFalse)
                    .await;
                return true;
            }
        }

        if let Some(node) = graph.node_mut(id) {
            node.status = NodeStatus::Ready;
        }
        true
    }

    /// Ready -> running (or directly terminal for barriers, queue
    /// acquisitions and background dispatch).
    async fn try_dispatch(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        id: &NodeId,
        tx: &mpsc::UnboundedSender<Completion>,
    ) -> bool {
        if !self.capacity_available(graph, id) {
            return false;
        }

        let Some(node) = graph.node(id) else {
            return false;
        };
        let work = node.work.clone();

        match work {
            NodeWork::Container => {
                if let Some(node) = graph.node_mut(id) {
                    node.status = NodeStatus::Running;
                }
                debug!(node = %id, "container activated");
                true
            }
            NodeWork::Barrier { name } => {
                if let Some(node) = graph.node_mut(id) {
                    node.status = NodeStatus::Running;
                }
                self.emit(Event::NodeStarted(NodePayload {
                    run_id,
                    node_id: id.clone(),
                    at: Utc::now(),
                }))
                .await;
                if let Some(released) = state.barriers.arrive(&name, id) {
                    self.release_barrier(graph, run_id, &name, released).await;
                }
                true
            }
            NodeWork::Queue { key, scope } => {
                let container = graph
                    .node(id)
                    .and_then(|n| n.parent.clone())
                    .unwrap_or_else(|| graph.root().clone());
                let token = TokenKey::new(&key, scope, graph.enclosing_stage(id));
                // Reentrant past a holding ancestor, otherwise the
                // scope could deadlock against itself.
                let held_by_ancestor = state
                    .queues
                    .holder(&token)
                    .is_some_and(|holder| graph.is_ancestor(holder, id));
                if held_by_ancestor || state.queues.try_acquire(token, id, &container) {
                    self.set_terminal(graph, run_id, id, NodeStatus::Succeeded, None)
                        .await;
                    self.emit(Event::QueueAcquired(QueuePayload {
                        run_id,
                        key,
                        node_id: id.clone(),
                        at: Utc::now(),
                    }))
                    .await;
                    true
                } else {
                    // Ready-but-blocked; re-attempted on every sweep.
                    false
                }
            }
            NodeWork::Background(_) => {
                let node = graph.node(id).cloned().expect("node exists");
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move {
                    let _ = executor.execute(&node).await;
                });
                self.set_terminal(graph, run_id, id, NodeStatus::Succeeded, None)
                    .await;
                true
            }
            NodeWork::Execute(_) => {
                if let Some(node) = graph.node_mut(id) {
                    node.status = NodeStatus::Running;
                }
                self.emit(Event::NodeStarted(NodePayload {
                    run_id,
                    node_id: id.clone(),
                    at: Utc::now(),
                }))
                .await;

                let node = graph.node(id).cloned().expect("node exists");
                let executor = Arc::clone(&self.executor);
                let tx = tx.clone();
                let handle = tokio::spawn(async move {
                    let completion = match node.timeout_seconds {
                        Some(secs) => {
                            let budget = Duration::from_secs(secs);
                            match tokio::time::timeout(budget, executor.execute(&node)).await {
                                Ok(report) => Completion::Terminal {
                                    node: node.id.clone(),
                                    report,
                                },
                                Err(_) => Completion::TimedOut {
                                    node: node.id.clone(),
                                },
                            }
                        }
                        None => Completion::Terminal {
                            node: node.id.clone(),
                            report: executor.execute(&node).await,
                        },
                    };
                    let _ = tx.send(completion);
                });
                state.inflight.insert(id.clone(), handle);
                true
            }
        }
    }

    /// FIFO parallelism cap on the parent container.
    fn capacity_available(&self, graph: &ExecutionGraph, id: &NodeId) -> bool {
        let Some(parent) = graph.node(id).and_then(|n| n.parent.clone()) else {
            return true;
        };
        let Some(cap) = graph.node(&parent).and_then(|n| n.parallel_cap) else {
            return true;
        };
        if cap == 0 {
            return true;
        }
        let running = graph
            .children(&parent)
            .iter()
            .filter(|child| graph.status_of(child) == Some(NodeStatus::Running))
            .count();
        running < cap as usize
    }

    /// A container completes once every child is terminal.
    async fn try_complete_container(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        id: &NodeId,
    ) -> bool {
        let children = graph.children(id).to_vec();
        let all_terminal = children
            .iter()
            .all(|child| graph.status_of(child).is_some_and(|s| s.is_terminal()));
        if !all_terminal {
            return false;
        }

        let child_failed = children.iter().any(|child| {
            graph.status_of(child) == Some(NodeStatus::Failed) && !state.ignored.contains(child)
        });
        let status = if child_failed {
            NodeStatus::Failed
        } else {
            NodeStatus::Succeeded
        };
        self.set_terminal(graph, run_id, id, status, None)
            .await;
        self.release_tokens(graph, state, run_id, id).await;
        true
    }

    async fn apply(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        completion: Completion,
        tx: &mpsc::UnboundedSender<Completion>,
    ) {
        match completion {
            Completion::Terminal { node, report } => {
                state.inflight.remove(&node);
                if graph.status_of(&node) != Some(NodeStatus::Running) {
                    debug!(node = %node, "dropping stale report");
                    return;
                }
                if report.success {
                    self.set_terminal(graph, run_id, &node, NodeStatus::Succeeded, None)
                        .await;
                } else {
                    let error = report
                        .error
                        .unwrap_or_else(|| "execution failed".to_string());
                    self.fail_node(graph, state, run_id, &node, error, tx).await;
                }
            }
            Completion::TimedOut { node } => {
                state.inflight.remove(&node);
                if graph.status_of(&node) != Some(NodeStatus::Running) {
                    return;
                }
                self.fail_node(graph, state, run_id, &node, "timeout".to_string(), tx)
                    .await;
            }
            Completion::RetryDue { node } => {
                if graph.status_of(&node) == Some(NodeStatus::Running)
                    && let Some(node) = graph.node_mut(&node)
                {
                    node.status = NodeStatus::Pending;
                }
            }
        }
    }

    async fn fail_node(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        id: &NodeId,
        error: String,
        tx: &mpsc::UnboundedSender<Completion>,
    ) {
        let attempts = state.attempts.entry(id.clone()).or_insert(0);
        *attempts += 1;
        let attempts_made = *attempts;

        let propagation = failure_propagation::on_node_failed(graph, id, attempts_made);

        if let Some(retry) = propagation.retry {
            let max_attempts = match graph.node(id).map(|n| &n.failure_strategy) {
                Some(FailureStrategy::Retry { max_attempts, .. }) => *max_attempts,
                _ => retry.attempt,
            };
            self.emit(Event::NodeRetrying(NodeRetryingPayload {
                run_id,
                node_id: id.clone(),
                attempt: retry.attempt,
                max_attempts,
                at: Utc::now(),
            }))
            .await;
            // The node stays running (holding its slot) until the
            // backoff elapses, then re-enters the pending pool.
            let tx = tx.clone();
            let node = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(retry.delay).await;
                let _ = tx.send(Completion::RetryDue { node });
            });
            return;
        }

        if propagation.ignored {
            warn!(node = %id, error = %error, "failure ignored");
            state.ignored.insert(id.clone());
            self.set_terminal(graph, run_id, id, NodeStatus::Failed, Some(error))
                .await;
            return;
        }

        self.set_terminal(graph, run_id, id, NodeStatus::Failed, Some(error))
            .await;

        for skipped in propagation.skipped {
            self.skip(graph, state, run_id, &skipped, SkipReason::AncestorFailed)
                .await;
        }
        for container in propagation.failed_containers {
            if graph
                .status_of(&container)
                .is_some_and(|s| s.is_terminal())
            {
                continue;
            }
            let container_ignored = graph
                .node(&container)
                .is_some_and(|n| n.failure_strategy == FailureStrategy::Ignore);
            if container_ignored {
                state.ignored.insert(container.clone());
            }
            self.set_terminal(graph, run_id, &container, NodeStatus::Failed, None)
                .await;
            self.release_tokens(graph, state, run_id, &container).await;
        }
    }

    async fn skip(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        id: &NodeId,
        reason: SkipReason,
    ) {
        if graph.status_of(id).is_none_or(|s| s.is_terminal()) {
            return;
        }
        if let Some(node) = graph.node_mut(id) {
            node.status = NodeStatus::Skipped;
        }
        self.on_never_arriving(graph, state, run_id, id).await;
        self.emit(Event::NodeSkipped(NodeSkippedPayload {
            run_id,
            node_id: id.clone(),
            reason,
            at: Utc::now(),
        }))
        .await;
    }

    /// A node that will never run forfeits its barrier arrival and
    /// abandons any queue wait.
    async fn on_never_arriving(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        id: &NodeId,
    ) {
        let Some(node) = graph.node(id) else {
            return;
        };
        match &node.work {
            NodeWork::Barrier { name } => {
                let name = name.clone();
                if let Some(released) = state.barriers.forfeit(&name, id) {
                    self.release_barrier(graph, run_id, &name, released).await;
                }
            }
            NodeWork::Queue { .. } => {
                state.queues.remove_waiter(id);
            }
            _ => {}
        }
    }

    async fn release_barrier(
        &self,
        graph: &mut ExecutionGraph,
        run_id: RunId,
        name: &str,
        released: Vec<NodeId>,
    ) {
        let arrived = released.len();
        for member in released {
            if graph.status_of(&member) == Some(NodeStatus::Running) {
                self.set_terminal(graph, run_id, &member, NodeStatus::Succeeded, None)
                    .await;
            }
        }
        self.emit(Event::BarrierReleased(BarrierPayload {
            run_id,
            name: name.to_string(),
            arrived,
            at: Utc::now(),
        }))
        .await;
    }

    async fn release_tokens(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        container: &NodeId,
    ) {
        let promoted = state.queues.release_held_by(container);
        for queue_node in promoted {
            if graph.status_of(&queue_node) == Some(NodeStatus::Ready) {
                let key = match graph.node(&queue_node).map(|n| &n.work) {
                    Some(NodeWork::Queue { key, .. }) => key.clone(),
                    _ => continue,
                };
                self.set_terminal(graph, run_id, &queue_node, NodeStatus::Succeeded, None)
                    .await;
                self.emit(Event::QueueAcquired(QueuePayload {
                    run_id,
                    key,
                    node_id: queue_node.clone(),
                    at: Utc::now(),
                }))
                .await;
            }
        }
    }

    async fn cancel_all(
        &self,
        graph: &mut ExecutionGraph,
        state: &mut RunState,
        run_id: RunId,
        reason: &str,
    ) {
        if state.canceled.is_some() {
            return;
        }
        state.canceled = Some(reason.to_string());

        // Ask in-flight executions to stop; any status they still
        // report is ignored once canceled.
        for (_, handle) in state.inflight.drain() {
            handle.abort();
        }

        for id in graph.order().to_vec() {
            if graph.status_of(&id).is_some_and(|s| !s.is_terminal())
                && let Some(node) = graph.node_mut(&id)
            {
                node.status = NodeStatus::Canceled;
            }
        }
        self.emit(Event::RunCanceled(RunCanceledPayload {
            run_id,
            reason: reason.to_string(),
            canceled_at: Utc::now(),
        }))
        .await;
    }

    async fn set_terminal(
        &self,
        graph: &mut ExecutionGraph,
        run_id: RunId,
        id: &NodeId,
        status: NodeStatus,
        error: Option<String>,
    ) {
        if let Some(node) = graph.node_mut(id) {
            node.status = status;
        }
        self.emit(Event::NodeCompleted(NodeCompletedPayload {
            run_id,
            node_id: id.clone(),
            status,
            error,
            at: Utc::now(),
        }))
        .await;
    }

    async fn finalize(
        &self,
        graph: &ExecutionGraph,
        state: &RunState,
        run_id: RunId,
        started_at: chrono::DateTime<Utc>,
    ) -> RunResult {
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        let mut ignored_failures = Vec::new();

        for id in graph.order() {
            match graph.status_of(id) {
                Some(NodeStatus::Failed) if state.ignored.contains(id) => {
                    ignored_failures.push(id.clone());
                }
                Some(NodeStatus::Failed) => failed.push(id.clone()),
                Some(NodeStatus::Skipped) => skipped.push(id.clone()),
                _ => {}
            }
        }

        let status = if state.canceled.is_some() {
            RunStatus::Canceled
        } else if !failed.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        self.emit(Event::RunCompleted(RunCompletedPayload {
            run_id,
            status,
            completed_at: Utc::now(),
        }))
        .await;

        RunResult {
            run_id,
            status,
            failed,
            skipped,
            ignored_failures,
            started_at,
            completed_at: Utc::now(),
        }
    }

    async fn emit(&self, event: Event) {
        if let Err(error) = self.events.publish(event).await {
            warn!(%error, "event sink rejected event");
        }
    }
}

async fn wait_canceled(cancel: &mut CancelSignal) -> String {
    loop {
        if let Some(reason) = cancel.borrow().clone() {
            return reason;
        }
        if cancel.changed().await.is_err() {
            // Sender dropped without canceling; never resolves.
            std::future::pending::<()>().await;
        }
    }
}

async fn maybe_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}
