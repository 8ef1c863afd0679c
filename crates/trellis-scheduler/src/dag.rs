//! Execution graph construction.
//!
//! Walks the resolved, expanded containment tree and overlays it with
//! `needs` edges to produce a directed acyclic execution graph.
//! Children of a `group` container execute strictly in listed order
//! unless a child overrides the implicit edge with explicit `needs`;
//! children of a `parallel` container rely purely on explicit edges.
//! All resolution errors are terminal: the graph is never partially
//! usable.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use trellis_core::document::{Pipeline, Stage, StagePayload, Step, StepPayload};
use trellis_core::error::ResolutionError;
use trellis_core::events::SkipReason;
use trellis_core::failure::FailureStrategy;
use trellis_core::ids::NodeId;
use trellis_core::node::{Node, NodeKind, NodeStatus, NodeWork};

use crate::matrix::{expand_stage, expand_step};

/// The directed acyclic execution graph for one run.
///
/// Queryable for current per-node status and overall progress; the
/// scheduler owns all mutation.
#[derive(Debug)]
pub struct ExecutionGraph {
    nodes: HashMap<NodeId, Node>,
    children: HashMap<NodeId, Vec<NodeId>>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
    root: NodeId,
    /// Barrier name to the set of barrier nodes expected to arrive.
    barriers: HashMap<String, Vec<NodeId>>,
    /// Nodes marked for skipping before any dispatch happens.
    pre_skipped: Vec<(NodeId, SkipReason)>,
    /// Deterministic creation order, used for FIFO dispatch.
    order: Vec<NodeId>,
}

impl ExecutionGraph {
    pub fn root(&self) -> &NodeId {
        &self.root
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn status_of(&self, id: &NodeId) -> Option<NodeStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Node ids in deterministic creation (declaration) order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn children(&self, id: &NodeId) -> &[NodeId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, id: &NodeId) -> &[NodeId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn barriers(&self) -> &HashMap<String, Vec<NodeId>> {
        &self.barriers
    }

    pub(crate) fn pre_skipped(&self) -> &[(NodeId, SkipReason)] {
        &self.pre_skipped
    }

    /// All ids in the subtree rooted at `id`, excluding `id` itself.
    pub fn descendants(&self, id: &NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).to_vec();
        while let Some(current) = stack.pop() {
            stack.extend(self.children(&current).iter().cloned());
            result.push(current);
        }
        result
    }

    /// Nearest ancestor of stage kind, for stage-scoped queue keys.
    pub fn enclosing_stage(&self, id: &NodeId) -> Option<NodeId> {
        let mut current = self.nodes.get(id)?.parent.clone();
        while let Some(ancestor_id) = current {
            let ancestor = self.nodes.get(&ancestor_id)?;
            if ancestor.kind == NodeKind::Stage {
                return Some(ancestor_id);
            }
            current = ancestor.parent.clone();
        }
        None
    }

    /// Whether an id is an ancestor of another.
    pub fn is_ancestor(&self, ancestor: &NodeId, id: &NodeId) -> bool {
        let mut current = self.nodes.get(id).and_then(|n| n.parent.clone());
        while let Some(parent_id) = current {
            if &parent_id == ancestor {
                return true;
            }
            current = self.nodes.get(&parent_id).and_then(|n| n.parent.clone());
        }
        false
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }
}

/// Builder for execution graphs.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a graph from a resolved, template-free pipeline.
    pub fn build(&self, pipeline: &Pipeline) -> Result<ExecutionGraph, ResolutionError> {
        if pipeline.stages.is_empty() {
            return Err(ResolutionError::EmptyPipeline);
        }

        let mut state = BuildState::default();

        let root_id = NodeId::new(
            pipeline
                .id
                .clone()
                .unwrap_or_else(|| slugify(&pipeline.name)),
        );
        state.insert_node(
            Node {
                id: root_id.clone(),
                kind: NodeKind::Group,
                parent: None,
                needs: Vec::new(),
                if_expr: None,
                failure_strategy: FailureStrategy::Abort,
                timeout_seconds: pipeline.timeout_seconds,
                parallel_cap: None,
                matrix: HashMap::new(),
                env: pipeline.env.clone(),
                disabled: false,
                work: NodeWork::Container,
                status: NodeStatus::Pending,
            },
            root_id.as_str().to_string(),
        )?;

        state.add_stages(
            &root_id,
            true,
            &pipeline.stages,
            &FailureStrategy::Abort,
            &[],
            &HashMap::new(),
            &pipeline.env,
        )?;

        state.resolve_needs()?;
        state.check_cycles()?;
        let barriers = state.collect_barriers()?;

        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for id in &state.order {
            if let Some(node) = state.nodes.get(id) {
                for need in &node.needs {
                    dependents.entry(need.clone()).or_default().push(id.clone());
                }
            }
        }

        Ok(ExecutionGraph {
            nodes: state.nodes,
            children: state.children,
            dependents,
            root: root_id,
            barriers,
            pre_skipped: state.pre_skipped,
            order: state.order,
        })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct BuildState {
    nodes: HashMap<NodeId, Node>,
    children: HashMap<NodeId, Vec<NodeId>>,
    declared: HashMap<NodeId, String>,
    /// Declared `needs` references, resolved after materialization.
    explicit_needs: HashMap<NodeId, Vec<String>>,
    implicit_pred: HashMap<NodeId, Vec<NodeId>>,
    /// Declared ids that expanded to zero instances, per container.
    empty_by_container: HashMap<NodeId, HashSet<String>>,
    pre_skipped: Vec<(NodeId, SkipReason)>,
    order: Vec<NodeId>,
}

impl BuildState {
    fn insert_node(&mut self, node: Node, declared: String) -> Result<(), ResolutionError> {
        if self.nodes.contains_key(&node.id) {
            return Err(ResolutionError::DuplicateId {
                id: node.id.clone(),
            });
        }
        if let Some(parent) = &node.parent {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(node.id.clone());
        }
        self.declared.insert(node.id.clone(), declared);
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_stages(
        &mut self,
        container: &NodeId,
        sequential: bool,
        stages: &[Stage],
        inherited_failure: &FailureStrategy,
        suffix: &[String],
        matrix: &HashMap<String, String>,
        env: &HashMap<String, String>,
    ) -> Result<(), ResolutionError> {
        let mut prev: Vec<NodeId> = Vec::new();

        for (index, stage) in stages.iter().enumerate() {
            let declared = stage_declared_id(container, stage, index);
            let expansions = expand_stage(stage);
            if expansions.is_empty() {
                self.empty_by_container
                    .entry(container.clone())
                    .or_default()
                    .insert(declared);
                continue;
            }

            let mut instance_ids = Vec::with_capacity(expansions.len());
            for expansion in expansions {
                let mut instance_suffix = suffix.to_vec();
                instance_suffix.extend(expansion.suffix.iter().cloned());
                let id = NodeId::new(declared.clone()).with_suffix(&instance_suffix);

                let mut instance_matrix = matrix.clone();
                instance_matrix.extend(expansion.matrix.clone());

                let failure = expansion
                    .node
                    .failure_strategy
                    .clone()
                    .unwrap_or_else(|| inherited_failure.clone());

                let (kind, cap) = match &expansion.node.payload {
                    StagePayload::Steps(_) => (NodeKind::Stage, None),
                    StagePayload::Group(group) => (NodeKind::Group, group.parallel),
                    StagePayload::Parallel(group) => (NodeKind::Parallel, group.parallel),
                    StagePayload::Template(reference) => {
                        return Err(ResolutionError::TemplateNotFound {
                            name: reference.uses.clone(),
                            chain: trellis_core::error::NodePath(vec![declared.clone()]),
                        });
                    }
                };

                self.insert_node(
                    Node {
                        id: id.clone(),
                        kind,
                        parent: Some(container.clone()),
                        needs: Vec::new(),
                        if_expr: expansion.node.if_expr.clone(),
                        failure_strategy: failure.clone(),
                        timeout_seconds: expansion.node.timeout_seconds,
                        parallel_cap: if kind == NodeKind::Parallel { cap } else { None },
                        matrix: instance_matrix.clone(),
                        env: env.clone(),
                        disabled: false,
                        work: NodeWork::Container,
                        status: NodeStatus::Pending,
                    },
                    declared.clone(),
                )?;

                if sequential {
                    self.implicit_pred.insert(id.clone(), prev.clone());
                }

                match &expansion.node.payload {
                    StagePayload::Steps(steps) => {
                        self.add_steps(
                            &id,
                            true,
                            steps,
                            &failure,
                            &instance_suffix,
                            &instance_matrix,
                            env,
                        )?;
                    }
                    StagePayload::Group(group) => {
                        self.add_stages(
                            &id,
                            true,
                            &group.stages,
                            &failure,
                            &instance_suffix,
                            &instance_matrix,
                            env,
                        )?;
                    }
                    StagePayload::Parallel(group) => {
                        self.add_stages(
                            &id,
                            false,
                            &group.stages,
                            &failure,
                            &instance_suffix,
                            &instance_matrix,
                            env,
                        )?;
                    }
                    StagePayload::Template(_) => unreachable!("rejected above"),
                }

                instance_ids.push(id);
            }

            prev = instance_ids;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_steps(
        &mut self,
        container: &NodeId,
        sequential: bool,
        steps: &[Step],
        inherited_failure: &FailureStrategy,
        suffix: &[String],
        matrix: &HashMap<String, String>,
        env: &HashMap<String, String>,
    ) -> Result<(), ResolutionError> {
        let mut prev: Vec<NodeId> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            let declared = step_declared_id(container, step, index);
            let expansions = expand_step(step);
            if expansions.is_empty() {
                self.empty_by_container
                    .entry(container.clone())
                    .or_default()
                    .insert(declared);
                continue;
            }

            let mut instance_ids = Vec::with_capacity(expansions.len());
            for expansion in expansions {
                let mut instance_suffix = suffix.to_vec();
                instance_suffix.extend(expansion.suffix.iter().cloned());
                let id = NodeId::new(declared.clone()).with_suffix(&instance_suffix);

                let mut instance_matrix = matrix.clone();
                instance_matrix.extend(expansion.matrix.clone());

                let failure = expansion
                    .node
                    .on_failure
                    .clone()
                    .unwrap_or_else(|| inherited_failure.clone());

                let mut node_env = env.clone();
                node_env.extend(expansion.node.env.clone());

                let (kind, cap, work) = classify_step(&expansion.node);

                self.insert_node(
                    Node {
                        id: id.clone(),
                        kind,
                        parent: Some(container.clone()),
                        needs: Vec::new(),
                        if_expr: expansion.node.if_expr.clone(),
                        failure_strategy: failure.clone(),
                        timeout_seconds: expansion.node.timeout_seconds,
                        parallel_cap: cap,
                        matrix: instance_matrix.clone(),
                        env: node_env.clone(),
                        disabled: expansion.node.disabled,
                        work,
                        status: NodeStatus::Pending,
                    },
                    declared.clone(),
                )?;

                if expansion.node.disabled {
                    self.pre_skipped.push((id.clone(), SkipReason::Disabled));
                }

                if !expansion.node.needs.is_empty() {
                    self.explicit_needs
                        .insert(id.clone(), expansion.node.needs.clone());
                } else if sequential {
                    self.implicit_pred.insert(id.clone(), prev.clone());
                }

                match &expansion.node.payload {
                    StepPayload::Group(group) => {
                        self.add_steps(
                            &id,
                            true,
                            &group.steps,
                            &failure,
                            &instance_suffix,
                            &instance_matrix,
                            &node_env,
                        )?;
                    }
                    StepPayload::Parallel(group) => {
                        self.add_steps(
                            &id,
                            false,
                            &group.steps,
                            &failure,
                            &instance_suffix,
                            &instance_matrix,
                            &node_env,
                        )?;
                    }
                    _ => {}
                }

                instance_ids.push(id);
            }

            prev = instance_ids;
        }
        Ok(())
    }

    /// Resolve declared `needs` references to instance ids. A
    /// reference may only land on siblings or cousins within the
    /// referencing node's enclosing stage.
    fn resolve_needs(&mut self) -> Result<(), ResolutionError> {
        let mut resolved_needs: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for id in &self.order {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };

            let Some(refs) = self.explicit_needs.get(id) else {
                resolved_needs.insert(
                    id.clone(),
                    self.implicit_pred.get(id).cloned().unwrap_or_default(),
                );
                continue;
            };

            let own_declared = self.declared.get(id).cloned().unwrap_or_default();
            let scope = self.needs_scope(id, node.parent.as_ref());
            let scope_nodes = self.subtree(&scope);
            let ancestors = self.ancestors_of(id);
            let own_subtree: HashSet<NodeId> = self.subtree(id).into_iter().collect();

            let mut resolved = Vec::new();
            let mut empty_refs = 0usize;

            for reference in refs {
                if *reference == own_declared {
                    return Err(ResolutionError::SelfReference { node: id.clone() });
                }

                let candidates: Vec<NodeId> = scope_nodes
                    .iter()
                    .filter(|candidate| {
                        *candidate != id
                            && self.declared.get(candidate) == Some(reference)
                            && !ancestors.contains(candidate)
                            && !own_subtree.contains(candidate)
                    })
                    .cloned()
                    .collect();

                if !candidates.is_empty() {
                    resolved.extend(candidates);
                    continue;
                }

                // A reference landing on the node's own ancestor or
                // descendant can never be satisfied.
                if let Some(relative) = ancestors
                    .iter()
                    .chain(own_subtree.iter())
                    .find(|relative| self.declared.get(relative) == Some(reference))
                {
                    return Err(ResolutionError::Cycle {
                        nodes: vec![relative.clone(), id.clone()],
                    });
                }

                if self.is_empty_declared(&scope, reference) {
                    empty_refs += 1;
                    continue;
                }

                if self.declared.values().any(|d| d == reference) {
                    return Err(ResolutionError::CrossScopeNeeds {
                        node: id.clone(),
                        reference: reference.clone(),
                    });
                }

                return Err(ResolutionError::DanglingNeeds {
                    node: id.clone(),
                    reference: reference.clone(),
                });
            }

            // A node depending solely on zero-instance expansions is
            // skipped, not an error.
            if resolved.is_empty() && empty_refs > 0 {
                self.pre_skipped
                    .push((id.clone(), SkipReason::EmptyExpansion));
            }

            resolved_needs.insert(id.clone(), resolved);
        }

        for (id, needs) in resolved_needs {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.needs = needs;
            }
        }
        Ok(())
    }

    /// The containment scope a `needs` reference may resolve within:
    /// the subtree of the enclosing stage, so both siblings and
    /// cousins in nested groups are reachable while references across
    /// stages are rejected as cross-scope.
    fn needs_scope(&self, id: &NodeId, parent: Option<&NodeId>) -> NodeId {
        let mut current = parent.cloned();
        let fallback = parent.cloned().unwrap_or_else(|| id.clone());
        while let Some(ancestor_id) = current {
            if let Some(ancestor) = self.nodes.get(&ancestor_id) {
                if ancestor.kind == NodeKind::Stage {
                    return ancestor_id;
                }
                current = ancestor.parent.clone();
            } else {
                break;
            }
        }
        fallback
    }

    fn is_empty_declared(&self, scope: &NodeId, reference: &str) -> bool {
        let mut stack = vec![scope.clone()];
        while let Some(current) = stack.pop() {
            if let Some(empties) = self.empty_by_container.get(&current)
                && empties.contains(reference)
            {
                return true;
            }
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().cloned());
            }
        }
        false
    }

    fn subtree(&self, id: &NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeId> = self
            .children
            .get(id)
            .map(|c| c.to_vec())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().cloned());
            }
            result.push(current);
        }
        result
    }

    fn ancestors_of(&self, id: &NodeId) -> HashSet<NodeId> {
        let mut result = HashSet::new();
        let mut current = self.nodes.get(id).and_then(|n| n.parent.clone());
        while let Some(parent) = current {
            current = self.nodes.get(&parent).and_then(|n| n.parent.clone());
            result.insert(parent);
        }
        result
    }

    /// Verify the needs overlay is acyclic, reporting the minimal
    /// cycle when it is not.
    fn check_cycles(&self) -> Result<(), ResolutionError> {
        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut indices: HashMap<NodeId, NodeIndex> = HashMap::new();

        for id in &self.order {
            let idx = graph.add_node(id.clone());
            indices.insert(id.clone(), idx);
        }
        for id in &self.order {
            if let Some(node) = self.nodes.get(id) {
                for need in &node.needs {
                    if let (Some(&from), Some(&to)) = (indices.get(need), indices.get(id)) {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }

        if toposort(&graph, None).is_ok() {
            return Ok(());
        }

        for component in tarjan_scc(&graph) {
            if component.len() > 1 {
                let mut nodes: Vec<NodeId> = component
                    .iter()
                    .filter_map(|idx| graph.node_weight(*idx))
                    .cloned()
                    .collect();
                nodes.sort();
                return Err(ResolutionError::Cycle { nodes });
            }
        }
        Err(ResolutionError::Cycle { nodes: Vec::new() })
    }

    /// Gather barrier rendezvous groups, rejecting a name reused
    /// across sibling scopes.
    fn collect_barriers(&self) -> Result<HashMap<String, Vec<NodeId>>, ResolutionError> {
        let mut barriers: HashMap<String, Vec<NodeId>> = HashMap::new();
        let mut scopes: HashMap<String, NodeId> = HashMap::new();

        for id in &self.order {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let NodeWork::Barrier { name } = &node.work else {
                continue;
            };

            let scope = self.barrier_scope(id);
            match scopes.get(name) {
                None => {
                    scopes.insert(name.clone(), scope);
                }
                Some(existing) if *existing == scope => {}
                Some(_) => {
                    return Err(ResolutionError::AmbiguousBarrier { name: name.clone() });
                }
            }
            barriers.entry(name.clone()).or_default().push(id.clone());
        }
        Ok(barriers)
    }

    /// The innermost enclosing parallel container, falling back to
    /// the direct parent.
    fn barrier_scope(&self, id: &NodeId) -> NodeId {
        let mut current = self.nodes.get(id).and_then(|n| n.parent.clone());
        let mut fallback = current.clone();
        while let Some(parent) = current {
            if let Some(node) = self.nodes.get(&parent) {
                if node.kind == NodeKind::Parallel {
                    return parent;
                }
                current = node.parent.clone();
            } else {
                break;
            }
        }
        fallback.take().unwrap_or_else(|| id.clone())
    }
}

fn classify_step(step: &Step) -> (NodeKind, Option<u32>, NodeWork) {
    match &step.payload {
        StepPayload::Group(_) => (NodeKind::Group, None, NodeWork::Container),
        StepPayload::Parallel(group) => (NodeKind::Parallel, group.parallel, NodeWork::Container),
        StepPayload::Barrier(barrier) => (
            NodeKind::Step,
            None,
            NodeWork::Barrier {
                name: barrier.name.clone(),
            },
        ),
        StepPayload::Queue(queue) => (
            NodeKind::Step,
            None,
            NodeWork::Queue {
                key: queue.key.clone(),
                scope: queue.scope,
            },
        ),
        StepPayload::Background(_) => (
            NodeKind::Step,
            None,
            NodeWork::Background(step.payload.clone()),
        ),
        _ => (NodeKind::Step, None, NodeWork::Execute(step.payload.clone())),
    }
}

fn stage_declared_id(container: &NodeId, stage: &Stage, index: usize) -> String {
    stage
        .id
        .clone()
        .or_else(|| stage.name.as_deref().map(slugify))
        .unwrap_or_else(|| format!("{}-stage-{}", container, index + 1))
}

fn step_declared_id(container: &NodeId, step: &Step, index: usize) -> String {
    step.id
        .clone()
        .or_else(|| step.name.as_deref().map(slugify))
        .unwrap_or_else(|| format!("{}-step-{}", container, index + 1))
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::document::{StepBarrier, StepGroup, StepQueue};
    use trellis_core::strategy::{MatrixAxis, Strategy};

    fn step(id: &str, needs: &[&str]) -> Step {
        let mut step = Step::from_script(format!("run {id}"));
        step.id = Some(id.to_string());
        step.needs = needs.iter().map(|s| s.to_string()).collect();
        step
    }

    fn stage_of_steps(id: &str, steps: Vec<Step>) -> Stage {
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

    fn pipeline(stages: Vec<Stage>) -> Pipeline {
        Pipeline {
            id: Some("pipeline".to_string()),
            name: "test".to_string(),
            env: HashMap::new(),
            concurrency: None,
            stages,
            timeout_seconds: None,
        }
    }

    #[test]
    fn test_linear_graph() {
        let doc = pipeline(vec![stage_of_steps(
            "build",
            vec![step("a", &[]), step("b", &[]), step("c", &[])],
        )]);
        let graph = GraphBuilder::new().build(&doc).unwrap();

        let b = graph.node(&NodeId::new("b")).unwrap();
        assert_eq!(b.needs, vec![NodeId::new("a")]);
        let c = graph.node(&NodeId::new("c")).unwrap();
        assert_eq!(c.needs, vec![NodeId::new("b")]);
    }

    #[test]
    fn test_explicit_needs_override_positional() {
        let doc = pipeline(vec![stage_of_steps(
            "build",
            vec![step("a", &[]), step("b", &[]), step("c", &["a"])],
        )]);
        let graph = GraphBuilder::new().build(&doc).unwrap();

        let c = graph.node(&NodeId::new("c")).unwrap();
        assert_eq!(c.needs, vec![NodeId::new("a")]);
    }

    #[test]
    fn test_parallel_children_have_no_implicit_edges() {
        let mut container = Step::from_script("");
        container.id = Some("fan".to_string());
        container.payload = StepPayload::Parallel(StepGroup {
            parallel: Some(2),
            steps: vec![step("x", &[]), step("y", &[]), step("z", &[])],
        });

        let doc = pipeline(vec![stage_of_steps("build", vec![container])]);
        let graph = GraphBuilder::new().build(&doc).unwrap();

        for id in ["x", "y", "z"] {
            assert!(graph.node(&NodeId::new(id)).unwrap().needs.is_empty());
        }
        let fan = graph.node(&NodeId::new("fan")).unwrap();
        assert_eq!(fan.parallel_cap, Some(2));
    }

    #[test]
    fn test_dangling_needs_rejected() {
        let doc = pipeline(vec![stage_of_steps(
            "build",
            vec![step("a", &["ghost"])],
        )]);
        let err = GraphBuilder::new().build(&doc).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::DanglingNeeds { reference, .. } if reference == "ghost"
        ));
    }

    #[test]
    fn test_self_reference_rejected() {
        let doc = pipeline(vec![stage_of_steps("build", vec![step("a", &["a"])])]);
        let err = GraphBuilder::new().build(&doc).unwrap_err();
        assert!(matches!(err, ResolutionError::SelfReference { .. }));
    }

    #[test]
    fn test_cycle_reported_with_node_ids() {
        let doc = pipeline(vec![stage_of_steps(
            "build",
            vec![step("a", &["b"]), step("b", &["a"])],
        )]);
        let err = GraphBuilder::new().build(&doc).unwrap_err();
        match err {
            ResolutionError::Cycle { nodes } => {
                assert_eq!(nodes, vec![NodeId::new("a"), NodeId::new("b")]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cross_scope_needs_rejected() {
        let doc = pipeline(vec![
            stage_of_steps("first", vec![step("a", &[])]),
            stage_of_steps("second", vec![step("b", &["a"])]),
        ]);
        let err = GraphBuilder::new().build(&doc).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::CrossScopeNeeds { reference, .. } if reference == "a"
        ));
    }

    #[test]
    fn test_matrix_instances_and_dependent_waits_for_all() {
        let mut fanned = step("build", &[]);
        fanned.strategy = Some(Strategy::matrix(vec![
            MatrixAxis::new("os", &["linux", "windows"]),
            MatrixAxis::new("arch", &["amd64", "arm64"]),
        ]));
        let collect = step("collect", &["build"]);

        let doc = pipeline(vec![stage_of_steps("ci", vec![fanned, collect])]);
        let graph = GraphBuilder::new().build(&doc).unwrap();

        for id in [
            "build-linux-amd64",
            "build-linux-arm64",
            "build-windows-amd64",
            "build-windows-arm64",
        ] {
            assert!(graph.node(&NodeId::new(id)).is_some(), "missing {id}");
        }

        let collect = graph.node(&NodeId::new("collect")).unwrap();
        assert_eq!(collect.needs.len(), 4);
    }

    #[test]
    fn test_empty_expansion_skips_sole_dependent() {
        let mut fanned = step("build", &[]);
        fanned.strategy = Some(Strategy::matrix(vec![MatrixAxis::new("os", &[])]));
        let dependent = step("publish", &["build"]);

        let doc = pipeline(vec![stage_of_steps("ci", vec![fanned, dependent])]);
        let graph = GraphBuilder::new().build(&doc).unwrap();

        assert!(graph.node(&NodeId::new("build")).is_none());
        assert!(graph
            .pre_skipped()
            .iter()
            .any(|(id, reason)| id == &NodeId::new("publish")
                && *reason == SkipReason::EmptyExpansion));
    }

    #[test]
    fn test_ambiguous_barrier_rejected() {
        fn branch(id: &str, barrier: &str) -> Step {
            let mut group = Step::from_script("");
            group.id = Some(id.to_string());
            let mut barrier_step = Step::from_script("");
            barrier_step.id = Some(format!("{id}-wait"));
            barrier_step.payload = StepPayload::Barrier(StepBarrier {
                name: barrier.to_string(),
            });
            group.payload = StepPayload::Group(StepGroup {
                parallel: None,
                steps: vec![barrier_step],
            });
            group
        }

        fn fan(id: &str, barrier: &str) -> Step {
            let mut fan = Step::from_script("");
            fan.id = Some(id.to_string());
            fan.payload = StepPayload::Parallel(StepGroup {
                parallel: None,
                steps: vec![
                    branch(&format!("{id}-1"), barrier),
                    branch(&format!("{id}-2"), barrier),
                ],
            });
            fan
        }

        let doc = pipeline(vec![stage_of_steps(
            "ci",
            vec![fan("left", "sync"), fan("right", "sync")],
        )]);
        let err = GraphBuilder::new().build(&doc).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::AmbiguousBarrier { name } if name == "sync"
        ));
    }

    #[test]
    fn test_queue_node_classified() {
        let mut queue_step = Step::from_script("");
        queue_step.id = Some("serialize".to_string());
        queue_step.payload = StepPayload::Queue(StepQueue {
            key: "deploy".to_string(),
            scope: Default::default(),
        });

        let doc = pipeline(vec![stage_of_steps("ci", vec![queue_step])]);
        let graph = GraphBuilder::new().build(&doc).unwrap();
        let node = graph.node(&NodeId::new("serialize")).unwrap();
        assert!(matches!(&node.work, NodeWork::Queue { key, .. } if key == "deploy"));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let doc = pipeline(vec![]);
        assert!(matches!(
            GraphBuilder::new().build(&doc),
            Err(ResolutionError::EmptyPipeline)
        ));
    }

    #[test]
    fn test_effective_failure_strategy_materialized() {
        let mut stage = stage_of_steps("build", vec![step("a", &[])]);
        stage.failure_strategy = Some(FailureStrategy::Ignore);

        let doc = pipeline(vec![stage]);
        let graph = GraphBuilder::new().build(&doc).unwrap();
        let a = graph.node(&NodeId::new("a")).unwrap();
        assert_eq!(a.failure_strategy, FailureStrategy::Ignore);
    }
}
