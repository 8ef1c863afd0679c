//! Barrier rendezvous and queue token state.
//!
//! Both are bookkeeping structures owned by the run's control loop; a
//! node blocked on either is suspended state, not a parked thread.

use std::collections::{HashMap, HashSet, VecDeque};

use trellis_core::document::QueueScope;
use trellis_core::ids::NodeId;

/// Tracks arrivals at named rendezvous points. A rendezvous releases
/// exactly once, when every still-expected branch has arrived.
#[derive(Debug, Default)]
pub struct BarrierTable {
    rendezvous: HashMap<String, Rendezvous>,
}

#[derive(Debug)]
struct Rendezvous {
    expected: HashSet<NodeId>,
    arrived: HashSet<NodeId>,
    released: bool,
}

impl BarrierTable {
    pub fn new(barriers: &HashMap<String, Vec<NodeId>>) -> Self {
        let rendezvous = barriers
            .iter()
            .map(|(name, members)| {
                (
                    name.clone(),
                    Rendezvous {
                        expected: members.iter().cloned().collect(),
                        arrived: HashSet::new(),
                        released: false,
                    },
                )
            })
            .collect();
        Self { rendezvous }
    }

    /// Register an arrival. Returns the full arrived set exactly once,
    /// at the moment the rendezvous releases.
    pub fn arrive(&mut self, name: &str, node: &NodeId) -> Option<Vec<NodeId>> {
        let rendezvous = self.rendezvous.get_mut(name)?;
        if rendezvous.released {
            return None;
        }
        rendezvous.arrived.insert(node.clone());
        Self::try_release(rendezvous)
    }

    /// Remove a branch that will never arrive (skipped or canceled).
    /// May itself trigger release for the remaining branches.
    pub fn forfeit(&mut self, name: &str, node: &NodeId) -> Option<Vec<NodeId>> {
        let rendezvous = self.rendezvous.get_mut(name)?;
        if rendezvous.released {
            return None;
        }
        rendezvous.expected.remove(node);
        rendezvous.arrived.remove(node);
        if rendezvous.expected.is_empty() {
            rendezvous.released = true;
            return None;
        }
        Self::try_release(rendezvous)
    }

    fn try_release(rendezvous: &mut Rendezvous) -> Option<Vec<NodeId>> {
        if !rendezvous.expected.is_empty() && rendezvous.arrived == rendezvous.expected {
            rendezvous.released = true;
            Some(rendezvous.arrived.iter().cloned().collect())
        } else {
            None
        }
    }

    pub fn is_released(&self, name: &str) -> bool {
        self.rendezvous.get(name).is_some_and(|r| r.released)
    }

    pub fn arrived_count(&self, name: &str) -> usize {
        self.rendezvous.get(name).map_or(0, |r| r.arrived.len())
    }
}

/// Key of a queue token: the declared key, namespaced by the
/// enclosing stage when the scope is `stage`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub key: String,
    pub stage: Option<NodeId>,
}

impl TokenKey {
    pub fn new(key: &str, scope: QueueScope, enclosing_stage: Option<NodeId>) -> Self {
        Self {
            key: key.to_string(),
            stage: match scope {
                QueueScope::Pipeline => None,
                QueueScope::Stage => enclosing_stage,
            },
        }
    }
}

/// Named mutexes serializing containers that pass a queue step.
/// The token is held by the queue step's enclosing container and
/// released when that container reaches a terminal state.
#[derive(Debug, Default)]
pub struct QueueTable {
    tokens: HashMap<TokenKey, TokenState>,
}

#[derive(Debug)]
struct TokenState {
    holder: Option<NodeId>,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    queue_node: NodeId,
    container: NodeId,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire the token on behalf of `container`.
    /// Reentrant for a container that already holds it. On contention
    /// the queue node joins a FIFO wait queue.
    pub fn try_acquire(&mut self, key: TokenKey, queue_node: &NodeId, container: &NodeId) -> bool {
        let state = self.tokens.entry(key).or_insert_with(|| TokenState {
            holder: None,
            waiters: VecDeque::new(),
        });
        match &state.holder {
            None => {
                state.holder = Some(container.clone());
                true
            }
            Some(holder) if holder == container => true,
            Some(_) => {
                if !state.waiters.iter().any(|w| &w.queue_node == queue_node) {
                    state.waiters.push_back(Waiter {
                        queue_node: queue_node.clone(),
                        container: container.clone(),
                    });
                }
                false
            }
        }
    }

    /// Release every token held by a completed container, promoting
    /// the first waiter of each. Returns the queue nodes that now
    /// hold their token.
    pub fn release_held_by(&mut self, container: &NodeId) -> Vec<NodeId> {
        let mut promoted = Vec::new();
        for state in self.tokens.values_mut() {
            if state.holder.as_ref() != Some(container) {
                continue;
            }
            state.holder = None;
            if let Some(next) = state.waiters.pop_front() {
                state.holder = Some(next.container);
                promoted.push(next.queue_node);
            }
        }
        self.tokens.retain(|_, state| state.holder.is_some() || !state.waiters.is_empty());
        promoted
    }

    /// Drop a waiter that was skipped or canceled before acquiring.
    pub fn remove_waiter(&mut self, queue_node: &NodeId) {
        for state in self.tokens.values_mut() {
            state.waiters.retain(|w| &w.queue_node != queue_node);
        }
    }

    pub fn holder(&self, key: &TokenKey) -> Option<&NodeId> {
        self.tokens.get(key).and_then(|s| s.holder.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn test_barrier_releases_exactly_on_last_arrival() {
        let mut barriers = HashMap::new();
        barriers.insert("sync".to_string(), vec![id("b1"), id("b2"), id("b3")]);
        let mut table = BarrierTable::new(&barriers);

        assert!(table.arrive("sync", &id("b1")).is_none());
        assert!(table.arrive("sync", &id("b2")).is_none());
        assert!(!table.is_released("sync"));

        let released = table.arrive("sync", &id("b3")).unwrap();
        assert_eq!(released.len(), 3);
        assert!(table.is_released("sync"));

        // Never released twice.
        assert!(table.arrive("sync", &id("b1")).is_none());
    }

    #[test]
    fn test_forfeit_allows_remaining_branches_to_release() {
        let mut barriers = HashMap::new();
        barriers.insert("sync".to_string(), vec![id("b1"), id("b2")]);
        let mut table = BarrierTable::new(&barriers);

        assert!(table.arrive("sync", &id("b1")).is_none());
        let released = table.forfeit("sync", &id("b2")).unwrap();
        assert_eq!(released, vec![id("b1")]);
    }

    #[test]
    fn test_queue_token_serializes_and_promotes_fifo() {
        let mut table = QueueTable::new();
        let key = TokenKey::new("deploy", QueueScope::Pipeline, None);

        assert!(table.try_acquire(key.clone(), &id("q1"), &id("branch-1")));
        assert!(!table.try_acquire(key.clone(), &id("q2"), &id("branch-2")));
        assert!(!table.try_acquire(key.clone(), &id("q3"), &id("branch-3")));

        let promoted = table.release_held_by(&id("branch-1"));
        assert_eq!(promoted, vec![id("q2")]);
        assert_eq!(table.holder(&key), Some(&id("branch-2")));

        let promoted = table.release_held_by(&id("branch-2"));
        assert_eq!(promoted, vec![id("q3")]);
    }

    #[test]
    fn test_queue_token_reentrant_for_holder() {
        let mut table = QueueTable::new();
        let key = TokenKey::new("deploy", QueueScope::Pipeline, None);

        assert!(table.try_acquire(key.clone(), &id("q1"), &id("branch-1")));
        assert!(table.try_acquire(key, &id("q2"), &id("branch-1")));
    }

    #[test]
    fn test_stage_scope_namespaces_keys() {
        let mut table = QueueTable::new();
        let first = TokenKey::new("db", QueueScope::Stage, Some(id("stage-1")));
        let second = TokenKey::new("db", QueueScope::Stage, Some(id("stage-2")));

        assert!(table.try_acquire(first, &id("q1"), &id("c1")));
        assert!(table.try_acquire(second, &id("q2"), &id("c2")));
    }
}
