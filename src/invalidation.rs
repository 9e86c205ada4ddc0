//! Dirty propagation and transitive deletion.

use ahash::AHashSet;
use tracing::trace;

use crate::graph::{GraphInner, InMemoryGraph};
use crate::node::{NodeIndex, NodeState};
use crate::progress::ProgressReceiver;
use crate::Key;

/// InvalidationState is what happened to an invalidated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationState {
    /// The node changed itself and must be recomputed.
    Changed,
    /// A transitive dependency changed. The node must be re-verified.
    Dirty,
    /// The node was removed from the graph.
    Deleted,
}

/// Invalidator propagates external changes through the reverse edges of a graph.
///
/// Neither operation runs any computation, and both are no-ops for an empty seed set.
pub(crate) struct Invalidator<'a> {
    graph: &'a InMemoryGraph,
    receiver: &'a dyn ProgressReceiver,
}

impl<'a> Invalidator<'a> {
    pub fn new(graph: &'a InMemoryGraph, receiver: &'a dyn ProgressReceiver) -> Self {
        Self { graph, receiver }
    }

    /// Mark each seed as needing rebuild and each transitive dependent as dirty.
    ///
    /// Propagation stops at nodes that are already dirty, because their dependents were
    /// dirtied when they were. Returns the number of nodes whose state changed.
    ///
    /// An edgeless graph cannot find dependents, so the seeds are deleted instead.
    pub fn invalidate<'k>(&self, seeds: impl IntoIterator<Item = &'k Key>) -> usize {
        let mut inner = self.graph.write();
        if !inner.keep_edges() {
            let seeds: Vec<NodeIndex> = seeds
                .into_iter()
                .filter_map(|key| inner.index_of(key))
                .collect();
            return self.remove_nodes(&mut inner, seeds);
        }

        let mut count = 0;
        let mut stack: Vec<NodeIndex> = Vec::new();
        for key in seeds {
            let Some(index) = inner.index_of(key) else {
                continue;
            };
            let Some(node) = inner.node_mut(index) else {
                continue;
            };
            match node.state {
                NodeState::NeedsRebuild => continue,
                NodeState::Dirty => {
                    // Dependents were dirtied together with this node.
                    node.state = NodeState::NeedsRebuild;
                }
                _ => {
                    node.state = NodeState::NeedsRebuild;
                    stack.extend(node.reverse_deps.iter().copied());
                }
            }
            count += 1;
            trace!(key = ?key, "invalidated as changed");
            self.receiver.invalidated(key, InvalidationState::Changed);
        }

        while let Some(index) = stack.pop() {
            let Some(node) = inner.node_mut(index) else {
                continue;
            };
            if node.state.is_dirty() {
                continue;
            }
            node.state = NodeState::Dirty;
            stack.extend(node.reverse_deps.iter().copied());
            count += 1;
            trace!(key = ?node.key, "invalidated as dirty");
            self.receiver.invalidated(&node.key, InvalidationState::Dirty);
        }
        count
    }

    /// Remove each key and all of its transitive dependents from the graph.
    ///
    /// Returns the number of removed nodes.
    pub fn delete<'k>(&self, keys: impl IntoIterator<Item = &'k Key>) -> usize {
        let mut inner = self.graph.write();
        let seeds: Vec<NodeIndex> = keys
            .into_iter()
            .filter_map(|key| inner.index_of(key))
            .collect();
        if !inner.keep_edges() {
            return self.remove_nodes(&mut inner, seeds);
        }

        let mut closure = AHashSet::default();
        let mut stack = seeds;
        while let Some(index) = stack.pop() {
            if !closure.insert(index) {
                continue;
            }
            if let Some(node) = inner.node(index) {
                stack.extend(node.reverse_deps.iter().copied());
            }
        }
        self.remove_nodes(&mut inner, closure)
    }

    fn remove_nodes(
        &self,
        inner: &mut GraphInner,
        indices: impl IntoIterator<Item = NodeIndex>,
    ) -> usize {
        let indices: AHashSet<NodeIndex> = indices.into_iter().collect();
        let mut count = 0;
        for index in &indices {
            inner.clear_direct_deps(*index);
        }
        for index in indices {
            let Some(node) = inner.remove(index) else {
                continue;
            };
            // Surviving dependents only exist when the caller did not pass the closure.
            for dependent in node.reverse_deps {
                if let Some(dependent) = inner.node_mut(dependent) {
                    dependent
                        .direct_deps
                        .iter_mut()
                        .for_each(|group| group.retain(|dep| *dep != index));
                    dependent.direct_deps.retain(|group| !group.is_empty());
                }
            }
            count += 1;
            trace!(key = ?node.key, "deleted");
            self.receiver.invalidated(&node.key, InvalidationState::Deleted);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgressReceiver;
    use crate::{value, FunctionName, Version};
    use parking_lot::Mutex;

    const F: FunctionName = FunctionName::new("f");

    fn key(name: &str) -> Key {
        Key::new(F, name.to_string())
    }

    /// Builds a -> b -> c (c depends on b depends on a) plus an unrelated d.
    fn chain() -> InMemoryGraph {
        let graph = InMemoryGraph::new();
        for (name, deps) in [("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"]), ("d", vec![])] {
            let mut inner = graph.write();
            let index = inner.get_or_create(&key(name));
            inner.set_direct_deps(index, &[deps.iter().map(|d| key(d)).collect::<Vec<_>>()]);
            let node = inner.node_mut(index).unwrap();
            node.state = NodeState::Done;
            node.value = Some(value(1i64));
            node.last_evaluated = Version::MINIMAL.next();
        }
        graph
    }

    fn state(graph: &InMemoryGraph, name: &str) -> Option<NodeState> {
        graph.get(&key(name)).map(|n| n.state())
    }

    #[derive(Default)]
    struct RecordingReceiver {
        events: Mutex<Vec<(Key, InvalidationState)>>,
    }

    impl ProgressReceiver for RecordingReceiver {
        fn invalidated(&self, key: &Key, state: InvalidationState) {
            self.events.lock().push((key.clone(), state));
        }
    }

    #[test]
    fn test_invalidate_is_transitive() {
        let graph = chain();
        let count = Invalidator::new(&graph, &NoopProgressReceiver).invalidate(&[key("a")]);
        assert_eq!(count, 3);
        assert_eq!(state(&graph, "a"), Some(NodeState::NeedsRebuild));
        assert_eq!(state(&graph, "b"), Some(NodeState::Dirty));
        assert_eq!(state(&graph, "c"), Some(NodeState::Dirty));
        assert_eq!(state(&graph, "d"), Some(NodeState::Done));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let graph = chain();
        let receiver = RecordingReceiver::default();
        let invalidator = Invalidator::new(&graph, &receiver);
        invalidator.invalidate(&[key("a")]);
        assert_eq!(invalidator.invalidate(&[key("a")]), 0);
        assert_eq!(receiver.events.lock().len(), 3);
    }

    #[test]
    fn test_invalidating_dirty_seed_upgrades_it() {
        let graph = chain();
        let invalidator = Invalidator::new(&graph, &NoopProgressReceiver);
        invalidator.invalidate(&[key("a")]);
        assert_eq!(invalidator.invalidate(&[key("b")]), 1);
        assert_eq!(state(&graph, "b"), Some(NodeState::NeedsRebuild));
    }

    #[test]
    fn test_empty_sets_are_noops() {
        let graph = chain();
        let invalidator = Invalidator::new(&graph, &NoopProgressReceiver);
        let none: [Key; 0] = [];
        assert_eq!(invalidator.invalidate(&none), 0);
        assert_eq!(invalidator.delete(&none), 0);
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_delete_removes_reverse_closure() {
        let graph = chain();
        let receiver = RecordingReceiver::default();
        let count = Invalidator::new(&graph, &receiver).delete(&[key("b")]);
        assert_eq!(count, 2);
        assert!(graph.contains(&key("a")));
        assert!(!graph.contains(&key("b")));
        assert!(!graph.contains(&key("c")));
        assert_eq!(graph.get(&key("a")).unwrap().dependent_count(), 0);
        assert!(receiver
            .events
            .lock()
            .iter()
            .all(|(_, state)| *state == InvalidationState::Deleted));
    }

    #[test]
    fn test_edgeless_invalidate_deletes_seeds_only() {
        let graph = InMemoryGraph::edgeless();
        for name in ["a", "b"] {
            graph.put_value(key(name), value(1i64), Version::MINIMAL.next());
        }
        let count = Invalidator::new(&graph, &NoopProgressReceiver).invalidate(&[key("a")]);
        assert_eq!(count, 1);
        assert!(!graph.contains(&key("a")));
        assert!(graph.contains(&key("b")));
    }
}
