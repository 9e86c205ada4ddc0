//! Injection of externally supplied values.

use ahash::{AHashMap, AHashSet};
use tracing::trace;

use crate::graph::InMemoryGraph;
use crate::node::NodeState;
use crate::{Key, ValueRef, Version};

/// Drop injections that would not change anything.
///
/// An injection is pruned when the node is done, has no dependencies, holds an equal value,
/// and is not otherwise scheduled for invalidation or deletion. A previously computed node
/// is not injected at all: it is moved to `to_dirty` and recomputed by its function. An
/// edgeless graph has no dependencies to look at, so there any node not holding an injected
/// value counts as computed, and an injected node is removed before it is replaced. Returns
/// the number of dropped injections.
pub(crate) fn prune_injected_values(
    graph: &InMemoryGraph,
    to_inject: &mut AHashMap<Key, ValueRef>,
    to_dirty: &mut AHashSet<Key>,
    to_delete: &AHashSet<Key>,
) -> usize {
    let before = to_inject.len();
    let mut inner = graph.write();
    let keep_edges = inner.keep_edges();
    let mut computed = Vec::new();
    let mut replaced = Vec::new();

    to_inject.retain(|key, value| {
        let Some(index) = inner.index_of(key) else {
            return true;
        };
        let Some(node) = inner.node(index) else {
            return true;
        };
        if node.state != NodeState::Done {
            return true;
        }
        if !node.direct_deps.is_empty() || (!keep_edges && !node.injected) {
            trace!(key = ?key, "injection into computed node turned into invalidation");
            computed.push(key.clone());
            return false;
        }
        if !keep_edges {
            replaced.push(index);
            return true;
        }
        let unchanged = node.value.as_ref().is_some_and(|old| old.value_eq(&**value));
        let pruned = unchanged && !to_dirty.contains(key) && !to_delete.contains(key);
        if pruned {
            trace!(key = ?key, "pruned unchanged injection");
        }
        !pruned
    });

    for index in replaced {
        inner.remove(index);
    }
    to_dirty.extend(computed);
    before - to_inject.len()
}

/// Store every value in the graph at `version`. Returns the number of injected values.
pub(crate) fn inject_values(
    graph: &InMemoryGraph,
    to_inject: AHashMap<Key, ValueRef>,
    version: Version,
) -> usize {
    let mut inner = graph.write();
    let count = to_inject.len();
    for (key, value) in to_inject {
        trace!(key = ?key, "injected");
        inner.put_value(key, value, version);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value, FunctionName};

    const F: FunctionName = FunctionName::new("f");

    fn key(name: &str) -> Key {
        Key::new(F, name.to_string())
    }

    fn v1() -> Version {
        Version::MINIMAL.next()
    }

    fn injections(entries: &[(&str, i64)]) -> AHashMap<Key, ValueRef> {
        entries.iter().map(|(k, v)| (key(k), value(*v))).collect()
    }

    #[test]
    fn test_equal_leaf_value_is_pruned() {
        let graph = InMemoryGraph::new();
        graph.put_value(key("a"), value(1i64), v1());
        graph.put_value(key("b"), value(1i64), v1());

        let mut to_inject = injections(&[("a", 1), ("b", 2), ("new", 3)]);
        let mut to_dirty = AHashSet::default();
        let pruned = prune_injected_values(&graph, &mut to_inject, &mut to_dirty, &AHashSet::default());

        assert_eq!(pruned, 1);
        assert!(!to_inject.contains_key(&key("a")));
        assert!(to_inject.contains_key(&key("b")));
        assert!(to_inject.contains_key(&key("new")));
    }

    #[test]
    fn test_scheduled_keys_are_not_pruned() {
        let graph = InMemoryGraph::new();
        graph.put_value(key("a"), value(1i64), v1());
        graph.put_value(key("b"), value(1i64), v1());

        let mut to_inject = injections(&[("a", 1), ("b", 1)]);
        let mut to_dirty: AHashSet<Key> = [key("a")].into_iter().collect();
        let to_delete: AHashSet<Key> = [key("b")].into_iter().collect();
        let pruned = prune_injected_values(&graph, &mut to_inject, &mut to_dirty, &to_delete);

        assert_eq!(pruned, 0);
        assert_eq!(to_inject.len(), 2);
    }

    #[test]
    fn test_computed_node_is_invalidated_instead_of_injected() {
        let graph = InMemoryGraph::new();
        graph.put_value(key("a"), value(1i64), v1());
        {
            let mut inner = graph.write();
            let index = inner.get_or_create(&key("b"));
            inner.set_direct_deps(index, &[vec![key("a")]]);
            inner.set_value(index, value(2i64), v1());
        }

        let mut to_inject = injections(&[("b", 5), ("c", 1)]);
        let mut to_dirty = AHashSet::default();
        let dropped = prune_injected_values(&graph, &mut to_inject, &mut to_dirty, &AHashSet::default());

        assert_eq!(dropped, 1);
        assert!(!to_inject.contains_key(&key("b")));
        assert!(to_inject.contains_key(&key("c")));
        assert!(to_dirty.contains(&key("b")));

        inject_values(&graph, to_inject, v1().next());
        let node = graph.get(&key("b")).unwrap();
        assert_eq!(node.dependency_count(), 1);
        assert_eq!(node.value().and_then(|v| v.downcast_ref::<i64>().copied()), Some(2));
    }

    #[test]
    fn test_edgeless_removes_old_node() {
        let graph = InMemoryGraph::edgeless();
        graph.put_value(key("a"), value(1i64), Version::constant());

        let mut to_inject = injections(&[("a", 1)]);
        let mut to_dirty = AHashSet::default();
        let pruned = prune_injected_values(&graph, &mut to_inject, &mut to_dirty, &AHashSet::default());

        assert_eq!(pruned, 0);
        assert!(!graph.contains(&key("a")));
        assert_eq!(inject_values(&graph, to_inject, Version::constant()), 1);
        assert!(graph.contains(&key("a")));
        assert!(graph.get(&key("a")).unwrap().is_injected());
    }

    #[test]
    fn test_edgeless_computed_node_is_invalidated() {
        let graph = InMemoryGraph::edgeless();
        {
            let mut inner = graph.write();
            let index = inner.get_or_create(&key("b"));
            inner.set_value(index, value(2i64), Version::constant());
        }

        let mut to_inject = injections(&[("b", 5)]);
        let mut to_dirty = AHashSet::default();
        let dropped = prune_injected_values(&graph, &mut to_inject, &mut to_dirty, &AHashSet::default());

        assert_eq!(dropped, 1);
        assert!(to_inject.is_empty());
        assert!(to_dirty.contains(&key("b")));
        assert_eq!(graph.read().computed_keys(), vec![key("b")]);
    }
}
