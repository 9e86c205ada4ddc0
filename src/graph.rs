//! In-memory node table with reverse-edge tracking.

use std::fmt;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use slab::Slab;

use crate::node::{NodeEntry, NodeIndex, NodeState};
use crate::{ErrorInfo, Key, ValueRef, Version};

/// InMemoryGraph stores every node of the computation graph.
///
/// Nodes live in an arena and refer to each other by [`NodeIndex`]. All mutation goes
/// through a single `RwLock`, held only for the duration of one accessor call.
///
/// An edgeless graph keeps no forward or reverse dependencies. It caches values across
/// rounds but cannot propagate invalidation.
pub struct InMemoryGraph {
    inner: RwLock<GraphInner>,
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("InMemoryGraph")
            .field("nodes", &inner.nodes.len())
            .field("keep_edges", &inner.keep_edges)
            .finish()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<InMemoryGraph>();
    assert_sync::<InMemoryGraph>();
}

impl InMemoryGraph {
    /// Create a new edge-tracking graph.
    pub fn new() -> Self {
        Self::with_edges(true)
    }

    /// Create a new graph that does not track dependency edges.
    pub fn edgeless() -> Self {
        Self::with_edges(false)
    }

    fn with_edges(keep_edges: bool) -> Self {
        Self {
            inner: RwLock::new(GraphInner {
                index: AHashMap::default(),
                nodes: Slab::new(),
                keep_edges,
            }),
        }
    }

    /// Returns true if this graph tracks dependency edges.
    pub fn keeps_edges(&self) -> bool {
        self.inner.read().keep_edges
    }

    /// Get a snapshot of the node for a key.
    pub fn get(&self, key: &Key) -> Option<NodeEntry> {
        self.inner.read().get(key).cloned()
    }

    /// Returns true if the graph holds a node for the key.
    pub fn contains(&self, key: &Key) -> bool {
        self.inner.read().index.contains_key(key)
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns true if the graph holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys in the graph.
    pub fn keys(&self) -> Vec<Key> {
        self.inner.read().index.keys().cloned().collect()
    }

    /// Values of all nodes that are done.
    pub fn done_values(&self) -> AHashMap<Key, ValueRef> {
        let inner = self.inner.read();
        inner
            .nodes
            .iter()
            .filter_map(|(_, node)| Some((node.key.clone(), node.value()?.clone())))
            .collect()
    }

    /// Store a value for a key at `version`, marking the node done without computation.
    ///
    /// Any forward dependencies of the node are dropped. Returns true if the stored value
    /// differs from the previous one.
    pub fn put_value(&self, key: Key, value: ValueRef, version: Version) -> bool {
        self.inner.write().put_value(key, value, version)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, GraphInner> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, GraphInner> {
        self.inner.write()
    }

    /// Look up a dependency on behalf of a running function.
    pub(crate) fn lookup_dependency(&self, key: &Key) -> DependencyLookup {
        let inner = self.inner.read();
        match inner.get(key) {
            Some(node) => match (node.state, &node.value, &node.error) {
                (NodeState::Done, Some(value), _) => DependencyLookup::Value(value.clone()),
                (NodeState::Error, _, Some(error)) => DependencyLookup::Error(error.clone()),
                _ => DependencyLookup::Missing,
            },
            None => DependencyLookup::Missing,
        }
    }
}

/// Result of looking up a dependency.
pub(crate) enum DependencyLookup {
    Value(ValueRef),
    Error(ErrorInfo),
    Missing,
}

/// Lock-protected state of an [`InMemoryGraph`].
pub(crate) struct GraphInner {
    index: AHashMap<Key, NodeIndex>,
    nodes: Slab<NodeEntry>,
    keep_edges: bool,
}

impl GraphInner {
    pub fn keep_edges(&self) -> bool {
        self.keep_edges
    }

    pub fn index_of(&self, key: &Key) -> Option<NodeIndex> {
        self.index.get(key).copied()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&NodeEntry> {
        self.nodes.get(index.0)
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(index.0)
    }

    pub fn get(&self, key: &Key) -> Option<&NodeEntry> {
        self.node(self.index_of(key)?)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut NodeEntry> {
        let index = self.index_of(key)?;
        self.node_mut(index)
    }

    pub fn get_or_create(&mut self, key: &Key) -> NodeIndex {
        if let Some(index) = self.index_of(key) {
            return index;
        }
        let index = NodeIndex(self.nodes.insert(NodeEntry::new(key.clone())));
        self.index.insert(key.clone(), index);
        index
    }

    /// Remove a node. The caller is responsible for edges pointing at it.
    pub fn remove(&mut self, index: NodeIndex) -> Option<NodeEntry> {
        let node = self.nodes.try_remove(index.0)?;
        self.index.remove(&node.key);
        Some(node)
    }

    /// Keys of the forward dependencies of a node, grouped by request batch.
    pub fn dependency_keys(&self, index: NodeIndex) -> Vec<Vec<Key>> {
        let Some(node) = self.node(index) else {
            return Vec::new();
        };
        node.direct_deps
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter_map(|dep| self.node(*dep).map(|n| n.key.clone()))
                    .collect()
            })
            .collect()
    }

    /// Keys of the reverse dependencies of a node.
    pub fn dependent_keys(&self, index: NodeIndex) -> Vec<Key> {
        let Some(node) = self.node(index) else {
            return Vec::new();
        };
        node.reverse_deps
            .iter()
            .filter_map(|dep| self.node(*dep).map(|n| n.key.clone()))
            .collect()
    }

    /// Replace the forward dependencies of a node, keeping reverse edges in sync.
    ///
    /// Dependencies that are not in the graph are skipped.
    pub fn set_direct_deps(&mut self, index: NodeIndex, groups: &[Vec<Key>]) {
        if !self.keep_edges {
            return;
        }
        self.clear_direct_deps(index);
        let mut seen = AHashSet::default();
        let mut resolved = Vec::with_capacity(groups.len());
        for group in groups {
            let group: Vec<NodeIndex> = group
                .iter()
                .filter_map(|key| self.index_of(key))
                .filter(|dep| seen.insert(*dep))
                .collect();
            if !group.is_empty() {
                resolved.push(group);
            }
        }
        for dep in resolved.iter().flatten() {
            if let Some(node) = self.node_mut(*dep) {
                node.add_reverse_dep(index);
            }
        }
        if let Some(node) = self.node_mut(index) {
            node.direct_deps = resolved;
        }
    }

    /// Drop the forward dependencies of a node.
    pub fn clear_direct_deps(&mut self, index: NodeIndex) {
        let Some(node) = self.node_mut(index) else {
            return;
        };
        let old = std::mem::take(&mut node.direct_deps);
        for dep in old.into_iter().flatten() {
            if let Some(node) = self.node_mut(dep) {
                node.remove_reverse_dep(index);
            }
        }
    }

    pub fn put_value(&mut self, key: Key, value: ValueRef, version: Version) -> bool {
        let index = self.get_or_create(&key);
        self.clear_direct_deps(index);
        let changed = self.set_value(index, value, version);
        if let Some(node) = self.node_mut(index) {
            node.injected = true;
        }
        changed
    }

    /// Mark a node done with `value`, keeping `last_changed` if the value is equal to the
    /// previous one. Returns true if the value changed.
    pub fn set_value(&mut self, index: NodeIndex, value: ValueRef, version: Version) -> bool {
        let Some(node) = self.node_mut(index) else {
            return false;
        };
        let changed = !matches!(&node.value, Some(old) if old.value_eq(&*value))
            || node.error.is_some();
        node.value = Some(value);
        node.error = None;
        node.injected = false;
        node.state = NodeState::Done;
        node.last_evaluated = version;
        if changed {
            node.last_changed = version;
        }
        changed
    }

    /// Mark a node failed. Errors always count as changed.
    pub fn set_error(&mut self, index: NodeIndex, error: ErrorInfo, version: Version) {
        if let Some(node) = self.node_mut(index) {
            node.value = None;
            node.error = Some(error);
            node.injected = false;
            node.state = NodeState::Error;
            node.last_evaluated = version;
            node.last_changed = version;
        }
    }

    /// Set the state of an existing node.
    pub fn set_state(&mut self, index: NodeIndex, state: NodeState) {
        if let Some(node) = self.node_mut(index) {
            node.state = state;
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> + '_ {
        self.nodes.iter().map(|(_, node)| node)
    }

    /// Keys of every node not holding an injected value.
    pub fn computed_keys(&self) -> Vec<Key> {
        self.nodes()
            .filter(|node| !node.injected)
            .map(|node| node.key.clone())
            .collect()
    }
}

/// Read-only view of a graph, as handed to differencers and returned with results.
pub trait WalkableGraph: Send + Sync {
    /// Version of the round this view belongs to.
    fn version(&self) -> Version;

    /// Value of a done node.
    fn get_value(&self, key: &Key) -> Option<ValueRef>;

    /// Error of a failed node.
    fn get_error(&self, key: &Key) -> Option<ErrorInfo>;

    /// Returns true if the graph holds a node for the key.
    fn contains(&self, key: &Key) -> bool;

    /// Forward dependencies of a node, flattened in request order.
    fn direct_deps(&self, key: &Key) -> Option<Vec<Key>>;

    /// Reverse dependencies of a node.
    fn reverse_deps(&self, key: &Key) -> Option<Vec<Key>>;
}

/// A [`WalkableGraph`] over an [`InMemoryGraph`] pinned at a round's version.
///
/// The view reads the live graph. It reflects its round until the next round starts.
#[derive(Clone)]
pub struct GraphView {
    graph: Arc<InMemoryGraph>,
    version: Version,
}

impl GraphView {
    /// Create a view of `graph` at `version`.
    pub fn new(graph: Arc<InMemoryGraph>, version: Version) -> Self {
        Self { graph, version }
    }

    /// The underlying graph.
    pub fn graph(&self) -> &Arc<InMemoryGraph> {
        &self.graph
    }
}

impl fmt::Debug for GraphView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphView")
            .field("version", &self.version)
            .field("graph", &self.graph)
            .finish()
    }
}

impl WalkableGraph for GraphView {
    fn version(&self) -> Version {
        self.version
    }

    fn get_value(&self, key: &Key) -> Option<ValueRef> {
        self.graph.read().get(key)?.value().cloned()
    }

    fn get_error(&self, key: &Key) -> Option<ErrorInfo> {
        self.graph.read().get(key)?.error().cloned()
    }

    fn contains(&self, key: &Key) -> bool {
        self.graph.contains(key)
    }

    fn direct_deps(&self, key: &Key) -> Option<Vec<Key>> {
        let inner = self.graph.read();
        let index = inner.index_of(key)?;
        Some(inner.dependency_keys(index).into_iter().flatten().collect())
    }

    fn reverse_deps(&self, key: &Key) -> Option<Vec<Key>> {
        let inner = self.graph.read();
        let index = inner.index_of(key)?;
        Some(inner.dependent_keys(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value, FunctionName};

    const F: FunctionName = FunctionName::new("f");

    fn key(name: &str) -> Key {
        Key::new(F, name.to_string())
    }

    fn done(graph: &InMemoryGraph, name: &str, v: i64, deps: &[&str]) {
        let mut inner = graph.write();
        let index = inner.get_or_create(&key(name));
        let groups = vec![deps.iter().map(|d| key(d)).collect::<Vec<_>>()];
        inner.set_direct_deps(index, &groups);
        let node = inner.node_mut(index).unwrap();
        node.state = NodeState::Done;
        node.value = Some(value(v));
        node.last_evaluated = Version::MINIMAL.next();
        node.last_changed = Version::MINIMAL.next();
    }

    #[test]
    fn test_edges_are_kept_in_sync() {
        let graph = InMemoryGraph::new();
        done(&graph, "a", 1, &[]);
        done(&graph, "b", 2, &["a"]);

        let view = GraphView::new(Arc::new(graph), Version::MINIMAL.next());
        assert_eq!(view.direct_deps(&key("b")), Some(vec![key("a")]));
        assert_eq!(view.reverse_deps(&key("a")), Some(vec![key("b")]));
        assert_eq!(
            view.get_value(&key("b")).and_then(|v| v.downcast_ref::<i64>().copied()),
            Some(2)
        );
    }

    #[test]
    fn test_replacing_deps_drops_old_reverse_edges() {
        let graph = InMemoryGraph::new();
        done(&graph, "a", 1, &[]);
        done(&graph, "c", 1, &[]);
        done(&graph, "b", 2, &["a"]);
        done(&graph, "b", 2, &["c"]);

        assert_eq!(graph.get(&key("a")).unwrap().dependent_count(), 0);
        assert_eq!(graph.get(&key("c")).unwrap().dependent_count(), 1);
        assert_eq!(graph.get(&key("b")).unwrap().dependency_count(), 1);
    }

    #[test]
    fn test_edgeless_graph_keeps_no_edges() {
        let graph = InMemoryGraph::edgeless();
        done(&graph, "a", 1, &[]);
        done(&graph, "b", 2, &["a"]);

        assert!(!graph.keeps_edges());
        assert_eq!(graph.get(&key("b")).unwrap().dependency_count(), 0);
        assert_eq!(graph.get(&key("a")).unwrap().dependent_count(), 0);
    }

    #[test]
    fn test_put_value_reports_change() {
        let graph = InMemoryGraph::new();
        let v1 = Version::MINIMAL.next();
        let v2 = v1.next();
        assert!(graph.put_value(key("a"), value(1i64), v1));
        assert!(!graph.put_value(key("a"), value(1i64), v2));
        let node = graph.get(&key("a")).unwrap();
        assert_eq!(node.last_changed(), v1);
        assert_eq!(node.last_evaluated(), v2);
        assert!(graph.put_value(key("a"), value(2i64), v2));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.done_values().len(), 1);
    }
}
