use crate::{ErrorInfo, Key, ValueRef, Version};

/// Index of a node in the graph arena.
///
/// Edges between nodes are stored as indices, never as references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub(crate) usize);

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// The node exists but was never computed.
    NeverBuilt,
    /// The node is being computed in the current round.
    Building,
    /// The node holds a value that is valid at its `last_evaluated` version.
    Done,
    /// A transitive dependency changed. The node must be re-verified before use.
    Dirty,
    /// The node itself changed externally and must be recomputed.
    NeedsRebuild,
    /// The node holds an error that is valid at its `last_evaluated` version.
    Error,
}

impl NodeState {
    /// Returns true if the node's value or error can be used without re-verification.
    pub fn is_clean(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Error)
    }

    /// Returns true if the node was invalidated and awaits re-verification or rebuild.
    pub fn is_dirty(self) -> bool {
        matches!(self, NodeState::Dirty | NodeState::NeedsRebuild)
    }
}

/// NodeEntry is the graph's record of one computation.
///
/// Dirty and rebuilding nodes keep their previous value and error so change pruning can
/// compare against them.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub(crate) key: Key,
    pub(crate) state: NodeState,
    pub(crate) value: Option<ValueRef>,
    pub(crate) error: Option<ErrorInfo>,
    pub(crate) last_evaluated: Version,
    pub(crate) last_changed: Version,
    /// Forward dependencies grouped by request batch, in request order.
    pub(crate) direct_deps: Vec<Vec<NodeIndex>>,
    pub(crate) reverse_deps: Vec<NodeIndex>,
    pub(crate) injected: bool,
}

impl NodeEntry {
    pub(crate) fn new(key: Key) -> Self {
        Self {
            key,
            state: NodeState::NeverBuilt,
            value: None,
            error: None,
            last_evaluated: Version::MINIMAL,
            last_changed: Version::MINIMAL,
            direct_deps: Vec::new(),
            reverse_deps: Vec::new(),
            injected: false,
        }
    }

    /// The key of this node.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The current state of this node.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// The value if the node is done.
    pub fn value(&self) -> Option<&ValueRef> {
        match self.state {
            NodeState::Done => self.value.as_ref(),
            _ => None,
        }
    }

    /// The error if the node failed.
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self.state {
            NodeState::Error => self.error.as_ref(),
            _ => None,
        }
    }

    /// Version at which the node was last verified or computed.
    pub fn last_evaluated(&self) -> Version {
        self.last_evaluated
    }

    /// Version at which the node's value last changed.
    pub fn last_changed(&self) -> Version {
        self.last_changed
    }

    /// Returns true if the current value was injected rather than computed.
    pub fn is_injected(&self) -> bool {
        self.injected
    }

    /// Number of forward dependencies.
    pub fn dependency_count(&self) -> usize {
        self.direct_deps.iter().map(Vec::len).sum()
    }

    /// Number of reverse dependencies.
    pub fn dependent_count(&self) -> usize {
        self.reverse_deps.len()
    }

    pub(crate) fn add_reverse_dep(&mut self, index: NodeIndex) {
        if !self.reverse_deps.contains(&index) {
            self.reverse_deps.push(index);
        }
    }

    pub(crate) fn remove_reverse_dep(&mut self, index: NodeIndex) {
        self.reverse_deps.retain(|i| *i != index);
    }

    /// Returns true unless the node is clean and unchanged since `version`.
    pub(crate) fn changed_after(&self, version: Version) -> bool {
        !self.state.is_clean() || self.last_changed > version
    }
}
