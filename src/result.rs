//! Result of one evaluation round.

use std::fmt;

use ahash::AHashMap;

use crate::graph::{GraphView, WalkableGraph};
use crate::{ErrorInfo, Key, ValueRef, Version};

/// EvaluationResult holds the outcome of every requested root.
///
/// A root is absent from both [`values`](Self::values) and [`errors`](Self::errors) only in
/// fail-fast mode, when evaluation stopped before reaching it and it did not depend on the
/// failure.
pub struct EvaluationResult {
    roots: Vec<Key>,
    values: AHashMap<Key, ValueRef>,
    errors: AHashMap<Key, ErrorInfo>,
    version: Version,
    graph: GraphView,
}

impl EvaluationResult {
    pub(crate) fn new(
        roots: Vec<Key>,
        results: AHashMap<Key, Result<ValueRef, ErrorInfo>>,
        version: Version,
        graph: GraphView,
    ) -> Self {
        let mut values = AHashMap::default();
        let mut errors = AHashMap::default();
        for (key, result) in results {
            match result {
                Ok(value) => {
                    values.insert(key, value);
                }
                Err(error) => {
                    errors.insert(key, error);
                }
            }
        }
        Self {
            roots,
            values,
            errors,
            version,
            graph,
        }
    }

    /// The requested roots, in request order.
    pub fn roots(&self) -> &[Key] {
        &self.roots
    }

    /// Value of a root.
    pub fn get(&self, key: &Key) -> Option<&ValueRef> {
        self.values.get(key)
    }

    /// Value of a root, downcast to `T`.
    pub fn get_as<T: 'static>(&self, key: &Key) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    /// Error of a root.
    pub fn error(&self, key: &Key) -> Option<&ErrorInfo> {
        self.errors.get(key)
    }

    /// Returns true if any root failed.
    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Values of the roots that succeeded.
    pub fn values(&self) -> &AHashMap<Key, ValueRef> {
        &self.values
    }

    /// Errors of the roots that failed.
    pub fn errors(&self) -> &AHashMap<Key, ErrorInfo> {
        &self.errors
    }

    /// Version of the round that produced this result.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Read-only view of the graph at this round's version.
    pub fn walkable_graph(&self) -> &dyn WalkableGraph {
        &self.graph
    }
}

impl fmt::Debug for EvaluationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationResult")
            .field("version", &self.version)
            .field("values", &self.values)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}
