//! Differencers report externally changed keys between rounds.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

use crate::error::Interrupted;
use crate::graph::WalkableGraph;
use crate::{Key, ValueRef, Version};

/// Diff is the set of keys that changed externally since the last committed round.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    changed_with_new_values: AHashMap<Key, ValueRef>,
    changed_without_new_values: AHashSet<Key>,
}

impl Diff {
    /// Create a diff.
    pub fn new(
        changed_with_new_values: AHashMap<Key, ValueRef>,
        changed_without_new_values: AHashSet<Key>,
    ) -> Self {
        Self {
            changed_with_new_values,
            changed_without_new_values,
        }
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changed_with_new_values.is_empty() && self.changed_without_new_values.is_empty()
    }

    /// Changed keys with a value ready to inject.
    pub fn changed_keys_with_new_values(&self) -> &AHashMap<Key, ValueRef> {
        &self.changed_with_new_values
    }

    /// Changed keys that must be recomputed.
    pub fn changed_keys_without_new_values(&self) -> &AHashSet<Key> {
        &self.changed_without_new_values
    }

    /// Split the diff into its two parts.
    pub fn into_parts(self) -> (AHashMap<Key, ValueRef>, AHashSet<Key>) {
        (self.changed_with_new_values, self.changed_without_new_values)
    }

    /// Record a changed key with its new value.
    pub fn inject(&mut self, key: Key, value: ValueRef) {
        self.changed_without_new_values.remove(&key);
        self.changed_with_new_values.insert(key, value);
    }

    /// Record a changed key without a value.
    pub fn invalidate(&mut self, key: Key) {
        self.changed_with_new_values.remove(&key);
        self.changed_without_new_values.insert(key);
    }

    /// Apply `later` on top of this diff. Later changes win.
    pub fn merge(&mut self, later: Diff) {
        for (key, value) in later.changed_with_new_values {
            self.inject(key, value);
        }
        for key in later.changed_without_new_values {
            self.invalidate(key);
        }
    }
}

/// Differencer computes which keys changed externally between two versions.
///
/// Calling `get_diff` again with the same `from` version, after a round that did not
/// commit, must return at least the changes reported by the previous call.
pub trait Differencer: Send + Sync + 'static {
    /// Changes in the version range `(from, to]`.
    fn get_diff(
        &self,
        graph: &dyn WalkableGraph,
        from: Version,
        to: Version,
    ) -> Result<Diff, Interrupted>;
}

/// Differencer that never reports changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDifferencer;

impl Differencer for EmptyDifferencer {
    fn get_diff(&self, _: &dyn WalkableGraph, _: Version, _: Version) -> Result<Diff, Interrupted> {
        Ok(Diff::default())
    }
}

/// RecordingDifferencer reports the changes recorded through [`inject`](Self::inject) and
/// [`invalidate`](Self::invalidate).
///
/// Recorded changes are handed out once. If the next request starts from the same version
/// as the previous one but targets a different version, the previous round did not commit,
/// and its changes are handed out again together with anything recorded since. Requests
/// repeating both versions, as an edgeless evaluator makes every round, only get what was
/// recorded since.
#[derive(Debug, Default)]
pub struct RecordingDifferencer {
    state: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    recorded: Diff,
    delivered: Option<Delivery>,
}

#[derive(Debug)]
struct Delivery {
    from: Version,
    to: Version,
    diff: Diff,
}

impl RecordingDifferencer {
    /// Create an empty differencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new externally supplied value for a key.
    pub fn inject(&self, key: Key, value: ValueRef) {
        self.state.lock().recorded.inject(key, value);
    }

    /// Record keys that changed externally and must be recomputed.
    pub fn invalidate(&self, keys: impl IntoIterator<Item = Key>) {
        let mut state = self.state.lock();
        for key in keys {
            state.recorded.invalidate(key);
        }
    }
}

impl Differencer for RecordingDifferencer {
    fn get_diff(
        &self,
        _graph: &dyn WalkableGraph,
        from: Version,
        to: Version,
    ) -> Result<Diff, Interrupted> {
        let mut state = self.state.lock();
        let recorded = std::mem::take(&mut state.recorded);
        let diff = match state.delivered.take() {
            Some(mut delivered) if delivered.from == from && delivered.to != to => {
                delivered.diff.merge(recorded);
                delivered.diff
            }
            _ => recorded,
        };
        state.delivered = Some(Delivery {
            from,
            to,
            diff: diff.clone(),
        });
        Ok(diff)
    }
}
