//! Progress receivers for observing per-key evaluation progress.
//!
//! [`ProgressReceiver`] has empty default methods, so implementations only override the
//! notifications they care about. [`InflightTracker`] wraps a receiver and remembers which
//! keys did not reach a terminal state, so the next round can delete them.
//!
//! # Example
//!
//! ```
//! use memo_flow::{EvaluationState, Key, ProgressReceiver};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct RecomputationCounter(AtomicUsize);
//!
//! impl ProgressReceiver for RecomputationCounter {
//!     fn evaluated(&self, _key: &Key, state: EvaluationState) {
//!         if state.is_recomputed() {
//!             self.0.fetch_add(1, Ordering::Relaxed);
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::Mutex;

use crate::invalidation::InvalidationState;
use crate::Key;

/// How a node reached a terminal state within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvaluationState {
    /// The function ran and produced a value different from the previous one.
    Changed,
    /// The function ran and produced a value equal to the previous one.
    Unchanged,
    /// The node was verified clean without running its function.
    Clean,
    /// The node finished with an error.
    Error,
}

impl EvaluationState {
    /// Returns true if the node's function ran to produce this state.
    pub fn is_recomputed(self) -> bool {
        matches!(self, EvaluationState::Changed | EvaluationState::Unchanged)
    }
}

/// Receiver of per-key progress notifications.
///
/// Notifications are delivered from the thread driving the evaluation, possibly while the
/// graph is locked, so implementations must not call back into the evaluator or its graph.
pub trait ProgressReceiver: Send + Sync + 'static {
    /// Called when a node is invalidated or deleted.
    #[inline]
    fn invalidated(&self, _key: &Key, _state: InvalidationState) {}

    /// Called when a node is about to be verified or computed.
    #[inline]
    fn enqueueing(&self, _key: &Key) {}

    /// Called when a node reached a terminal state.
    #[inline]
    fn evaluated(&self, _key: &Key, _state: EvaluationState) {}

    /// Called when a done node is about to be re-executed within the same round.
    #[inline]
    fn rewinding(&self, _key: &Key) {}
}

/// Receiver that discards all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressReceiver;

impl ProgressReceiver for NoopProgressReceiver {}

/// InflightTracker records keys that could not be trusted at the end of a round.
///
/// A key is inflight from [`enqueueing`](ProgressReceiver::enqueueing) until it reaches a
/// terminal state. A key is unsuccessfully rewound from
/// [`rewinding`](ProgressReceiver::rewinding) until it reaches a terminal state. Deleting a
/// key clears both. All notifications are forwarded to the wrapped receiver.
pub struct InflightTracker {
    inner: Arc<dyn ProgressReceiver>,
    inflight: Mutex<AHashSet<Key>>,
    unsuccessfully_rewound: Mutex<AHashSet<Key>>,
}

impl InflightTracker {
    /// Create a tracker forwarding to `inner`.
    pub fn new(inner: Arc<dyn ProgressReceiver>) -> Self {
        Self {
            inner,
            inflight: Mutex::new(AHashSet::default()),
            unsuccessfully_rewound: Mutex::new(AHashSet::default()),
        }
    }

    /// Take the keys left inflight, clearing them.
    pub fn get_and_clear_inflight_keys(&self) -> AHashSet<Key> {
        std::mem::take(&mut *self.inflight.lock())
    }

    /// Take the keys whose rewind did not complete, clearing them.
    pub fn get_and_clear_unsuccessfully_rewound_keys(&self) -> AHashSet<Key> {
        std::mem::take(&mut *self.unsuccessfully_rewound.lock())
    }

    /// Number of keys currently inflight.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl ProgressReceiver for InflightTracker {
    fn invalidated(&self, key: &Key, state: InvalidationState) {
        if state == InvalidationState::Deleted {
            self.inflight.lock().remove(key);
            self.unsuccessfully_rewound.lock().remove(key);
        }
        self.inner.invalidated(key, state);
    }

    fn enqueueing(&self, key: &Key) {
        self.inflight.lock().insert(key.clone());
        self.inner.enqueueing(key);
    }

    fn evaluated(&self, key: &Key, state: EvaluationState) {
        self.inflight.lock().remove(key);
        self.unsuccessfully_rewound.lock().remove(key);
        self.inner.evaluated(key, state);
    }

    fn rewinding(&self, key: &Key) {
        self.unsuccessfully_rewound.lock().insert(key.clone());
        self.inflight.lock().insert(key.clone());
        self.inner.rewinding(key);
    }
}
