//! Round-level events for observability.
//!
//! Events describe what a round did as a whole. Per-key notifications go through
//! [`ProgressReceiver`](crate::ProgressReceiver) instead.

use parking_lot::Mutex;

use crate::{Key, Version};

/// Event emitted by the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum EvalEvent {
    /// A round started.
    RoundStarted {
        /// Version issued to the round.
        version: Version,
        /// Requested roots.
        roots: Vec<String>,
    },
    /// Pending and differencer-reported changes were applied to the graph.
    Invalidated {
        /// Number of nodes marked dirty or needing rebuild.
        dirtied: usize,
        /// Number of nodes deleted.
        deleted: usize,
    },
    /// Values were injected into the graph.
    Injected {
        /// Number of injected values.
        count: usize,
    },
    /// A dependency cycle was found.
    CycleDetected {
        /// Cycle members in dependency order.
        cycle: Vec<String>,
    },
    /// A round finished.
    RoundFinished {
        /// Version issued to the round.
        version: Version,
        /// Whether the version was committed.
        committed: bool,
    },
    /// Size of the graph, as requested through `post_logging_stats`.
    GraphStats {
        /// Number of nodes.
        node_count: usize,
    },
}

impl EvalEvent {
    pub(crate) fn round_started(version: Version, roots: &[Key]) -> Self {
        EvalEvent::RoundStarted {
            version,
            roots: roots.iter().map(Key::debug_repr).collect(),
        }
    }

    pub(crate) fn cycle_detected(cycle: &[Key]) -> Self {
        EvalEvent::CycleDetected {
            cycle: cycle.iter().map(Key::debug_repr).collect(),
        }
    }
}

/// Sink receiving [`EvalEvent`]s.
pub trait EventSink: Send + Sync + 'static {
    /// Handle an event.
    fn emit(&self, event: EvalEvent);

    /// Flush buffered events.
    #[inline]
    fn flush(&self) {}
}

/// Sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    #[inline]
    fn emit(&self, _event: EvalEvent) {}
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<EvalEvent>>,
}

impl EventCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected events.
    pub fn events(&self) -> Vec<EvalEvent> {
        self.events.lock().clone()
    }

    /// Take the collected events, leaving the collector empty.
    pub fn take(&self) -> Vec<EvalEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for EventCollector {
    fn emit(&self, event: EvalEvent) {
        self.events.lock().push(event);
    }
}
