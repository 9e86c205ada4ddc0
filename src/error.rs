//! Error types for evaluation.

use std::fmt;
use std::sync::Arc;

use crate::key::{FunctionName, Key};

/// Outcome of a [`Function`](crate::Function) that did not produce a value.
///
/// User errors can be propagated using the `?` operator, which automatically
/// converts any `Into<anyhow::Error>` type into `FunctionError::Failed`.
#[derive(Debug, Clone)]
pub enum FunctionError {
    /// The function requested dependencies that are not computed yet.
    ///
    /// The evaluator computes them and re-enters the function once all of them reached a
    /// terminal state.
    Suspend,

    /// A dependency finished with an error.
    ///
    /// Returned by [`Environment::get`](crate::Environment::get). Propagating it with `?`
    /// makes this node fail with the same root causes.
    Dependency(ErrorInfo),

    /// Previously computed dependencies turned out to be inconsistent.
    ///
    /// The evaluator re-executes the listed keys within the same round, then re-enters this
    /// function.
    Rewind(Vec<Key>),

    /// The function observed the interruption of the round.
    Interrupted,

    /// User-defined failure.
    Failed(Arc<anyhow::Error>),
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionError::Suspend => write!(f, "function suspended on missing dependencies"),
            FunctionError::Dependency(info) => write!(f, "dependency failed: {}", info),
            FunctionError::Rewind(keys) => write!(f, "rewind requested for {:?}", keys),
            FunctionError::Interrupted => write!(f, "function interrupted"),
            FunctionError::Failed(e) => write!(f, "function failed: {}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for FunctionError {
    fn from(err: T) -> Self {
        FunctionError::Failed(Arc::new(err.into()))
    }
}

/// Ordered description of a dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleInfo {
    path_to_cycle: Vec<Key>,
    cycle: Vec<Key>,
}

impl CycleInfo {
    /// Create a cycle description for a member of the cycle.
    pub fn new(cycle: Vec<Key>) -> Self {
        Self {
            path_to_cycle: Vec::new(),
            cycle,
        }
    }

    /// Keys leading from the reporting key to the cycle, excluding the cycle itself.
    pub fn path_to_cycle(&self) -> &[Key] {
        &self.path_to_cycle
    }

    /// Keys forming the cycle, in dependency order.
    pub fn cycle(&self) -> &[Key] {
        &self.cycle
    }

    /// Returns the same cycle as seen from a key depending on this one.
    #[must_use]
    pub fn prepended(&self, key: Key) -> Self {
        let mut path_to_cycle = Vec::with_capacity(self.path_to_cycle.len() + 1);
        path_to_cycle.push(key);
        path_to_cycle.extend(self.path_to_cycle.iter().cloned());
        Self {
            path_to_cycle,
            cycle: self.cycle.clone(),
        }
    }
}

impl fmt::Display for CycleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<String> = self.path_to_cycle.iter().map(Key::debug_repr).collect();
        let cycle: Vec<String> = self.cycle.iter().map(Key::debug_repr).collect();
        if !path.is_empty() {
            write!(f, "{} -> ", path.join(" -> "))?;
        }
        write!(f, "[{}]", cycle.join(" -> "))
    }
}

/// Why a node failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    /// The node's function reported a failure.
    #[error("{0}")]
    Function(Arc<anyhow::Error>),

    /// The node is part of, or depends on, a dependency cycle.
    #[error("dependency cycle: {0}")]
    Cycle(CycleInfo),

    /// No function is registered for the key's function name.
    #[error("no function registered for `{0}`")]
    MissingFunction(FunctionName),

    /// The node requested more rewinds than allowed within one round.
    #[error("rewind limit exceeded")]
    RewindLimitExceeded,
}

/// Error stored for a failed node.
///
/// Error info is cached in the graph like a value and is invalidated the same way.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}")]
pub struct ErrorInfo {
    root_causes: Vec<Key>,
    kind: ErrorKind,
}

impl ErrorInfo {
    /// Create an error caused by `key` itself.
    pub fn new(key: Key, kind: ErrorKind) -> Self {
        Self {
            root_causes: vec![key],
            kind,
        }
    }

    /// Create a cycle error.
    pub fn cycle(info: CycleInfo) -> Self {
        Self {
            root_causes: Vec::new(),
            kind: ErrorKind::Cycle(info),
        }
    }

    /// Error of `parent` failing because a dependency failed with `child`.
    pub fn from_child(parent: &Key, child: &ErrorInfo) -> Self {
        match &child.kind {
            ErrorKind::Cycle(info) => Self::cycle(info.prepended(parent.clone())),
            _ => child.clone(),
        }
    }

    /// Keys whose own evaluation failed, causing this error.
    pub fn root_causes(&self) -> &[Key] {
        &self.root_causes
    }

    /// Why the node failed.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Cycle information if this is a cycle error.
    pub fn cycle_info(&self) -> Option<&CycleInfo> {
        match &self.kind {
            ErrorKind::Cycle(info) => Some(info),
            _ => None,
        }
    }

    /// Returns true if this is a cycle error.
    pub fn is_cycle(&self) -> bool {
        self.cycle_info().is_some()
    }
}

/// Distinguished condition signalling that a round was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Errors ending an [`evaluate`](crate::MemoizingEvaluator::evaluate) call early.
#[derive(Debug, thiserror::Error)]
pub enum EvaluateError {
    /// The round was interrupted. Its version was not committed.
    #[error("evaluation interrupted")]
    Interrupted(#[from] Interrupted),

    /// The worker pool could not be created.
    #[error("failed to build evaluator thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
