//! Computation functions and the environment they run in.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;

use crate::context::Interrupt;
use crate::error::FunctionError;
use crate::graph::{DependencyLookup, InMemoryGraph};
use crate::{FunctionName, Key, ValueRef, Version};

/// A function computes the value of every key carrying its [`FunctionName`].
///
/// Functions are re-entrant: when a dependency is not computed yet, [`Environment::get`]
/// returns [`FunctionError::Suspend`], the function returns it with `?`, and the evaluator
/// calls `compute` again from the start once the dependency is available. Dependencies
/// already available are returned immediately on re-entry, so functions must be
/// deterministic in the dependencies they request.
///
/// # Example
///
/// ```
/// use memo_flow::{value, Environment, Function, FunctionError, FunctionName, Key, ValueRef};
///
/// const LEN: FunctionName = FunctionName::new("len");
/// const TEXT: FunctionName = FunctionName::new("text");
///
/// struct Len;
///
/// impl Function for Len {
///     fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<ValueRef, FunctionError> {
///         let name = key.argument::<String>().cloned().unwrap_or_default();
///         let text = env.get(&Key::new(TEXT, name))?;
///         let len = text.downcast_ref::<String>().map_or(0, String::len);
///         Ok(value(len))
///     }
/// }
/// ```
pub trait Function: Send + Sync + 'static {
    /// Compute the value of `key`.
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<ValueRef, FunctionError>;
}

struct FnFunction<F>(F);

impl<F> Function for FnFunction<F>
where
    F: Fn(&Key, &mut Environment<'_>) -> Result<ValueRef, FunctionError> + Send + Sync + 'static,
{
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<ValueRef, FunctionError> {
        (self.0)(key, env)
    }
}

/// Registry of functions by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: AHashMap<FunctionName, Arc<dyn Function>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: FunctionName, function: impl Function) {
        self.functions.insert(name, Arc::new(function));
    }

    /// Register a closure under `name`.
    pub fn register_fn<F>(&mut self, name: FunctionName, function: F)
    where
        F: Fn(&Key, &mut Environment<'_>) -> Result<ValueRef, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, FnFunction(function));
    }

    /// Look up the function for a name.
    pub fn get(&self, name: FunctionName) -> Option<&Arc<dyn Function>> {
        self.functions.get(&name)
    }

    /// Returns true if a function is registered for `name`.
    pub fn contains(&self, name: FunctionName) -> bool {
        self.functions.contains_key(&name)
    }

    /// Registered function names.
    pub fn names(&self) -> impl Iterator<Item = FunctionName> + '_ {
        self.functions.keys().copied()
    }
}

/// Environment handed to a running [`Function`].
///
/// Every request is recorded as a dependency of the running key, whether or not the
/// requested value is available yet. Each call to [`get`](Self::get),
/// [`get_if_present`](Self::get_if_present) or [`get_values`](Self::get_values) records one
/// dependency group.
pub struct Environment<'a> {
    key: &'a Key,
    version: Version,
    graph: &'a InMemoryGraph,
    interrupt: &'a Interrupt,
    deps: Vec<Vec<Key>>,
    missing: Vec<Key>,
}

impl<'a> Environment<'a> {
    pub(crate) fn new(
        key: &'a Key,
        version: Version,
        graph: &'a InMemoryGraph,
        interrupt: &'a Interrupt,
    ) -> Self {
        Self {
            key,
            version,
            graph,
            interrupt,
            deps: Vec::new(),
            missing: Vec::new(),
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &Key {
        self.key
    }

    /// Version of the running round.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Request the value of a dependency.
    ///
    /// Returns [`FunctionError::Suspend`] if the dependency is not computed yet and
    /// [`FunctionError::Dependency`] if it failed. Both are meant to be propagated with `?`;
    /// a function may also handle a dependency error and produce a value instead.
    pub fn get(&mut self, key: &Key) -> Result<ValueRef, FunctionError> {
        self.get_if_present(key)?.ok_or(FunctionError::Suspend)
    }

    /// Request the value of a dependency without suspending.
    ///
    /// Returns `Ok(None)` if the dependency is not computed yet. The function should
    /// finish requesting what it can and then return [`FunctionError::Suspend`] when
    /// [`values_missing`](Self::values_missing) is true.
    pub fn get_if_present(&mut self, key: &Key) -> Result<Option<ValueRef>, FunctionError> {
        self.deps.push(vec![key.clone()]);
        self.lookup(key)
    }

    /// Request several dependencies as one group.
    ///
    /// All of them are scheduled together. Returns [`FunctionError::Suspend`] if any is
    /// missing, otherwise the first dependency error, otherwise the values in request order.
    pub fn get_values(&mut self, keys: &[Key]) -> Result<Vec<ValueRef>, FunctionError> {
        self.deps.push(keys.to_vec());
        let mut values = Vec::with_capacity(keys.len());
        let mut error = None;
        let mut any_missing = false;
        for key in keys {
            match self.lookup(key) {
                Ok(Some(value)) => values.push(value),
                Ok(None) => any_missing = true,
                Err(err) => {
                    error.get_or_insert(err);
                }
            }
        }
        if any_missing {
            return Err(FunctionError::Suspend);
        }
        match error {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }

    /// Returns true if any requested dependency was not computed yet.
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty()
    }

    /// Returns `Err(FunctionError::Interrupted)` if the round was interrupted.
    ///
    /// Long-running functions should call this periodically.
    pub fn check_interrupted(&self) -> Result<(), FunctionError> {
        self.interrupt
            .check()
            .map_err(|_| FunctionError::Interrupted)
    }

    pub(crate) fn into_deps(self) -> (Vec<Vec<Key>>, Vec<Key>) {
        (self.deps, self.missing)
    }

    fn lookup(&mut self, key: &Key) -> Result<Option<ValueRef>, FunctionError> {
        match self.graph.lookup_dependency(key) {
            DependencyLookup::Value(value) => Ok(Some(value)),
            DependencyLookup::Error(info) => Err(FunctionError::Dependency(info)),
            DependencyLookup::Missing => {
                if !self.missing.contains(key) {
                    self.missing.push(key.clone());
                }
                Ok(None)
            }
        }
    }
}
