//! Keys and values of the computation graph.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Name of a computation type.
///
/// Every [`Key`] carries the name of the [`Function`](crate::Function) that computes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FunctionName(&'static str);

impl FunctionName {
    /// Create a new function name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Get the name as a string.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Object-safe equality comparison.
///
/// Compares two trait objects by downcasting `other` to the concrete type of `self`.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for types that can serve as the argument of a [`Key`].
///
/// Automatically implemented for all `Hash + Eq + Debug + Send + Sync + 'static` types.
pub trait KeyArgument: DynHash + DynEq + Debug + Send + Sync {
    /// Get the argument as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> KeyArgument for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(KeyArgument);

/// Key identifies one computation: a function name plus its argument.
///
/// This is cheap to clone, the argument is behind an `Arc`.
///
/// # Examples
///
/// ```
/// # use memo_flow::{FunctionName, Key};
/// const PARSE: FunctionName = FunctionName::new("parse");
///
/// let a = Key::new(PARSE, "main.rs".to_string());
/// let b = Key::new(PARSE, "main.rs".to_string());
/// assert_eq!(a, b);
/// assert_eq!(a.argument::<String>().map(String::as_str), Some("main.rs"));
/// ```
#[derive(Clone)]
pub struct Key {
    function: FunctionName,
    argument: Arc<dyn KeyArgument>,
}

impl Key {
    /// Create a new key.
    pub fn new<A: KeyArgument + 'static>(function: FunctionName, argument: A) -> Self {
        Self {
            function,
            argument: Arc::new(argument),
        }
    }

    /// Name of the function computing this key.
    pub fn function(&self) -> FunctionName {
        self.function
    }

    /// Downcast the argument to its original type.
    pub fn argument<A: 'static>(&self) -> Option<&A> {
        (*self.argument).as_any().downcast_ref()
    }

    /// Debug representation of this key, e.g. `parse("main.rs")`.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }

    fn argument_type(&self) -> TypeId {
        (*self.argument).as_any().type_id()
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.function, self.argument)
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.function.hash(state);
        self.argument_type().hash(state);
        self.argument.hash(state);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.function == other.function
            && (*self.argument).dyn_eq((*other.argument).as_any())
    }
}

impl Eq for Key {}

/// Immutable result of evaluating a [`Key`].
///
/// Automatically implemented for all `PartialEq + Debug + Send + Sync + 'static` types.
/// The `PartialEq` implementation is the domain equality used for change pruning and for
/// skipping no-op injections.
pub trait Value: Any + Debug + Send + Sync {
    /// Get the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn value_eq(&self, other: &dyn Value) -> bool;
}

impl<T: PartialEq + Debug + Send + Sync + 'static> Value for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_eq(&self, other: &dyn Value) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

impl dyn Value {
    /// Downcast the value to a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// Shared reference to a [`Value`].
pub type ValueRef = Arc<dyn Value>;

/// Wrap a value into a [`ValueRef`].
pub fn value<T: Value>(value: T) -> ValueRef {
    Arc::new(value)
}
