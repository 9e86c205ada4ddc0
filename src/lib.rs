#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod context;
mod cycle;
mod differencer;
mod error;
mod evaluator;
mod events;
mod function;
mod graph;
mod injection;
mod invalidation;
mod key;
mod node;
mod parallel;
mod progress;
mod result;
mod version;

pub use context::{EvaluationContext, EvaluationContextBuilder, Interrupt};
pub use differencer::{Diff, Differencer, EmptyDifferencer, RecordingDifferencer};
pub use error::{CycleInfo, ErrorInfo, ErrorKind, EvaluateError, FunctionError, Interrupted};
pub use evaluator::{MemoizingEvaluator, MemoizingEvaluatorBuilder};
pub use events::{EvalEvent, EventCollector, EventSink, NullSink};
pub use function::{Environment, Function, FunctionRegistry};
pub use graph::{GraphView, InMemoryGraph, WalkableGraph};
pub use invalidation::InvalidationState;
pub use key::{value, DynEq, FunctionName, Key, KeyArgument, Value, ValueRef};
pub use node::{NodeEntry, NodeIndex, NodeState};
pub use parallel::MAX_REWINDS;
pub use progress::{EvaluationState, InflightTracker, NoopProgressReceiver, ProgressReceiver};
pub use result::EvaluationResult;
pub use version::Version;
