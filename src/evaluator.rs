//! The versioned evaluation driver.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, debug_span};

use crate::context::EvaluationContext;
use crate::differencer::{Differencer, EmptyDifferencer};
use crate::error::EvaluateError;
use crate::events::{EvalEvent, EventSink};
use crate::function::{Environment, Function, FunctionRegistry};
use crate::graph::{GraphView, InMemoryGraph};
use crate::injection::{inject_values, prune_injected_values};
use crate::invalidation::Invalidator;
use crate::parallel::ParallelEvaluator;
use crate::progress::{InflightTracker, NoopProgressReceiver, ProgressReceiver};
use crate::result::EvaluationResult;
use crate::{ErrorInfo, FunctionError, FunctionName, Key, ValueRef, Version};

#[derive(Debug, Default)]
struct Versions {
    last_issued: Version,
    last_committed: Version,
}

/// Changes queued for the next round.
#[derive(Default)]
struct PendingChanges {
    to_inject: AHashMap<Key, ValueRef>,
    to_dirty: AHashSet<Key>,
    to_delete: AHashSet<Key>,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.to_inject.is_empty() && self.to_dirty.is_empty() && self.to_delete.is_empty()
    }
}

/// Resets the evaluating flag when the round ends, including by panic.
struct EvaluationGuard<'a>(&'a AtomicBool);

impl<'a> EvaluationGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("re-entrant evaluation: evaluate was called while another evaluation on the same evaluator is in progress");
        }
        Self(flag)
    }
}

impl Drop for EvaluationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// MemoizingEvaluator evaluates keys incrementally, reusing results across rounds.
///
/// Each call to [`evaluate`](Self::evaluate) is one round. A round applies external changes
/// reported by the [`Differencer`] and queued through [`inject`](Self::inject),
/// [`invalidate`](Self::invalidate) and [`delete`](Self::delete), then computes the
/// requested roots, recomputing only what those changes affect.
///
/// # Example
///
/// ```
/// use memo_flow::{value, EvaluationContext, FunctionName, Key, MemoizingEvaluator};
///
/// const INPUT: FunctionName = FunctionName::new("input");
/// const DOUBLE: FunctionName = FunctionName::new("double");
///
/// let evaluator = MemoizingEvaluator::builder()
///     .register_fn(DOUBLE, |key, env| {
///         let name = key.argument::<&str>().copied().unwrap_or_default();
///         let input = env.get(&Key::new(INPUT, name))?;
///         let n = input.downcast_ref::<i64>().copied().unwrap_or_default();
///         Ok(value(n * 2))
///     })
///     .build();
///
/// evaluator.inject(Key::new(INPUT, "x"), value(21i64));
/// let root = Key::new(DOUBLE, "x");
/// let result = evaluator.evaluate([root.clone()], &EvaluationContext::default()).unwrap();
/// assert_eq!(result.get_as::<i64>(&root), Some(&42));
/// ```
pub struct MemoizingEvaluator {
    graph: RwLock<Arc<InMemoryGraph>>,
    functions: FunctionRegistry,
    differencer: Arc<dyn Differencer>,
    tracker: InflightTracker,
    keep_edges: bool,
    versions: Mutex<Versions>,
    pending: Mutex<PendingChanges>,
    evaluating: AtomicBool,
    pool: Mutex<Option<(usize, Arc<rayon::ThreadPool>)>>,
}

impl fmt::Debug for MemoizingEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizingEvaluator")
            .field("graph", &*self.graph.read())
            .field("functions", &self.functions)
            .field("keep_edges", &self.keep_edges)
            .field("versions", &*self.versions.lock())
            .finish_non_exhaustive()
    }
}

impl MemoizingEvaluator {
    /// Start building an evaluator.
    pub fn builder() -> MemoizingEvaluatorBuilder {
        MemoizingEvaluatorBuilder::default()
    }

    /// Evaluate `roots` in a new round.
    ///
    /// Returns [`EvaluateError::Interrupted`] if the context's interrupt was triggered or a
    /// function returned [`FunctionError::Interrupted`]. An interrupted round does not
    /// commit its version; the next round re-requests the diff from the same starting
    /// version and deletes whatever was left in flight.
    ///
    /// # Panics
    ///
    /// Panics if called while another `evaluate` call on the same evaluator has not
    /// returned, including from inside one of its functions. Panics raised by functions
    /// are re-raised after in-flight work drained.
    pub fn evaluate(
        &self,
        roots: impl IntoIterator<Item = Key>,
        ctx: &EvaluationContext,
    ) -> Result<EvaluationResult, EvaluateError> {
        let _guard = EvaluationGuard::acquire(&self.evaluating);
        let roots: Vec<Key> = roots.into_iter().collect();
        let graph = self.graph();
        let (version, last_committed) = self.next_version();

        let span = debug_span!("evaluate", %version, roots = roots.len());
        let _enter = span.enter();
        ctx.event_sink.emit(EvalEvent::round_started(version, &roots));

        {
            let mut pending = self.pending.lock();
            pending
                .to_delete
                .extend(self.tracker.get_and_clear_inflight_keys());
            pending
                .to_delete
                .extend(self.tracker.get_and_clear_unsuccessfully_rewound_keys());
        }

        let view = GraphView::new(graph.clone(), last_committed);
        let diff = match self.differencer.get_diff(&view, last_committed, version) {
            Ok(diff) => diff,
            Err(interrupted) => {
                debug!("diff interrupted");
                self.finish_round(ctx, version, false);
                return Err(interrupted.into());
            }
        };

        let pending = std::mem::take(&mut *self.pending.lock());
        if !diff.is_empty() || !pending.is_empty() {
            let (with_values, without_values) = diff.into_parts();
            let PendingChanges {
                mut to_inject,
                mut to_dirty,
                mut to_delete,
            } = pending;
            to_inject.extend(with_values);
            to_dirty.extend(without_values);

            let pruned = prune_injected_values(&graph, &mut to_inject, &mut to_dirty, &to_delete);
            to_dirty.extend(to_inject.keys().cloned());
            if !self.keep_edges
                && !(to_inject.is_empty() && to_dirty.is_empty() && to_delete.is_empty())
            {
                // Without edges a change cannot reach the nodes that read it.
                to_delete.extend(graph.read().computed_keys());
            }

            let invalidator = Invalidator::new(&graph, &self.tracker);
            let deleted = invalidator.delete(&to_delete);
            let dirtied = invalidator.invalidate(&to_dirty);
            debug!(dirtied, deleted, pruned, "applied external changes");
            ctx.event_sink
                .emit(EvalEvent::Invalidated { dirtied, deleted });

            let count = inject_values(&graph, to_inject, version);
            if count > 0 {
                ctx.event_sink.emit(EvalEvent::Injected { count });
            }
        }

        let pool = self.thread_pool(ctx)?;
        let evaluator = ParallelEvaluator::new(&graph, &self.functions, &self.tracker, ctx, version);
        match evaluator.eval(&pool, &roots) {
            Ok(results) => {
                if self.keep_edges {
                    self.versions.lock().last_committed = version;
                }
                self.finish_round(ctx, version, self.keep_edges);
                Ok(EvaluationResult::new(
                    roots,
                    results,
                    version,
                    GraphView::new(graph, version),
                ))
            }
            Err(interrupted) => {
                self.finish_round(ctx, version, false);
                Err(interrupted.into())
            }
        }
    }

    /// Queue a value to inject at the start of the next round.
    pub fn inject(&self, key: Key, value: ValueRef) {
        let mut pending = self.pending.lock();
        pending.to_dirty.remove(&key);
        pending.to_inject.insert(key, value);
    }

    /// Queue keys to invalidate at the start of the next round.
    pub fn invalidate(&self, keys: impl IntoIterator<Item = Key>) {
        self.pending.lock().to_dirty.extend(keys);
    }

    /// Queue every key in the graph matching `predicate` for deletion at the start of the
    /// next round. Their transitive dependents are deleted too.
    pub fn delete(&self, predicate: impl Fn(&Key) -> bool) {
        let keys: Vec<Key> = self
            .graph()
            .keys()
            .into_iter()
            .filter(|key| predicate(key))
            .collect();
        self.pending.lock().to_delete.extend(keys);
    }

    /// Queue dirty nodes last evaluated at least `age_limit` versions before the last
    /// committed version for deletion.
    pub fn delete_dirty(&self, age_limit: u64) {
        let last_committed = self.last_committed_version().value();
        let graph = self.graph();
        let keys: Vec<Key> = graph
            .read()
            .nodes()
            .filter(|node| {
                node.state().is_dirty()
                    && node.last_evaluated().value().saturating_add(age_limit) <= last_committed
            })
            .map(|node| node.key().clone())
            .collect();
        debug!(count = keys.len(), age_limit, "deleting old dirty nodes");
        self.pending.lock().to_delete.extend(keys);
    }

    /// Emit the size of the graph to `sink`.
    pub fn post_logging_stats(&self, sink: &dyn EventSink) {
        sink.emit(EvalEvent::GraphStats {
            node_count: self.graph().len(),
        });
    }

    /// The version of the last committed round.
    pub fn last_committed_version(&self) -> Version {
        self.versions.lock().last_committed
    }

    /// The current graph.
    pub fn graph(&self) -> Arc<InMemoryGraph> {
        self.graph.read().clone()
    }

    /// Value of a key as currently stored in the graph, if it is done.
    pub fn get_existing_value(&self, key: &Key) -> Option<ValueRef> {
        self.graph().get(key)?.value().cloned()
    }

    /// Error of a key as currently stored in the graph, if it failed.
    pub fn get_existing_error(&self, key: &Key) -> Option<ErrorInfo> {
        self.graph().get(key)?.error().cloned()
    }

    /// Replace the graph with the result of `transform`.
    pub fn inject_graph_transformer_for_testing(
        &self,
        transform: impl FnOnce(Arc<InMemoryGraph>) -> Arc<InMemoryGraph>,
    ) {
        let mut graph = self.graph.write();
        let current = graph.clone();
        *graph = transform(current);
    }

    /// The registered functions.
    pub fn functions_for_testing(&self) -> &FunctionRegistry {
        &self.functions
    }

    fn next_version(&self) -> (Version, Version) {
        let mut versions = self.versions.lock();
        if !self.keep_edges {
            return (Version::constant(), versions.last_committed);
        }
        versions.last_issued = versions.last_issued.next();
        (versions.last_issued, versions.last_committed)
    }

    fn finish_round(&self, ctx: &EvaluationContext, version: Version, committed: bool) {
        debug!(%version, committed, "round finished");
        ctx.event_sink
            .emit(EvalEvent::RoundFinished { version, committed });
        ctx.event_sink.flush();
    }

    fn thread_pool(&self, ctx: &EvaluationContext) -> Result<Arc<rayon::ThreadPool>, EvaluateError> {
        if let Some(pool) = &ctx.executor {
            return Ok(pool.clone());
        }
        let mut cached = self.pool.lock();
        if let Some((threads, pool)) = &*cached {
            if *threads == ctx.parallelism {
                return Ok(pool.clone());
            }
        }
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(ctx.parallelism)
                .thread_name(|i| format!("memo-flow-worker-{i}"))
                .build()?,
        );
        *cached = Some((ctx.parallelism, pool.clone()));
        Ok(pool)
    }
}

/// Builder for [`MemoizingEvaluator`].
pub struct MemoizingEvaluatorBuilder {
    functions: FunctionRegistry,
    differencer: Option<Arc<dyn Differencer>>,
    progress_receiver: Option<Arc<dyn ProgressReceiver>>,
    keep_edges: bool,
}

impl Default for MemoizingEvaluatorBuilder {
    fn default() -> Self {
        Self {
            functions: FunctionRegistry::new(),
            differencer: None,
            progress_receiver: None,
            keep_edges: true,
        }
    }
}

impl MemoizingEvaluatorBuilder {
    /// Register a function.
    pub fn function(mut self, name: FunctionName, function: impl Function) -> Self {
        self.functions.register(name, function);
        self
    }

    /// Register a closure as a function.
    pub fn register_fn<F>(mut self, name: FunctionName, function: F) -> Self
    where
        F: Fn(&Key, &mut Environment<'_>) -> Result<ValueRef, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.register_fn(name, function);
        self
    }

    /// Use a prepared registry, replacing functions registered so far.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Source of external changes. Defaults to a differencer reporting none.
    pub fn differencer(mut self, differencer: Arc<dyn Differencer>) -> Self {
        self.differencer = Some(differencer);
        self
    }

    /// Receiver of per-key progress notifications.
    pub fn progress_receiver(mut self, receiver: Arc<dyn ProgressReceiver>) -> Self {
        self.progress_receiver = Some(receiver);
        self
    }

    /// Track dependency edges. Defaults to true.
    ///
    /// Without edges every round uses [`Version::constant`] and nothing is committed. A round
    /// carrying any change drops every computed node, so only injected values outlive it.
    pub fn keep_edges(mut self, keep_edges: bool) -> Self {
        self.keep_edges = keep_edges;
        self
    }

    /// Build the evaluator.
    pub fn build(self) -> MemoizingEvaluator {
        let graph = if self.keep_edges {
            InMemoryGraph::new()
        } else {
            InMemoryGraph::edgeless()
        };
        let receiver = self
            .progress_receiver
            .unwrap_or_else(|| Arc::new(NoopProgressReceiver));
        MemoizingEvaluator {
            graph: RwLock::new(Arc::new(graph)),
            functions: self.functions,
            differencer: self
                .differencer
                .unwrap_or_else(|| Arc::new(EmptyDifferencer)),
            tracker: InflightTracker::new(receiver),
            keep_edges: self.keep_edges,
            versions: Mutex::new(Versions::default()),
            pending: Mutex::new(PendingChanges::default()),
            evaluating: AtomicBool::new(false),
            pool: Mutex::new(None),
        }
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<MemoizingEvaluator>();
    assert_sync::<MemoizingEvaluator>();
}
