//! Tests for interruption, rewinding, reentrancy and panics.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use memo_flow::{
    value, Diff, Differencer, ErrorKind, EvaluateError, EvaluationContext, FunctionError,
    FunctionName, Interrupt, Interrupted, InvalidationState, Key, MemoizingEvaluator,
    ProgressReceiver, ValueRef, Version, WalkableGraph, MAX_REWINDS,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

const INPUT: FunctionName = FunctionName::new("input");
const LEAF: FunctionName = FunctionName::new("leaf");
const TOP: FunctionName = FunctionName::new("top");
const NESTED: FunctionName = FunctionName::new("nested");
const MID: FunctionName = FunctionName::new("mid");
const REFRESH: FunctionName = FunctionName::new("refresh");

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct Recorder {
    deleted: Mutex<Vec<Key>>,
    rewound: Mutex<Vec<Key>>,
}

impl ProgressReceiver for Recorder {
    fn invalidated(&self, key: &Key, state: InvalidationState) {
        if state == InvalidationState::Deleted {
            self.deleted.lock().push(key.clone());
        }
    }

    fn rewinding(&self, key: &Key) {
        self.rewound.lock().push(key.clone());
    }
}

fn int(value: &ValueRef) -> i64 {
    value.downcast_ref::<i64>().copied().unwrap_or_default()
}

fn leaf() -> Key {
    Key::new(LEAF, ())
}

fn top() -> Key {
    Key::new(TOP, ())
}

fn mid() -> Key {
    Key::new(MID, ())
}

fn ctx_with(interrupt: &Interrupt) -> EvaluationContext {
    EvaluationContext::builder()
        .interrupt(interrupt.clone())
        .parallelism(2)
        .build()
}

// ============================================================================
// Interruption
// ============================================================================

#[test]
fn test_interrupted_round_is_not_committed() {
    let interrupt = Interrupt::new();
    let should_interrupt = Arc::new(AtomicBool::new(true));
    let recorder = Arc::new(Recorder::default());

    let evaluator = {
        let interrupt = interrupt.clone();
        let should_interrupt = should_interrupt.clone();
        MemoizingEvaluator::builder()
            .progress_receiver(recorder.clone())
            .register_fn(LEAF, move |_, _| {
                if should_interrupt.load(Ordering::SeqCst) {
                    interrupt.trigger();
                    return Err(FunctionError::Interrupted);
                }
                Ok(value(1i64))
            })
            .build()
    };
    let ctx = ctx_with(&interrupt);

    let err = evaluator.evaluate([leaf()], &ctx).unwrap_err();
    assert!(matches!(err, EvaluateError::Interrupted(Interrupted)));
    assert_eq!(evaluator.last_committed_version(), Version::MINIMAL);
    assert!(evaluator.get_existing_value(&leaf()).is_none());

    interrupt.reset();
    should_interrupt.store(false, Ordering::SeqCst);
    let result = evaluator.evaluate([leaf()], &ctx).unwrap();

    assert!(recorder.deleted.lock().contains(&leaf()));
    assert_eq!(result.get_as::<i64>(&leaf()), Some(&1));
    assert_eq!(result.version(), Version::MINIMAL.next().next());
    assert_eq!(evaluator.last_committed_version(), result.version());
}

#[test]
fn test_triggered_interrupt_stops_round_before_work() {
    let computations = Arc::new(AtomicUsize::new(0));
    let evaluator = {
        let computations = computations.clone();
        MemoizingEvaluator::builder()
            .register_fn(LEAF, move |_, _| {
                computations.fetch_add(1, Ordering::SeqCst);
                Ok(value(1i64))
            })
            .build()
    };
    let interrupt = Interrupt::new();
    interrupt.trigger();

    let err = evaluator.evaluate([leaf()], &ctx_with(&interrupt)).unwrap_err();
    assert!(matches!(err, EvaluateError::Interrupted(_)));
    assert_eq!(computations.load(Ordering::SeqCst), 0);
}

/// Differencer failing its first request.
#[derive(Default)]
struct FlakyDifferencer {
    calls: AtomicUsize,
}

impl Differencer for FlakyDifferencer {
    fn get_diff(&self, _: &dyn WalkableGraph, _: Version, _: Version) -> Result<Diff, Interrupted> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Interrupted);
        }
        Ok(Diff::default())
    }
}

#[test]
fn test_pending_changes_survive_interrupted_diff() {
    let evaluator = MemoizingEvaluator::builder()
        .differencer(Arc::new(FlakyDifferencer::default()))
        .register_fn(TOP, |_, env| {
            let n = int(&env.get(&Key::new(INPUT, ()))?);
            Ok(value(n + 1))
        })
        .build();
    evaluator.inject(Key::new(INPUT, ()), value(41i64));

    let ctx = EvaluationContext::default();
    assert!(matches!(
        evaluator.evaluate([top()], &ctx),
        Err(EvaluateError::Interrupted(_))
    ));

    let result = evaluator.evaluate([top()], &ctx).unwrap();
    assert_eq!(result.get_as::<i64>(&top()), Some(&42));
}

// ============================================================================
// Rewinding
// ============================================================================

/// `top` reads `leaf`, then asks for it to be rewound while `rewinds_left` is positive.
fn rewinding_evaluator(
    leaf_runs: Arc<AtomicUsize>,
    rewinds_left: Arc<AtomicUsize>,
    interrupt_leaf_after: Option<usize>,
    recorder: Arc<Recorder>,
) -> MemoizingEvaluator {
    MemoizingEvaluator::builder()
        .progress_receiver(recorder)
        .register_fn(LEAF, move |_, _| {
            let run = leaf_runs.fetch_add(1, Ordering::SeqCst) + 1;
            if interrupt_leaf_after.is_some_and(|limit| run > limit) {
                return Err(FunctionError::Interrupted);
            }
            Ok(value(run as i64))
        })
        .register_fn(TOP, move |_, env| {
            let n = int(&env.get(&leaf())?);
            let remaining = rewinds_left.load(Ordering::SeqCst);
            if remaining > 0 {
                rewinds_left.store(remaining - 1, Ordering::SeqCst);
                return Err(FunctionError::Rewind(vec![leaf()]));
            }
            Ok(value(n * 10))
        })
        .build()
}

#[test]
fn test_rewind_recomputes_dependency() {
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let recorder = Arc::new(Recorder::default());
    let evaluator = rewinding_evaluator(
        leaf_runs.clone(),
        Arc::new(AtomicUsize::new(1)),
        None,
        recorder.clone(),
    );

    let result = evaluator.evaluate([top()], &EvaluationContext::default()).unwrap();
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
    assert_eq!(result.get_as::<i64>(&top()), Some(&20));
    assert_eq!(*recorder.rewound.lock(), vec![leaf()]);
}

#[test]
fn test_rewind_limit() {
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let evaluator = rewinding_evaluator(
        leaf_runs.clone(),
        Arc::new(AtomicUsize::new(usize::MAX)),
        None,
        Arc::default(),
    );

    let result = evaluator.evaluate([top()], &EvaluationContext::default()).unwrap();
    let error = result.error(&top()).unwrap();
    assert!(matches!(error.kind(), ErrorKind::RewindLimitExceeded));
    assert_eq!(leaf_runs.load(Ordering::SeqCst), MAX_REWINDS as usize + 1);
}

#[test]
fn test_unsuccessful_rewind_is_deleted_next_round() {
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let recorder = Arc::new(Recorder::default());
    let evaluator = rewinding_evaluator(
        leaf_runs.clone(),
        Arc::new(AtomicUsize::new(1)),
        Some(1),
        recorder.clone(),
    );

    let err = evaluator.evaluate([top()], &EvaluationContext::default()).unwrap_err();
    assert!(matches!(err, EvaluateError::Interrupted(_)));
    assert!(recorder.deleted.lock().is_empty());

    // Nothing to compute, but the round still starts by dropping what the last one left.
    evaluator
        .evaluate(Vec::<Key>::new(), &EvaluationContext::default())
        .unwrap();
    let deleted = recorder.deleted.lock().clone();
    assert!(deleted.contains(&leaf()));
    assert!(deleted.contains(&top()));
    assert!(evaluator.get_existing_value(&leaf()).is_none());
}

/// `leaf` counts its runs and `mid` copies `leaf`.
///
/// `top` reads `mid` and `leaf`, and rewinds `leaf` the first time it has both.
/// `refresh` rewinds `leaf` on its first run, before reading it.
fn shared_leaf_evaluator(leaf_runs: Arc<AtomicUsize>, recorder: Arc<Recorder>) -> MemoizingEvaluator {
    let top_rewound = AtomicBool::new(false);
    let refresh_rewound = AtomicBool::new(false);
    MemoizingEvaluator::builder()
        .progress_receiver(recorder)
        .register_fn(LEAF, move |_, _| {
            Ok(value(leaf_runs.fetch_add(1, Ordering::SeqCst) as i64 + 1))
        })
        .register_fn(MID, |_, env| Ok(value(int(&env.get(&leaf())?))))
        .register_fn(TOP, move |_, env| {
            let m = int(&env.get(&mid())?);
            let l = int(&env.get(&leaf())?);
            if !top_rewound.swap(true, Ordering::SeqCst) {
                return Err(FunctionError::Rewind(vec![leaf()]));
            }
            Ok(value(m * 10 + l))
        })
        .register_fn(REFRESH, move |_, env| {
            if !refresh_rewound.swap(true, Ordering::SeqCst) {
                return Err(FunctionError::Rewind(vec![leaf()]));
            }
            Ok(value(int(&env.get(&leaf())?) * 10))
        })
        .build()
}

#[test]
fn test_rewind_recomputes_finished_dependents() {
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let recorder = Arc::new(Recorder::default());
    let evaluator = shared_leaf_evaluator(leaf_runs.clone(), recorder.clone());
    let ctx = EvaluationContext::builder().parallelism(1).build();

    let result = evaluator.evaluate([mid(), top()], &ctx).unwrap();
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
    assert_eq!(result.get_as::<i64>(&mid()), Some(&2));
    assert_eq!(result.get_as::<i64>(&top()), Some(&22));
    assert!(recorder.rewound.lock().contains(&mid()));

    let result = evaluator.evaluate([mid(), top()], &ctx).unwrap();
    assert_eq!(result.get_as::<i64>(&mid()), Some(&2));
    assert_eq!(evaluator.get_existing_value(&mid()).map(|v| int(&v)), Some(2));
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_rewind_of_key_built_in_earlier_round() {
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let recorder = Arc::new(Recorder::default());
    let evaluator = shared_leaf_evaluator(leaf_runs.clone(), recorder.clone());
    let ctx = EvaluationContext::default();

    let result = evaluator.evaluate([mid()], &ctx).unwrap();
    assert_eq!(result.get_as::<i64>(&mid()), Some(&1));

    let refresh = Key::new(REFRESH, ());
    let result = evaluator.evaluate([refresh.clone()], &ctx).unwrap();
    assert_eq!(result.get_as::<i64>(&refresh), Some(&20));
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
    assert_eq!(*recorder.rewound.lock(), vec![leaf()]);

    let result = evaluator.evaluate([mid()], &ctx).unwrap();
    assert_eq!(result.get_as::<i64>(&mid()), Some(&2));
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Reentrancy and panics
// ============================================================================

#[test]
fn test_reentrant_evaluate_panics() {
    let slot: Arc<OnceLock<Weak<MemoizingEvaluator>>> = Arc::default();
    let evaluator = {
        let slot = slot.clone();
        Arc::new(
            MemoizingEvaluator::builder()
                .register_fn(LEAF, |_, _| Ok(value(1i64)))
                .register_fn(NESTED, move |_, _| {
                    let evaluator = slot
                        .get()
                        .and_then(Weak::upgrade)
                        .ok_or_else(|| anyhow::anyhow!("evaluator dropped"))?;
                    let nested = panic::catch_unwind(AssertUnwindSafe(|| {
                        evaluator.evaluate([leaf()], &EvaluationContext::default())
                    }));
                    Ok(value(nested.is_err()))
                })
                .build(),
        )
    };
    slot.set(Arc::downgrade(&evaluator)).unwrap();

    let root = Key::new(NESTED, ());
    let result = evaluator.evaluate([root.clone()], &EvaluationContext::default()).unwrap();
    assert_eq!(result.get_as::<bool>(&root), Some(&true));

    let result = evaluator.evaluate([leaf()], &EvaluationContext::default()).unwrap();
    assert_eq!(result.get_as::<i64>(&leaf()), Some(&1));
}

#[test]
fn test_function_panic_is_propagated() {
    let should_panic = Arc::new(AtomicBool::new(true));
    let evaluator = {
        let should_panic = should_panic.clone();
        MemoizingEvaluator::builder()
            .register_fn(LEAF, move |_, _| {
                if should_panic.load(Ordering::SeqCst) {
                    panic!("leaf exploded");
                }
                Ok(value(7i64))
            })
            .register_fn(TOP, |_, env| Ok(value(int(&env.get(&leaf())?) + 1)))
            .build()
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        evaluator.evaluate([top()], &EvaluationContext::default())
    }));
    let payload = outcome.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"leaf exploded"));

    should_panic.store(false, Ordering::SeqCst);
    let result = evaluator.evaluate([top()], &EvaluationContext::default()).unwrap();
    assert_eq!(result.get_as::<i64>(&top()), Some(&8));
}
