//! The parallel fixpoint evaluator.
//!
//! A single coordinator owns every task and every graph write of a round. Computations run
//! on a rayon pool and report back over a channel; a computation that needs a missing
//! dependency returns, and is re-run from the start once the dependency is terminal. No
//! worker ever blocks waiting for another key.
//!
//! Per task, the coordinator walks this state machine:
//!
//! ```text
//! requested --(clean in graph)--------------------------------> Done | Failed
//! requested --(dirty)--> Checking --(deps unchanged)----------> Done | Failed
//!                           |
//!                           +--(a dep changed)--> Computing --> Done | Failed
//! requested --(otherwise)--------------------> Computing <--+
//!                                                 |          |
//!                                                 +--(missing deps, rewind)
//! ```
//!
//! A rewind also sends finished tasks built on the rewound key back to Computing.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use tracing::{debug, debug_span, trace, warn};

use crate::context::EvaluationContext;
use crate::cycle;
use crate::error::{CycleInfo, ErrorInfo, ErrorKind, FunctionError, Interrupted};
use crate::events::EvalEvent;
use crate::function::{Environment, Function, FunctionRegistry};
use crate::graph::InMemoryGraph;
use crate::invalidation::InvalidationState;
use crate::node::NodeState;
use crate::progress::{EvaluationState, InflightTracker, ProgressReceiver};
use crate::{Key, ValueRef, Version};

/// Maximum number of rewinds a single key may request within one round.
pub const MAX_REWINDS: u32 = 5;

type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// Re-verifying a dirty node, starting at dependency group `group`.
    Checking { group: usize },
    Computing,
    Done,
    Failed,
}

impl TaskState {
    fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

struct Task {
    key: Key,
    state: TaskState,
    waiting_on: AHashSet<TaskId>,
    waiters: Vec<TaskId>,
    error: Option<ErrorInfo>,
    rewinds: u32,
    /// Dependencies requested by the most recent run of the function.
    last_deps: Option<Vec<Vec<Key>>>,
    /// Rewind epoch at the most recent dispatch.
    dispatched_at: u64,
    /// Rewind epoch at which the task was last reset, or zero.
    rewound_at: u64,
}

impl Task {
    fn new(key: Key, state: TaskState) -> Self {
        Self {
            key,
            state,
            waiting_on: AHashSet::default(),
            waiters: Vec::new(),
            error: None,
            rewinds: 0,
            last_deps: None,
            dispatched_at: 0,
            rewound_at: 0,
        }
    }
}

enum GroupStatus {
    Unchanged,
    Changed,
    Pending(Vec<Key>),
}

enum Outcome {
    Computed {
        result: Result<ValueRef, FunctionError>,
        deps: Vec<Vec<Key>>,
        missing: Vec<Key>,
    },
    Panicked(Box<dyn Any + Send>),
}

struct Completion {
    task: TaskId,
    outcome: Outcome,
}

/// Per-root outcome of a round that was not interrupted.
pub(crate) type RootResults = AHashMap<Key, Result<ValueRef, ErrorInfo>>;

/// ParallelEvaluator runs one round of evaluation over a graph.
pub(crate) struct ParallelEvaluator<'a> {
    graph: &'a InMemoryGraph,
    functions: &'a FunctionRegistry,
    tracker: &'a InflightTracker,
    ctx: &'a EvaluationContext,
    version: Version,

    tasks: Vec<Task>,
    ids: AHashMap<Key, TaskId>,
    roots: Vec<TaskId>,
    ready: VecDeque<TaskId>,
    to_check: VecDeque<TaskId>,
    finished: VecDeque<TaskId>,
    in_flight: usize,
    rewind_epoch: u64,

    /// First error observed in fail-fast mode.
    halted_on: Option<TaskId>,
    interrupted: bool,
    panic: Option<Box<dyn Any + Send>>,
}

impl<'a> ParallelEvaluator<'a> {
    pub fn new(
        graph: &'a InMemoryGraph,
        functions: &'a FunctionRegistry,
        tracker: &'a InflightTracker,
        ctx: &'a EvaluationContext,
        version: Version,
    ) -> Self {
        Self {
            graph,
            functions,
            tracker,
            ctx,
            version,
            tasks: Vec::new(),
            ids: AHashMap::default(),
            roots: Vec::new(),
            ready: VecDeque::new(),
            to_check: VecDeque::new(),
            finished: VecDeque::new(),
            in_flight: 0,
            rewind_epoch: 0,
            halted_on: None,
            interrupted: false,
            panic: None,
        }
    }

    /// Evaluate `roots`, running computations on `pool`.
    ///
    /// Panics raised by functions are re-raised here after all in-flight work drained.
    pub fn eval(mut self, pool: &rayon::ThreadPool, roots: &[Key]) -> Result<RootResults, Interrupted> {
        let span = debug_span!("parallel_eval", version = %self.version, roots = roots.len());
        let _enter = span.enter();

        pool.in_place_scope(|scope| self.run(scope, roots));

        if let Some(payload) = self.panic.take() {
            panic::resume_unwind(payload);
        }
        if self.interrupted {
            debug!(inflight = self.tracker.inflight_len(), "evaluation interrupted");
            return Err(Interrupted);
        }
        Ok(self.root_results(roots))
    }

    fn run<'s>(&mut self, scope: &rayon::Scope<'s>, roots: &[Key])
    where
        'a: 's,
    {
        let (sender, receiver): (Sender<Completion>, Receiver<Completion>) = mpsc::channel();

        for root in roots {
            let id = self.request(root, None);
            if !self.roots.contains(&id) {
                self.roots.push(id);
            }
        }

        loop {
            if self.ctx.interrupt.is_triggered() {
                self.interrupted = true;
            }
            if !self.halted() {
                self.run_local();
                if !self.halted() {
                    self.dispatch(scope, &sender);
                }
            }
            if self.in_flight > 0 {
                match receiver.recv() {
                    Ok(completion) => self.handle_completion(completion),
                    Err(_) => break,
                }
                continue;
            }
            if self.halted() {
                break;
            }
            if !self.ready.is_empty() || !self.to_check.is_empty() || !self.finished.is_empty() {
                continue;
            }
            if !self.has_unfinished() || !self.break_cycles() {
                break;
            }
        }
    }

    fn halted(&self) -> bool {
        self.interrupted || self.halted_on.is_some() || self.panic.is_some()
    }

    fn has_unfinished(&self) -> bool {
        self.tasks.iter().any(|task| !task.state.is_terminal())
    }

    /// Request `key`, creating its task if needed, and make `parent` wait for it unless it
    /// is already terminal.
    fn request(&mut self, key: &Key, parent: Option<TaskId>) -> TaskId {
        let id = match self.ids.get(key) {
            Some(id) => *id,
            None => self.create_task(key),
        };
        if let Some(parent) = parent {
            self.link(parent, id);
        }
        id
    }

    fn link(&mut self, parent: TaskId, child: TaskId) {
        if self.tasks[child].state.is_terminal() {
            return;
        }
        if self.tasks[parent].waiting_on.insert(child) && !self.tasks[child].waiters.contains(&parent)
        {
            self.tasks[child].waiters.push(parent);
        }
    }

    fn create_task(&mut self, key: &Key) -> TaskId {
        let id = self.tasks.len();
        self.ids.insert(key.clone(), id);

        let mut inner = self.graph.write();
        let existing = inner
            .get(key)
            .map(|node| (node.state, node.error.clone()));
        let task = match existing {
            Some((NodeState::Done, _)) => Task::new(key.clone(), TaskState::Done),
            Some((NodeState::Error, error)) => {
                let mut task = Task::new(key.clone(), TaskState::Failed);
                task.error = error;
                if !self.ctx.keep_going && self.halted_on.is_none() {
                    debug!(key = ?key, "cached error halts evaluation");
                    self.halted_on = Some(id);
                }
                task
            }
            Some((NodeState::Dirty, _)) => {
                self.tracker.enqueueing(key);
                self.to_check.push_back(id);
                Task::new(key.clone(), TaskState::Checking { group: 0 })
            }
            _ => {
                let index = inner.get_or_create(key);
                inner.set_state(index, NodeState::Building);
                self.tracker.enqueueing(key);
                self.ready.push_back(id);
                Task::new(key.clone(), TaskState::Computing)
            }
        };
        drop(inner);
        trace!(key = ?key, state = ?task.state, "requested");
        self.tasks.push(task);
        id
    }

    /// Process local work until there is nothing left that does not need a worker.
    fn run_local(&mut self) {
        loop {
            if self.halted() {
                return;
            }
            if let Some(id) = self.finished.pop_front() {
                self.notify_waiters(id);
            } else if let Some(id) = self.to_check.pop_front() {
                self.check(id);
            } else {
                return;
            }
        }
    }

    fn dispatch<'s>(&mut self, scope: &rayon::Scope<'s>, sender: &Sender<Completion>)
    where
        'a: 's,
    {
        while self.in_flight < self.ctx.parallelism && !self.halted() {
            let Some(id) = self.ready.pop_front() else {
                return;
            };
            if self.tasks[id].state != TaskState::Computing || !self.tasks[id].waiting_on.is_empty() {
                continue;
            }
            let key = self.tasks[id].key.clone();
            let Some(function) = self.functions.get(key.function()).cloned() else {
                let error = ErrorInfo::new(key.clone(), ErrorKind::MissingFunction(key.function()));
                self.fail(id, error);
                continue;
            };

            let graph = self.graph;
            let ctx = self.ctx;
            let interrupt = &ctx.interrupt;
            let version = self.version;
            let sender = sender.clone();
            self.tasks[id].dispatched_at = self.rewind_epoch;
            self.in_flight += 1;
            trace!(key = ?key, "dispatching");
            scope.spawn(move |_| {
                let outcome = compute(&*function, &key, version, graph, interrupt);
                // The receiver outlives every spawned job.
                let _ = sender.send(Completion { task: id, outcome });
            });
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        self.in_flight -= 1;
        let id = completion.task;
        let (result, deps, missing) = match completion.outcome {
            Outcome::Panicked(payload) => {
                warn!(key = ?self.tasks[id].key, "function panicked");
                self.panic.get_or_insert(payload);
                return;
            }
            Outcome::Computed {
                result,
                deps,
                missing,
            } => (result, deps, missing),
        };
        if self.halted() {
            // Left inflight. The next round deletes it.
            return;
        }

        let key = self.tasks[id].key.clone();
        if !matches!(result, Err(FunctionError::Interrupted)) && self.read_rewound_key(id, &deps) {
            trace!(key = ?key, "ran against a rewound dependency");
            self.ready.push_back(id);
            return;
        }
        self.tasks[id].last_deps = Some(deps);
        match result {
            Err(FunctionError::Interrupted) => {
                debug!(key = ?key, "function observed interruption");
                self.interrupted = true;
            }
            Err(FunctionError::Failed(error)) => {
                self.fail(id, ErrorInfo::new(key, ErrorKind::Function(error)));
            }
            Err(FunctionError::Rewind(keys)) => self.rewind(id, keys),
            _ if !missing.is_empty() => self.suspend(id, &missing),
            Ok(value) => self.finish(id, value),
            Err(FunctionError::Dependency(child)) => {
                let error = ErrorInfo::from_child(&key, &child);
                self.fail(id, error);
            }
            Err(FunctionError::Suspend) => {
                let error = anyhow::anyhow!("function suspended without requesting a missing dependency");
                self.fail(id, ErrorInfo::new(key, ErrorKind::Function(Arc::new(error))));
            }
        }
    }

    /// Returns true if a dependency in `deps` was reset after the task was dispatched.
    fn read_rewound_key(&self, id: TaskId, deps: &[Vec<Key>]) -> bool {
        let dispatched_at = self.tasks[id].dispatched_at;
        deps.iter().flatten().any(|dep| {
            self.ids
                .get(dep)
                .is_some_and(|dep_id| self.tasks[*dep_id].rewound_at > dispatched_at)
        })
    }

    fn suspend(&mut self, id: TaskId, missing: &[Key]) {
        trace!(key = ?self.tasks[id].key, missing = missing.len(), "waiting for dependencies");
        for dep in missing {
            self.request(dep, Some(id));
        }
        if self.tasks[id].waiting_on.is_empty() {
            self.ready.push_back(id);
        }
    }

    fn finish(&mut self, id: TaskId, value: ValueRef) {
        let key = self.tasks[id].key.clone();
        let deps = self.tasks[id].last_deps.take().unwrap_or_default();
        let changed = {
            let mut inner = self.graph.write();
            let index = inner.get_or_create(&key);
            inner.set_direct_deps(index, &deps);
            inner.set_value(index, value, self.version)
        };
        let state = if changed {
            EvaluationState::Changed
        } else {
            EvaluationState::Unchanged
        };
        trace!(key = ?key, ?state, "evaluated");
        self.tracker.evaluated(&key, state);
        self.complete(id, TaskState::Done);
    }

    fn fail(&mut self, id: TaskId, error: ErrorInfo) {
        let key = self.tasks[id].key.clone();
        let deps = self.tasks[id].last_deps.take();
        {
            let mut inner = self.graph.write();
            let index = inner.get_or_create(&key);
            if let Some(deps) = &deps {
                inner.set_direct_deps(index, deps);
            }
            inner.set_error(index, error.clone(), self.version);
        }
        debug!(key = ?key, %error, "evaluation failed");
        self.tracker.evaluated(&key, EvaluationState::Error);
        self.tasks[id].error = Some(error);
        if !self.ctx.keep_going && self.halted_on.is_none() {
            self.halted_on = Some(id);
        }
        self.complete(id, TaskState::Failed);
    }

    fn complete(&mut self, id: TaskId, state: TaskState) {
        let task = &mut self.tasks[id];
        task.state = state;
        task.waiting_on.clear();
        self.finished.push_back(id);
    }

    fn notify_waiters(&mut self, id: TaskId) {
        if !self.tasks[id].state.is_terminal() {
            // Reset by a rewind before its waiters were told.
            return;
        }
        let cycle_error = self.tasks[id].error.clone().filter(ErrorInfo::is_cycle);
        let waiters = self.tasks[id].waiters.clone();
        for waiter in waiters {
            let task = &mut self.tasks[waiter];
            if task.state.is_terminal() || !task.waiting_on.remove(&id) {
                continue;
            }
            if let Some(child) = &cycle_error {
                let error = ErrorInfo::from_child(&task.key, child);
                self.fail(waiter, error);
                continue;
            }
            if task.waiting_on.is_empty() {
                match task.state {
                    TaskState::Checking { .. } => self.to_check.push_back(waiter),
                    TaskState::Computing => self.ready.push_back(waiter),
                    TaskState::Done | TaskState::Failed => {}
                }
            }
        }
    }

    /// Re-verify a dirty node against its previous dependencies, group by group.
    fn check(&mut self, id: TaskId) {
        let TaskState::Checking { group: start } = self.tasks[id].state else {
            return;
        };
        let key = self.tasks[id].key.clone();
        let previous = {
            let inner = self.graph.read();
            inner.index_of(&key).and_then(|index| {
                let node = inner.node(index)?;
                Some((inner.dependency_keys(index), node.last_evaluated))
            })
        };
        let Some((groups, last_evaluated)) = previous else {
            return self.rebuild(id);
        };

        for (group_index, group) in groups.iter().enumerate().skip(start) {
            match self.group_status(group, last_evaluated) {
                GroupStatus::Unchanged => continue,
                GroupStatus::Changed => {
                    trace!(key = ?key, group = group_index, "dependency changed");
                    return self.rebuild(id);
                }
                GroupStatus::Pending(pending) => {
                    for dep in &pending {
                        self.request(dep, Some(id));
                    }
                    if self.tasks[id].waiting_on.is_empty() {
                        // Requested dependencies finished without reaching a clean state.
                        return self.rebuild(id);
                    }
                    self.tasks[id].state = TaskState::Checking { group: group_index };
                    return;
                }
            }
        }

        self.mark_clean(id);
    }

    fn group_status(&self, group: &[Key], last_evaluated: Version) -> GroupStatus {
        let inner = self.graph.read();
        let mut pending = Vec::new();
        for dep in group {
            match inner.get(dep) {
                Some(node) if node.state.is_clean() => {
                    if node.state == NodeState::Error || node.changed_after(last_evaluated) {
                        return GroupStatus::Changed;
                    }
                }
                Some(_) => pending.push(dep.clone()),
                None => return GroupStatus::Changed,
            }
        }
        if pending.is_empty() {
            GroupStatus::Unchanged
        } else {
            GroupStatus::Pending(pending)
        }
    }

    fn rebuild(&mut self, id: TaskId) {
        let key = self.tasks[id].key.clone();
        {
            let mut inner = self.graph.write();
            let index = inner.get_or_create(&key);
            inner.set_state(index, NodeState::Building);
        }
        self.tasks[id].state = TaskState::Computing;
        self.ready.push_back(id);
    }

    fn mark_clean(&mut self, id: TaskId) {
        let key = self.tasks[id].key.clone();
        let version = self.version;
        let restored = self.graph.write().get_mut(&key).and_then(|node| {
            if node.value.is_none() && node.error.is_none() {
                return None;
            }
            node.state = if node.error.is_some() {
                NodeState::Error
            } else {
                NodeState::Done
            };
            node.last_evaluated = version;
            Some(node.error.clone())
        });
        let Some(error) = restored else {
            return self.rebuild(id);
        };
        trace!(key = ?key, "verified clean");
        self.tracker.evaluated(&key, EvaluationState::Clean);
        match error {
            Some(error) => {
                self.tasks[id].error = Some(error);
                if !self.ctx.keep_going && self.halted_on.is_none() {
                    self.halted_on = Some(id);
                }
                self.complete(id, TaskState::Failed);
            }
            None => self.complete(id, TaskState::Done),
        }
    }

    /// Re-execute `keys` within this round, then re-run the requester.
    ///
    /// Whatever was already built on top of a rewound key is discarded as well: tasks that
    /// finished this round are reset, and nodes from earlier rounds are dirtied.
    fn rewind(&mut self, id: TaskId, keys: Vec<Key>) {
        let key = self.tasks[id].key.clone();
        self.tasks[id].rewinds += 1;
        if self.tasks[id].rewinds > MAX_REWINDS {
            warn!(key = ?key, "rewind limit exceeded");
            return self.fail(id, ErrorInfo::new(key, ErrorKind::RewindLimitExceeded));
        }
        debug!(key = ?key, rewound = keys.len(), "rewinding dependencies");
        self.rewind_epoch += 1;

        for dep in &keys {
            match self.ids.get(dep).copied() {
                Some(dep_id) if self.tasks[dep_id].state.is_terminal() => {
                    self.reset_task(dep_id);
                    self.discard_dependents(dep);
                }
                Some(_) => {}
                None => {
                    self.tracker.rewinding(dep);
                    {
                        let mut inner = self.graph.write();
                        if let Some(index) = inner.index_of(dep) {
                            inner.set_state(index, NodeState::NeedsRebuild);
                        }
                    }
                    self.discard_dependents(dep);
                }
            }
            self.request(dep, Some(id));
        }
        if self.tasks[id].waiting_on.is_empty() {
            self.ready.push_back(id);
        }
    }

    /// Put a task back to computing as if it had not run this round.
    fn reset_task(&mut self, id: TaskId) {
        let key = self.tasks[id].key.clone();
        self.tracker.rewinding(&key);
        let task = &mut self.tasks[id];
        task.state = TaskState::Computing;
        task.error = None;
        task.last_deps = None;
        task.rewound_at = self.rewind_epoch;
        let runnable = task.waiting_on.is_empty();
        {
            let mut inner = self.graph.write();
            let index = inner.get_or_create(&key);
            inner.set_state(index, NodeState::Building);
        }
        if runnable {
            self.ready.push_back(id);
        }
    }

    /// Walk everything built on top of `key`.
    ///
    /// Finished tasks are reset and their dependents walked in turn. Checking tasks are reset
    /// to recompute, since they may already have verified `key`. Computing tasks are left
    /// alone: a run that read a reset key is re-run when it completes. Nodes without a task
    /// are dirtied so a later round re-verifies them.
    fn discard_dependents(&mut self, key: &Key) {
        let mut seen: AHashSet<Key> = AHashSet::default();
        seen.insert(key.clone());
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents_of(&current) {
                if !seen.insert(dependent.clone()) {
                    continue;
                }
                match self.ids.get(&dependent).copied() {
                    Some(id) => match self.tasks[id].state {
                        TaskState::Done | TaskState::Failed => {
                            trace!(key = ?dependent, "discarded by rewind");
                            self.reset_task(id);
                            stack.push(dependent);
                        }
                        TaskState::Checking { .. } => self.reset_task(id),
                        TaskState::Computing => {}
                    },
                    None => {
                        let dirtied = match self.graph.write().get_mut(&dependent) {
                            Some(node) if node.state.is_clean() => {
                                node.state = NodeState::Dirty;
                                true
                            }
                            _ => false,
                        };
                        if dirtied {
                            trace!(key = ?dependent, "dirtied by rewind");
                            self.tracker.invalidated(&dependent, InvalidationState::Dirty);
                            stack.push(dependent);
                        }
                    }
                }
            }
        }
    }

    fn dependents_of(&self, key: &Key) -> Vec<Key> {
        let mut dependents: Vec<Key> = match self.ids.get(key) {
            Some(id) => self.tasks[*id]
                .waiters
                .iter()
                .map(|waiter| self.tasks[*waiter].key.clone())
                .collect(),
            None => Vec::new(),
        };
        let inner = self.graph.read();
        if let Some(index) = inner.index_of(key) {
            dependents.extend(inner.dependent_keys(index));
        }
        dependents
    }

    /// Fail every cycle among the stuck tasks. Returns false if none was found.
    fn break_cycles(&mut self) -> bool {
        let unfinished: Vec<TaskId> = (0..self.tasks.len())
            .filter(|id| !self.tasks[*id].state.is_terminal())
            .collect();
        let starts = self.roots.iter().copied().chain(unfinished.iter().copied());
        let tasks = &self.tasks;
        let cycles = cycle::find_cycles(starts, |id: TaskId| {
            tasks[id]
                .waiting_on
                .iter()
                .copied()
                .filter(|dep| !tasks[*dep].state.is_terminal())
                .collect::<Vec<_>>()
        });
        if cycles.is_empty() {
            warn!(stuck = unfinished.len(), "no progress possible and no cycle found");
            return false;
        }

        for members in cycles {
            if members.iter().any(|id| self.tasks[*id].state.is_terminal()) {
                continue;
            }
            let keys: Vec<Key> = members.iter().map(|id| self.tasks[*id].key.clone()).collect();
            debug!(cycle = ?keys, "dependency cycle detected");
            self.ctx.event_sink.emit(EvalEvent::cycle_detected(&keys));
            for (position, member) in members.iter().enumerate() {
                let info = CycleInfo::new(cycle::rotated(&keys, position));
                self.fail(*member, ErrorInfo::cycle(info));
            }
        }
        true
    }

    fn root_results(&self, roots: &[Key]) -> RootResults {
        let propagated = self.propagate_halting_errors();
        let graph = self.graph.read();
        let mut results = RootResults::default();
        for root in roots {
            let Some(id) = self.ids.get(root).copied() else {
                continue;
            };
            let task = &self.tasks[id];
            let result = match task.state {
                TaskState::Done => match graph.get(root).and_then(|node| node.value()) {
                    Some(value) => Ok(value.clone()),
                    None => continue,
                },
                TaskState::Failed => match &task.error {
                    Some(error) => Err(error.clone()),
                    None => continue,
                },
                _ => match propagated.get(&id) {
                    Some(error) => Err(error.clone()),
                    None => continue,
                },
            };
            results.insert(root.clone(), result);
        }
        results
    }

    /// In fail-fast mode, give every unfinished task that transitively waited on a failure
    /// the error it would have failed with.
    fn propagate_halting_errors(&self) -> AHashMap<TaskId, ErrorInfo> {
        let mut propagated = AHashMap::default();
        let Some(first) = self.halted_on else {
            return propagated;
        };
        let failed = (0..self.tasks.len()).filter(|id| *id != first && self.tasks[*id].state == TaskState::Failed);
        let mut queue: VecDeque<(TaskId, ErrorInfo)> = std::iter::once(first)
            .chain(failed)
            .filter_map(|id| Some((id, self.tasks[id].error.clone()?)))
            .collect();
        while let Some((id, error)) = queue.pop_front() {
            for waiter in &self.tasks[id].waiters {
                let task = &self.tasks[*waiter];
                if task.state.is_terminal() || propagated.contains_key(waiter) {
                    continue;
                }
                let error = ErrorInfo::from_child(&task.key, &error);
                propagated.insert(*waiter, error.clone());
                queue.push_back((*waiter, error));
            }
        }
        propagated
    }
}

fn compute(
    function: &dyn Function,
    key: &Key,
    version: Version,
    graph: &InMemoryGraph,
    interrupt: &crate::context::Interrupt,
) -> Outcome {
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut env = Environment::new(key, version, graph, interrupt);
        let result = function.compute(key, &mut env);
        let (deps, missing) = env.into_deps();
        (result, deps, missing)
    }));
    match run {
        Ok((result, deps, missing)) => Outcome::Computed {
            result,
            deps,
            missing,
        },
        Err(payload) => Outcome::Panicked(payload),
    }
}
