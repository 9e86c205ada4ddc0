//! Per-call evaluation settings.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Interrupted;
use crate::events::{EventSink, NullSink};

/// Shared flag used to interrupt a running evaluation.
///
/// Clones share the same flag. Triggering it makes the running round stop launching work,
/// drain what is in flight, and return [`EvaluateError::Interrupted`](crate::EvaluateError).
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Create an untriggered interrupt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear a previous request, so the handle can be reused for another round.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Returns true if interruption was requested.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns `Err(Interrupted)` if interruption was requested.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_triggered() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Settings for one [`evaluate`](crate::MemoizingEvaluator::evaluate) call.
#[derive(Clone)]
pub struct EvaluationContext {
    pub(crate) keep_going: bool,
    pub(crate) parallelism: usize,
    pub(crate) executor: Option<Arc<rayon::ThreadPool>>,
    pub(crate) event_sink: Arc<dyn EventSink>,
    pub(crate) interrupt: Interrupt,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("keep_going", &self.keep_going)
            .field("parallelism", &self.parallelism)
            .field("executor", &self.executor.is_some())
            .field("interrupt", &self.interrupt)
            .finish_non_exhaustive()
    }
}

impl EvaluationContext {
    /// Start building a context.
    pub fn builder() -> EvaluationContextBuilder {
        EvaluationContextBuilder::default()
    }

    /// Whether independent subgraphs keep evaluating after an error.
    pub fn keep_going(&self) -> bool {
        self.keep_going
    }

    /// Maximum number of concurrently running computations.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// The interrupt handle observed by the round.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// The event sink.
    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }
}

/// Builder for [`EvaluationContext`].
#[derive(Default)]
pub struct EvaluationContextBuilder {
    keep_going: bool,
    parallelism: Option<usize>,
    executor: Option<Arc<rayon::ThreadPool>>,
    event_sink: Option<Arc<dyn EventSink>>,
    interrupt: Option<Interrupt>,
}

impl EvaluationContextBuilder {
    /// Keep evaluating independent subgraphs after an error. Defaults to fail-fast.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Cap the number of concurrently running computations. Zero is treated as one.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism.max(1));
        self
    }

    /// Run computations on a caller-owned pool instead of the evaluator's own.
    pub fn executor(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.executor = Some(pool);
        self
    }

    /// Send round events to `sink`.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Observe `interrupt` during the round.
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Build the context.
    pub fn build(self) -> EvaluationContext {
        EvaluationContext {
            keep_going: self.keep_going,
            parallelism: self.parallelism.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            }),
            executor: self.executor,
            event_sink: self.event_sink.unwrap_or_else(|| Arc::new(NullSink)),
            interrupt: self.interrupt.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ctx = EvaluationContext::default();
        assert!(!ctx.keep_going());
        assert!(ctx.parallelism() >= 1);
        assert!(!ctx.interrupt().is_triggered());
    }

    #[test]
    fn test_interrupt_is_shared() {
        let interrupt = Interrupt::new();
        let ctx = EvaluationContext::builder()
            .interrupt(interrupt.clone())
            .parallelism(0)
            .build();
        assert_eq!(ctx.parallelism(), 1);
        assert!(ctx.interrupt().check().is_ok());
        interrupt.trigger();
        assert_eq!(ctx.interrupt().check(), Err(Interrupted));
    }
}
