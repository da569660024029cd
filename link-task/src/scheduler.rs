//! The [`Scheduler`] contract the run loop is built on, and the
//! frame-counted trampoline ([`step`]) that keeps synchronous combinator
//! chains stack-safe without paying a thread-hop tax on every hop.

use std::sync::Arc;
use std::time::Duration;

use crate::cancelable::{CancelToken, MultiAssignmentCancelable};
use crate::error::{TaskError, UncaughtExceptionReporter};

/// A unit of work submitted to a [`Scheduler`].
pub type BoxRunnable = Box<dyn FnOnce() + Send>;

/// The external scheduling primitive the run loop is built against.
///
/// Production code reaches for [`ThreadPoolScheduler`]; tests reach for
/// [`crate::testing::VirtualScheduler`]. Neither is part of the core
/// contract -- only this trait is.
pub trait Scheduler: Send + Sync {
    /// Submit `runnable` according to the scheduler's default policy.
    fn execute(&self, runnable: BoxRunnable);

    /// Submit `runnable` to run after `delay` has elapsed. The returned
    /// handle cancels the pending runnable if it has not fired yet.
    fn schedule_once(&self, delay: Duration, runnable: BoxRunnable) -> Arc<dyn CancelToken>;

    /// Report a failure that has nowhere left to go.
    fn report_failure(&self, error: TaskError);

    /// When true, [`Scheduler::execute`] never runs its argument on the
    /// caller's thread -- `Task::fork` can skip forcing a boundary of its
    /// own in that case.
    fn is_always_async(&self) -> bool;
}

/// Everything a [`crate::Task`] needs to run a single step: the scheduler,
/// the cancel handle this run is bound to, the trampoline's batch threshold,
/// and the reporter for failures with no surviving listener.
#[derive(Clone)]
pub struct RunCtx {
    pub scheduler: Arc<dyn Scheduler>,
    pub reporter: Arc<dyn UncaughtExceptionReporter>,
    pub active: Arc<MultiAssignmentCancelable>,
    pub batch_threshold: u32,
}

impl RunCtx {
    pub fn is_canceled(&self) -> bool {
        self.active.is_canceled()
    }
}

/// One synchronous continuation hop; frames are counted so [`step`] knows
/// when to hand control back to the scheduler instead of recursing further
/// on the current thread.
pub type FrameId = u32;

/// The default batch threshold: the number of synchronous hops a chain may
/// take before `step` forces a fresh scheduler runnable.
pub const DEFAULT_BATCH_THRESHOLD: u32 = 128;

/// Advance the trampoline by one logical step.
///
/// If `ctx`'s cancel handle has already fired, `k` is dropped unexecuted.
/// Otherwise, if `frame` is still under the batch threshold, `k` runs
/// immediately on the current thread with the frame counter incremented; at
/// the threshold, `k` is resubmitted to the scheduler as a fresh runnable
/// with the counter reset to zero.
///
/// This is the single place cancelation is checked on every cross-combinator
/// hop, and the single place stack depth is bounded.
pub fn step<F>(ctx: RunCtx, frame: FrameId, k: F)
where
    F: FnOnce(RunCtx, FrameId) + Send + 'static,
{
    if ctx.is_canceled() {
        return;
    }
    if frame < ctx.batch_threshold {
        k(ctx, frame + 1)
    } else {
        let scheduler = ctx.scheduler.clone();
        scheduler.execute(Box::new(move || k(ctx, 0)));
    }
}

/// A production [`Scheduler`] backed by a [`tokio::runtime::Handle`].
///
/// `execute` and `schedule_once` both hop onto the tokio runtime -- this
/// scheduler is always-async, matching how a multi-threaded work-stealing
/// pool cannot guarantee current-thread execution.
pub struct ThreadPoolScheduler {
    handle: tokio::runtime::Handle,
    reporter: Arc<dyn UncaughtExceptionReporter>,
}

impl ThreadPoolScheduler {
    pub fn new(handle: tokio::runtime::Handle, reporter: Arc<dyn UncaughtExceptionReporter>) -> Self {
        Self { handle, reporter }
    }

    /// Build a scheduler from the ambient tokio context, reporting uncaught
    /// failures via `tracing::error!`.
    pub fn from_current() -> Option<Self> {
        tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| Self::new(handle, Arc::new(crate::error::TracingReporter)))
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn execute(&self, runnable: BoxRunnable) {
        self.handle.spawn(async move { runnable() });
    }

    fn schedule_once(&self, delay: Duration, runnable: BoxRunnable) -> Arc<dyn CancelToken> {
        let handle = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            runnable();
        });
        Arc::new(crate::cancelable::Cancelable::from_fn(move || {
            handle.abort();
        }))
    }

    fn report_failure(&self, error: TaskError) {
        self.reporter.report_failure(error);
    }

    fn is_always_async(&self) -> bool {
        true
    }
}
