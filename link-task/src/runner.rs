//! [`Runner`]: the only place a [`Task`] actually touches a [`Scheduler`].
//!
//! Everything upstream of this module builds `Task<T>` descriptions without
//! touching a scheduler at all; `Runner::run_async`/`run_async_try`/`run`
//! are where a description is finally materialized into (a) a fresh
//! [`MultiAssignmentCancelable`] handed back to the caller, (b) a fresh
//! [`SafeCallback`], and (c) an initial, un-trampolined entry into the task
//! tree -- deferring to `step` inside the tree itself for all further
//! batching, per the design notes in `DESIGN.md` about not conflating
//! `start`/`start_now`/`start_async` at the entry point.

use std::sync::Arc;

use crate::callback::SafeCallback;
use crate::cancelable::MultiAssignmentCancelable;
use crate::error::{TaskError, UncaughtExceptionReporter};
use crate::future::CancelableFuture;
use crate::scheduler::{FrameId, RunCtx, Scheduler, DEFAULT_BATCH_THRESHOLD};
use crate::task::Task;

/// Runs [`Task`] values against a [`Scheduler`]. Stateless beyond its
/// configuration: every `run_async`/`run` call builds a fresh cancel handle
/// and [`RunCtx`] of its own, so one `Runner` can drive any number of
/// concurrent, independent runs.
#[derive(Clone)]
pub struct Runner {
    scheduler: Arc<dyn Scheduler>,
    reporter: Arc<dyn UncaughtExceptionReporter>,
    batch_threshold: FrameId,
}

impl Runner {
    /// A runner backed by `scheduler`, reporting failures with nowhere else
    /// to go via `reporter`, using the default batch threshold
    /// ([`DEFAULT_BATCH_THRESHOLD`]).
    pub fn new(scheduler: Arc<dyn Scheduler>, reporter: Arc<dyn UncaughtExceptionReporter>) -> Self {
        Self {
            scheduler,
            reporter,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
        }
    }

    /// Override the trampoline's batch threshold (see [`crate::scheduler::step`]).
    pub fn with_batch_threshold(mut self, batch_threshold: FrameId) -> Self {
        self.batch_threshold = batch_threshold;
        self
    }

    fn ctx(&self, active: Arc<MultiAssignmentCancelable>) -> RunCtx {
        RunCtx {
            scheduler: self.scheduler.clone(),
            reporter: self.reporter.clone(),
            active,
            batch_threshold: self.batch_threshold,
        }
    }

    /// Start `task`, delivering its outcome to the two-arm `on_success` /
    /// `on_error` sink -- at most one of the two is ever invoked, at most
    /// once. Returns a cancel handle for the run.
    pub fn run_async<T>(
        &self,
        task: Task<T>,
        on_success: impl FnOnce(T) + Send + 'static,
        on_error: impl FnOnce(TaskError) + Send + 'static,
    ) -> Arc<MultiAssignmentCancelable>
    where
        T: Send + 'static,
    {
        self.run_async_try(task, move |outcome| match outcome {
            Ok(value) => on_success(value),
            Err(err) => on_error(err),
        })
    }

    /// Start `task`, delivering its `Result<T, TaskError>` outcome to `f` in
    /// one call. Returns a cancel handle for the run.
    pub fn run_async_try<T>(
        &self,
        task: Task<T>,
        f: impl FnOnce(Result<T, TaskError>) + Send + 'static,
    ) -> Arc<MultiAssignmentCancelable>
    where
        T: Send + 'static,
    {
        let active = MultiAssignmentCancelable::new();
        let safe_cb = SafeCallback::new(Box::new(f), self.reporter.clone());
        let ctx = self.ctx(active.clone());
        task.unsafe_run(ctx, 0, safe_cb);
        active
    }

    /// Start `task`, returning a [`CancelableFuture`] pairing a read-only
    /// future handle with the run's cancel handle. Canceling the handle
    /// stops the underlying work and fails the future with
    /// [`TaskError::Cancelation`]; completion and cancelation race the same
    /// way any other outcome does, so whichever reaches the promise first
    /// wins.
    pub fn run<T>(&self, task: Task<T>) -> CancelableFuture<T>
    where
        T: Send + 'static,
    {
        CancelableFuture::spawn(self, task)
    }
}
