//! [`Task<T>`] and its core combinators.
//!
//! A `Task` is represented as a tagged sum over its variants rather than a
//! trait-object chain of opaque closures: [`Task::Now`] and [`Task::Error`]
//! are held as plain values so [`crate::Runner::run_async`] can special-case
//! them and skip the scheduler entirely, while every other combinator
//! compiles down to [`Task::Async`], a boxed closure capturing whatever
//! state it needs.

mod par;
mod race;
mod recover;
mod timeout;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::callback::SafeCallback;
use crate::error::TaskError;
use crate::scheduler::{step, FrameId, RunCtx, Scheduler};

pub(crate) type BoxRun<T> = Box<dyn FnOnce(RunCtx, FrameId, Arc<SafeCallback<T>>) + Send>;

/// A lazy description of an asynchronous computation yielding a `T` or a
/// [`TaskError`]. Nothing runs until the task is handed to
/// [`crate::Runner::run_async`] or [`crate::Runner::run`].
///
/// `Task` values are single-use: running one consumes it, the same way
/// polling a `Future` to completion consumes it. To re-run the same
/// description repeatedly, wrap its construction in [`Task::defer`].
pub enum Task<T> {
    Now(T),
    Error(TaskError),
    Async(BoxRun<T>),
}

impl<T> Task<T>
where
    T: Send + 'static,
{
    /// An already-successful task. `run_async` delivers this without
    /// touching the scheduler at all.
    pub fn now(value: T) -> Self {
        Task::Now(value)
    }

    /// An already-failed task.
    pub fn error(error: TaskError) -> Self {
        Task::Error(error)
    }

    /// Evaluate `thunk` synchronously when run, re-evaluating it on every
    /// run. A thunk that panics, or that returns `Err`, has its failure
    /// delivered via `on_error` -- a panic as [`TaskError::Failed`] wrapping
    /// the panic payload, an `Err(e)` as [`TaskError::Failed`] wrapping `e`
    /// directly. For a thunk that never fails, return `Ok(value)` with an
    /// error type such as [`crate::std_ext::Void`] (`std::convert::Infallible`).
    pub fn eval<E>(thunk: impl FnOnce() -> Result<T, E> + Send + 'static) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Task::Async(Box::new(move |ctx, frame, cb| {
            step(ctx, frame, move |_ctx, _frame| {
                match panic::catch_unwind(AssertUnwindSafe(thunk)) {
                    Ok(Ok(value)) => cb.success(value),
                    Ok(Err(err)) => cb.error(TaskError::failed(err)),
                    Err(payload) => cb.error(TaskError::from_panic(payload)),
                }
            })
        }))
    }

    /// Lazily produce a task when run, i.e. `eval(producer).flatten()`.
    /// Equivalent to [`Task::eval`] but for producers that build the next
    /// `Task` rather than a plain value.
    pub fn defer(producer: impl FnOnce() -> Task<T> + Send + 'static) -> Self {
        Task::Async(Box::new(move |ctx, frame, cb| {
            step(ctx, frame, move |ctx, frame| {
                match panic::catch_unwind(AssertUnwindSafe(producer)) {
                    Ok(task) => task.unsafe_run(ctx, frame, cb),
                    Err(payload) => cb.error(TaskError::from_panic(payload)),
                }
            })
        }))
    }

    /// Force an asynchronous boundary before running `self`.
    ///
    /// Uses `start_async` (submitting to the scheduler unconditionally)
    /// unless the scheduler already guarantees every `execute` hops off the
    /// caller's thread ([`Scheduler::is_always_async`]), in which case a
    /// plain `start_now` is enough.
    pub fn fork(self) -> Self {
        Task::Async(Box::new(move |ctx, _frame, cb| {
            if ctx.scheduler.is_always_async() {
                self.unsafe_run(ctx, 0, cb);
            } else {
                let ctx2 = ctx.clone();
                ctx.scheduler
                    .execute(Box::new(move || self.unsafe_run(ctx2, 0, cb)));
            }
        }))
    }

    /// Bridge a callback-style API. `register` is handed the downstream
    /// callback and the active scheduler, and must return a cancel token
    /// representing the bridged operation; that token is assigned into the
    /// active multi-assignment handle, so canceling the run cancels the
    /// bridged operation too. If `register` panics before returning, the
    /// panic is caught and delivered via the callback.
    pub fn create(
        register: impl FnOnce(Arc<SafeCallback<T>>, Arc<dyn Scheduler>) -> Arc<dyn crate::cancelable::CancelToken>
            + Send
            + 'static,
    ) -> Self {
        Task::Async(Box::new(move |ctx, frame, cb| {
            step(ctx, frame, move |ctx, _frame| {
                let active = ctx.active.clone();
                let scheduler = ctx.scheduler.clone();
                let cb_for_register = cb.clone();
                match panic::catch_unwind(AssertUnwindSafe(move || {
                    register(cb_for_register, scheduler)
                })) {
                    Ok(token) => active.assign(token),
                    Err(payload) => cb.error(TaskError::from_panic(payload)),
                }
            })
        }))
    }

    /// Functor map: `f` runs under an error quarantine so a panic inside it
    /// is caught and delivered via `on_error`, while a source error is
    /// forwarded unchanged without ever calling `f`.
    pub fn map<U>(self, f: impl FnOnce(T) -> U + Send + 'static) -> Task<U>
    where
        U: Send + 'static,
    {
        Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<U>>| {
            let downstream = cb.clone();
            let relay: crate::callback::BoxCallback<T> = Box::new(move |outcome| match outcome {
                Ok(value) => match panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
                    Ok(mapped) => downstream.success(mapped),
                    Err(payload) => downstream.error(TaskError::from_panic(payload)),
                },
                Err(err) => downstream.error(err),
            });
            let relay_cb = SafeCallback::new(relay, ctx.reporter.clone());
            self.run_stepped(ctx, frame, relay_cb);
        }))
    }

    /// Monadic bind: on success, `k(value)` is run under the same quarantine
    /// as [`Task::map`], and the resulting task is stepped into under a fresh
    /// frame count. A source error is forwarded unchanged without calling
    /// `k`.
    pub fn flat_map<U>(self, k: impl FnOnce(T) -> Task<U> + Send + 'static) -> Task<U>
    where
        U: Send + 'static,
    {
        Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<U>>| {
            let ctx_for_relay = ctx.clone();
            let relay: crate::callback::BoxCallback<T> = Box::new(move |outcome| match outcome {
                Ok(value) => match panic::catch_unwind(AssertUnwindSafe(|| k(value))) {
                    Ok(next) => next.run_stepped(ctx_for_relay, 0, cb),
                    Err(payload) => cb.error(TaskError::from_panic(payload)),
                },
                Err(err) => cb.error(err),
            });
            let relay_cb = SafeCallback::new(relay, ctx.reporter.clone());
            self.run_stepped(ctx, frame, relay_cb);
        }))
    }

    /// Delay running `self` by `delay`.
    pub fn delay_execution(self, delay: Duration) -> Self {
        Task::Async(Box::new(move |ctx, frame, cb| {
            step(ctx, frame, move |ctx, _frame| {
                let scheduler = ctx.scheduler.clone();
                let active = ctx.active.clone();
                let token = scheduler.schedule_once(
                    delay,
                    Box::new(move || self.unsafe_run(ctx, 0, cb)),
                );
                active.assign(token);
            })
        }))
    }

    /// Run `self`, then delay delivery of its outcome (success or error) by
    /// `delay`.
    pub fn delay_result(self, delay: Duration) -> Self {
        Task::Async(Box::new(move |ctx, frame, cb| {
            let relay_ctx = ctx.clone();
            let relay: crate::callback::BoxCallback<T> = Box::new(move |outcome| {
                let scheduler = relay_ctx.scheduler.clone();
                let active = relay_ctx.active.clone();
                let token = scheduler.schedule_once(
                    delay,
                    Box::new(move || cb.complete(outcome)),
                );
                active.assign(token);
            });
            let relay_cb = SafeCallback::new(relay, ctx.reporter.clone());
            self.run_stepped(ctx, frame, relay_cb);
        }))
    }

    /// Require `self` to fail, mapping its error to a value and its success
    /// to [`TaskError::NoSuchElement`].
    pub fn failed(self) -> Task<TaskError> {
        Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<TaskError>>| {
            let relay: crate::callback::BoxCallback<T> = Box::new(move |outcome| match outcome {
                Ok(_) => cb.error(TaskError::NoSuchElement),
                Err(err) => cb.success(err),
            });
            let relay_cb = SafeCallback::new(relay, ctx.reporter.clone());
            self.run_stepped(ctx, frame, relay_cb);
        }))
    }

    /// Pair `self` with `other`, running both concurrently and succeeding
    /// with both results once both complete, or failing with whichever error
    /// arrives first (canceling the other branch).
    pub fn zip<U>(self, other: Task<U>) -> Task<(T, U)>
    where
        U: Send + 'static,
    {
        par::zip(self, other)
    }

    /// The parallel applicative: run `self` and `other` concurrently and
    /// combine their results with `f` once both arrive, or fail with
    /// whichever error arrives first (canceling the other branch).
    pub fn map2<U, R>(self, other: Task<U>, f: impl FnOnce(T, U) -> R + Send + 'static) -> Task<R>
    where
        U: Send + 'static,
        R: Send + 'static,
    {
        par::map2(self, other, f)
    }

    /// Run a non-empty set of tasks concurrently, collecting every result in
    /// input order. Fails (and cancels every other branch) with whichever
    /// error arrives first. Panics if `tasks` is empty.
    pub fn parallel(tasks: Vec<Task<T>>) -> Task<Vec<T>> {
        par::parallel(tasks)
    }

    /// Race `self` against `other`; the first to complete (success or
    /// error) wins and cancels the loser.
    pub fn amb_with(self, other: Task<T>) -> Task<T> {
        race::amb_with(self, other)
    }

    /// Race a non-empty set of tasks; the first to complete (success or
    /// error) wins and cancels every other branch. Panics if `tasks` is
    /// empty.
    pub fn amb(tasks: Vec<Task<T>>) -> Task<T> {
        race::amb(tasks)
    }

    pub(crate) fn unsafe_run(self, ctx: RunCtx, frame: FrameId, cb: Arc<SafeCallback<T>>) {
        if ctx.is_canceled() {
            return;
        }
        match self {
            Task::Now(value) => cb.success(value),
            Task::Error(error) => cb.error(error),
            Task::Async(run) => run(ctx, frame, cb),
        }
    }

    pub(crate) fn run_stepped(self, ctx: RunCtx, frame: FrameId, cb: Arc<SafeCallback<T>>) {
        step(ctx, frame, move |ctx, frame| self.unsafe_run(ctx, frame, cb))
    }
}

impl<U> Task<Task<U>>
where
    U: Send + 'static,
{
    /// Collapse a task-of-a-task into a single task, i.e.
    /// `self.flat_map(|task| task)`.
    pub fn flatten(self) -> Task<U> {
        self.flat_map(|inner| inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use proptest::prelude::*;

    use crate::cancelable::Cancelable;
    use crate::error::TaskError;
    use crate::runner::Runner;
    use crate::testing::VirtualScheduler;

    use super::Task;

    fn runner(scheduler: &Arc<VirtualScheduler>) -> Runner {
        Runner::new(scheduler.clone(), Arc::new(crate::error::TracingReporter))
    }

    fn run_now<T: Send + 'static>(task: Task<T>) -> Result<T, TaskError> {
        let scheduler = VirtualScheduler::new();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        runner(&scheduler).run_async_try(task, move |r| *outcome2.lock().unwrap() = Some(r));
        scheduler.run_ready();
        outcome.lock().unwrap().take().expect("task should have completed synchronously")
    }

    #[test]
    fn map_is_lazy_until_run() {
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let task = Task::eval(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(1)
        })
        .map(|n| n + 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(matches!(run_now(task), Ok(2)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn map_does_not_touch_a_source_error() {
        let touched = Arc::new(AtomicU32::new(0));
        let touched2 = touched.clone();
        let task = Task::<i32>::error(TaskError::NoSuchElement).map(move |n| {
            touched2.fetch_add(1, Ordering::SeqCst);
            n
        });
        assert!(matches!(run_now(task), Err(TaskError::NoSuchElement)));
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn map_panicking_delivers_a_failed_error_without_poisoning_anything() {
        let task: Task<i32> = Task::now(1).map(|_| panic!("boom"));
        assert!(matches!(run_now(task), Err(TaskError::Failed(_))));
    }

    #[test]
    fn flat_map_sequences_two_tasks() {
        let task = Task::now(1).flat_map(|n| Task::now(n + 1)).flat_map(|n| Task::now(n * 10));
        assert!(matches!(run_now(task), Ok(20)));
    }

    #[test]
    fn flatten_is_flat_map_with_identity() {
        let task: Task<Task<i32>> = Task::now(Task::now(5));
        assert!(matches!(run_now(task.flatten()), Ok(5)));
    }

    #[test]
    fn failed_turns_a_source_error_into_a_success() {
        let task = Task::<i32>::error(TaskError::NoSuchElement).failed();
        assert!(matches!(run_now(task), Ok(TaskError::NoSuchElement)));
    }

    #[test]
    fn failed_turns_a_source_success_into_no_such_element() {
        let task = Task::now(1).failed();
        assert!(matches!(run_now(task), Err(TaskError::NoSuchElement)));
    }

    #[test]
    fn create_bridges_a_callback_style_api() {
        let scheduler = VirtualScheduler::new();
        let task = Task::create(move |cb, _scheduler| {
            cb.success(42);
            Arc::new(Cancelable::from_fn(|| {})) as Arc<dyn crate::cancelable::CancelToken>
        });
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        runner(&scheduler).run_async_try(task, move |r| *outcome2.lock().unwrap() = Some(r));
        assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(v)) if *v == 42));
    }

    #[test]
    fn delay_result_postpones_delivery_but_not_evaluation() {
        let scheduler = VirtualScheduler::new();
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let task = Task::eval(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(1)
        })
        .delay_result(Duration::from_millis(10));
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        runner(&scheduler).run_async_try(task, move |r| *outcome2.lock().unwrap() = Some(r));
        scheduler.run_ready();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(outcome.lock().unwrap().is_none());
        scheduler.advance(Duration::from_millis(10));
        assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(v)) if *v == 1));
    }

    /// A million-deep chain of `map` calls must not blow the stack: `step`'s
    /// frame counter forces a scheduler hop every `batch_threshold` hops
    /// instead of letting the synchronous recursion grow unbounded.
    #[test]
    fn a_million_deep_map_chain_does_not_overflow_the_stack() {
        let mut task = Task::now(0i64);
        for _ in 0..1_000_000 {
            task = task.map(|n| n + 1);
        }
        assert!(matches!(run_now(task), Ok(n) if n == 1_000_000));
    }

    proptest! {
        #[test]
        fn map_respects_the_functor_identity_law(n in any::<i32>()) {
            let result = run_now(Task::now(n).map(|x| x));
            prop_assert!(matches!(result, Ok(v) if v == n));
        }

        #[test]
        fn map_respects_functor_composition(n in any::<i32>(), a in 1i32..100, b in 1i32..100) {
            let composed = run_now(Task::now(n).map(move |x| (x.wrapping_add(a)).wrapping_mul(b)));
            let sequenced = run_now(Task::now(n).map(move |x| x.wrapping_add(a)).map(move |x| x.wrapping_mul(b)));
            prop_assert_eq!(composed.ok(), sequenced.ok());
        }

        #[test]
        fn flat_map_respects_the_left_identity_law(n in any::<i32>(), a in 1i32..100) {
            let direct = run_now(Task::now(n + a));
            let bound = run_now(Task::now(n).flat_map(move |x| Task::now(x + a)));
            prop_assert_eq!(direct.ok(), bound.ok());
        }
    }
}
