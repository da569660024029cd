//! Parallel join: [`map2`] (binary, heterogeneous, arbitrary combiner),
//! [`zip`] (`map2` specialized to pairing), and [`parallel`] (n-ary,
//! homogeneous), all expressed over the same composite-cancelable-plus-
//! shared-state shape as [`super::race::amb`].
//!
//! The conceptual design describes the pairing cell as a CAS-retried atomic;
//! here it is a `Mutex`-guarded slot instead. Both give the same guarantee --
//! a branch observes either "I'm first" or "my sibling already arrived"
//! under one atomic critical section -- and a `Mutex` is the idiomatic way
//! to express that in safe Rust without reaching for unsafe atomic swaps of
//! enum payloads.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::callback::{BoxCallback, SafeCallback};
use crate::cancelable::{CancelToken, CompositeCancelable, MultiAssignmentCancelable};
use crate::error::TaskError;
use crate::scheduler::{step, RunCtx};
use crate::task::Task;

enum Slot<A, B> {
    Empty,
    Left(A),
    Right(B),
}

type Combiner<T, U, R> = Box<dyn FnOnce(T, U) -> R + Send>;

/// The parallel applicative: run `left` and `right` concurrently, each under
/// its own child of a shared composite, and deliver `f(a, b)` once both have
/// arrived. A branch failure cancels the composite (and so the sibling) and
/// delivers that error; whichever branch loses the race to flip `alive`
/// false is silently absorbed.
///
/// A branch reporting success **twice** (a protocol violation -- no
/// combinator in this crate does that, but a custom [`Task::create`] bridge
/// could) is caught by the slot already holding that branch's side: the
/// second arrival is answered with [`TaskError::IllegalState`] rather than
/// silently overwriting the first.
pub(super) fn map2<T, U, R>(
    left: Task<T>,
    right: Task<U>,
    f: impl FnOnce(T, U) -> R + Send + 'static,
) -> Task<R>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
{
    Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<R>>| {
        step(ctx, frame, move |ctx, _frame| {
            let composite = CompositeCancelable::new();
            ctx.active.assign(composite.clone() as Arc<dyn CancelToken>);

            let slot: Arc<Mutex<Slot<T, U>>> = Arc::new(Mutex::new(Slot::Empty));
            let combiner: Arc<Mutex<Option<Combiner<T, U, R>>>> =
                Arc::new(Mutex::new(Some(Box::new(f))));
            let alive = Arc::new(AtomicBool::new(true));

            let left_active = MultiAssignmentCancelable::new();
            composite.add(left_active.clone());
            let right_active = MultiAssignmentCancelable::new();
            composite.add(right_active.clone());

            let left_ctx = RunCtx {
                active: left_active,
                ..ctx.clone()
            };
            let right_ctx = RunCtx {
                active: right_active,
                ..ctx.clone()
            };

            enum Arrival<T, U> {
                Waiting,
                Paired(T, U),
                Violation,
            }

            {
                let cb = cb.clone();
                let slot = slot.clone();
                let combiner = combiner.clone();
                let alive = alive.clone();
                let composite = composite.clone();
                let left_cb: BoxCallback<T> = Box::new(move |outcome| match outcome {
                    Ok(a) => {
                        if !alive.load(Ordering::Acquire) {
                            tracing::trace!("map2: left branch discarded, pairing already decided");
                            return;
                        }
                        let arrival = {
                            let mut guard = slot.lock().unwrap_or_else(|p| p.into_inner());
                            match std::mem::replace(&mut *guard, Slot::Empty) {
                                Slot::Empty => {
                                    *guard = Slot::Left(a);
                                    Arrival::Waiting
                                }
                                Slot::Right(b) => Arrival::Paired(a, b),
                                Slot::Left(prev) => {
                                    *guard = Slot::Left(prev);
                                    Arrival::Violation
                                }
                            }
                        };
                        deliver(arrival, &combiner, &alive, &composite, &cb);
                    }
                    Err(err) => fail(err, &alive, &composite, &cb),
                });
                let left_safe = SafeCallback::new(left_cb, left_ctx.reporter.clone());
                let scheduler = left_ctx.scheduler.clone();
                let ctx_for_branch = left_ctx.clone();
                scheduler.execute(Box::new(move || {
                    left.unsafe_run(ctx_for_branch, 0, left_safe)
                }));
            }

            {
                let cb = cb.clone();
                let slot = slot.clone();
                let combiner = combiner.clone();
                let alive = alive.clone();
                let composite = composite.clone();
                let right_cb: BoxCallback<U> = Box::new(move |outcome| match outcome {
                    Ok(b) => {
                        if !alive.load(Ordering::Acquire) {
                            tracing::trace!("map2: right branch discarded, pairing already decided");
                            return;
                        }
                        let arrival = {
                            let mut guard = slot.lock().unwrap_or_else(|p| p.into_inner());
                            match std::mem::replace(&mut *guard, Slot::Empty) {
                                Slot::Empty => {
                                    *guard = Slot::Right(b);
                                    Arrival::Waiting
                                }
                                Slot::Left(a) => Arrival::Paired(a, b),
                                Slot::Right(prev) => {
                                    *guard = Slot::Right(prev);
                                    Arrival::Violation
                                }
                            }
                        };
                        deliver(arrival, &combiner, &alive, &composite, &cb);
                    }
                    Err(err) => fail(err, &alive, &composite, &cb),
                });
                let right_safe = SafeCallback::new(right_cb, right_ctx.reporter.clone());
                let scheduler = right_ctx.scheduler.clone();
                let ctx_for_branch = right_ctx.clone();
                scheduler.execute(Box::new(move || {
                    right.unsafe_run(ctx_for_branch, 0, right_safe)
                }));
            }

            fn deliver<T, U, R>(
                arrival: Arrival<T, U>,
                combiner: &Arc<Mutex<Option<Combiner<T, U, R>>>>,
                alive: &Arc<AtomicBool>,
                composite: &Arc<CompositeCancelable>,
                cb: &Arc<SafeCallback<R>>,
            ) {
                match arrival {
                    Arrival::Waiting => {}
                    Arrival::Paired(a, b) => {
                        if !alive.swap(false, Ordering::AcqRel) {
                            tracing::trace!("map2: pairing lost the CAS, another branch already resolved");
                            return;
                        }
                        let f = combiner
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .take()
                            .expect("map2: combiner consumed exactly once on the pairing transition");
                        match panic::catch_unwind(AssertUnwindSafe(|| f(a, b))) {
                            Ok(value) => cb.success(value),
                            Err(payload) => cb.error(TaskError::from_panic(payload)),
                        }
                    }
                    Arrival::Violation => {
                        if alive.swap(false, Ordering::AcqRel) {
                            tracing::warn!("map2: branch reported success twice, protocol violation");
                            composite.cancel();
                            cb.error(TaskError::illegal_state(
                                "map2 branch reported success twice",
                            ));
                        }
                    }
                }
            }

            fn fail<R>(
                err: TaskError,
                alive: &Arc<AtomicBool>,
                composite: &Arc<CompositeCancelable>,
                cb: &Arc<SafeCallback<R>>,
            ) {
                if alive.swap(false, Ordering::AcqRel) {
                    tracing::warn!(err = %err, "map2: branch failed, canceling sibling");
                    composite.cancel();
                    cb.error(err);
                } else {
                    tracing::trace!(err = %err, "map2: branch failed after pairing already decided");
                }
            }
        })
    }))
}

pub(super) fn zip<T, U>(left: Task<T>, right: Task<U>) -> Task<(T, U)>
where
    T: Send + 'static,
    U: Send + 'static,
{
    map2(left, right, |a, b| (a, b))
}

/// Run a set of tasks concurrently and collect their results in input order.
/// Requires a non-empty `tasks`, mirroring other precondition violations in
/// this crate (an empty input is a programming error, not a recoverable
/// [`TaskError`]).
pub fn parallel<T>(tasks: Vec<Task<T>>) -> Task<Vec<T>>
where
    T: Send + 'static,
{
    assert!(!tasks.is_empty(), "Task::parallel requires at least one task");
    Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<Vec<T>>>| {
        step(ctx, frame, move |ctx, _frame| {
            let total = tasks.len();
            let composite = CompositeCancelable::new();
            ctx.active.assign(composite.clone() as Arc<dyn CancelToken>);

            let alive = Arc::new(AtomicBool::new(true));
            let results: Arc<Mutex<Vec<Option<T>>>> =
                Arc::new(Mutex::new((0..total).map(|_| None).collect()));
            let remaining = Arc::new(AtomicUsize::new(total));

            for (index, task) in tasks.into_iter().enumerate() {
                let branch_active = MultiAssignmentCancelable::new();
                composite.add(branch_active.clone());
                let branch_ctx = RunCtx {
                    active: branch_active,
                    ..ctx.clone()
                };

                let cb = cb.clone();
                let results = results.clone();
                let remaining = remaining.clone();
                let alive = alive.clone();
                let composite = composite.clone();
                let branch_cb: BoxCallback<T> = Box::new(move |outcome| match outcome {
                    Ok(value) => {
                        if !alive.load(Ordering::Acquire) {
                            tracing::trace!(index, "parallel: branch discarded, join already failed");
                            return;
                        }
                        {
                            let mut guard = results.lock().unwrap_or_else(|p| p.into_inner());
                            guard[index] = Some(value);
                        }
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            let mut guard = results.lock().unwrap_or_else(|p| p.into_inner());
                            let collected = std::mem::take(&mut *guard)
                                .into_iter()
                                .map(|slot| slot.expect("parallel: every branch reported before completion"))
                                .collect();
                            cb.success(collected);
                        }
                    }
                    Err(err) => {
                        if alive.swap(false, Ordering::AcqRel) {
                            tracing::warn!(err = %err, index, "parallel: branch failed, canceling the rest");
                            composite.cancel();
                            cb.error(err);
                        } else {
                            tracing::trace!(err = %err, index, "parallel: branch failed after join already decided");
                        }
                    }
                });
                let branch_safe = SafeCallback::new(branch_cb, branch_ctx.reporter.clone());
                let scheduler = branch_ctx.scheduler.clone();
                let ctx_for_branch = branch_ctx.clone();
                scheduler.execute(Box::new(move || {
                    task.unsafe_run(ctx_for_branch, 0, branch_safe)
                }));
            }
        })
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::error::TaskError;
    use crate::runner::Runner;
    use crate::task::Task;
    use crate::testing::VirtualScheduler;

    fn runner(scheduler: &Arc<VirtualScheduler>) -> Runner {
        Runner::new(scheduler.clone(), Arc::new(crate::error::TracingReporter))
    }

    #[test]
    fn zip_pairs_both_branches() {
        let scheduler = VirtualScheduler::new();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        runner(&scheduler).run_async_try(
            Task::now(3).zip(Task::now(4)),
            move |result| *outcome2.lock().unwrap() = Some(result),
        );
        scheduler.run_ready();
        assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(v)) if *v == (3, 4)));
    }

    #[test]
    fn map2_combines_delayed_branches() {
        let scheduler = VirtualScheduler::new();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let task = Task::now(3)
            .delay_execution(Duration::from_millis(20))
            .map2(Task::now(4).delay_execution(Duration::from_millis(10)), |a, b| a + b);
        runner(&scheduler).run_async_try(task, move |result| *outcome2.lock().unwrap() = Some(result));
        scheduler.advance(Duration::from_millis(20));
        assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(v)) if *v == 7));
    }

    #[test]
    fn map2_cancels_sibling_on_first_error() {
        let scheduler = VirtualScheduler::new();
        let sibling_ran = Arc::new(AtomicU32::new(0));
        let sibling_ran2 = sibling_ran.clone();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();

        let failing = Task::<i32>::error(TaskError::failed(DummyError));
        let slow = Task::eval(move || {
            sibling_ran2.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(1)
        })
        .delay_execution(Duration::from_millis(50));

        let task = failing.map2(slow, |a, b| a + b);
        runner(&scheduler).run_async_try(task, move |result| *outcome2.lock().unwrap() = Some(result));
        scheduler.run_ready();
        scheduler.advance(Duration::from_millis(100));

        assert!(matches!(
            outcome.lock().unwrap().as_ref(),
            Some(Err(TaskError::Failed(_)))
        ));
        assert_eq!(sibling_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn parallel_collects_in_input_order() {
        let scheduler = VirtualScheduler::new();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let tasks = vec![
            Task::now(1).delay_execution(Duration::from_millis(30)),
            Task::now(2),
            Task::now(3).delay_execution(Duration::from_millis(10)),
        ];
        runner(&scheduler).run_async_try(Task::parallel(tasks), move |result| {
            *outcome2.lock().unwrap() = Some(result)
        });
        scheduler.advance(Duration::from_millis(30));
        assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(v)) if *v == vec![1, 2, 3]));
    }

    #[test]
    #[should_panic(expected = "at least one task")]
    fn parallel_rejects_empty_input() {
        let _: Task<i32> = Task::parallel(vec![]);
    }

    #[derive(Debug)]
    struct DummyError;
    impl std::fmt::Display for DummyError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "dummy")
        }
    }
    impl std::error::Error for DummyError {}
}
