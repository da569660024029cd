//! [`Task::timeout`] / [`Task::timeout_with_backup`]: race a source against
//! a scheduled deadline. Built on the same winner-gate-plus-composite shape
//! as [`super::race::amb`], specialized to exactly two contenders: the
//! source, and a `schedule_once` runnable standing in for the deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::callback::{BoxCallback, SafeCallback};
use crate::cancelable::{CancelToken, CompositeCancelable, MultiAssignmentCancelable};
use crate::error::TaskError;
use crate::scheduler::{step, RunCtx};
use crate::task::Task;

impl<T> Task<T>
where
    T: Send + 'static,
{
    /// Fail with [`TaskError::Timeout`] if `self` has not completed within
    /// `delay`. Exactly one of {source outcome, timeout} is ever delivered;
    /// whichever loses the race is canceled.
    pub fn timeout(self, delay: Duration) -> Task<T> {
        timeout_impl(self, delay, None)
    }

    /// As [`Task::timeout`], but on expiry runs `backup` (with the original
    /// outer callback) instead of failing with [`TaskError::Timeout`].
    pub fn timeout_with_backup(self, delay: Duration, backup: Task<T>) -> Task<T> {
        timeout_impl(self, delay, Some(backup))
    }
}

fn timeout_impl<T>(source: Task<T>, delay: Duration, backup: Option<Task<T>>) -> Task<T>
where
    T: Send + 'static,
{
    Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<T>>| {
        step(ctx, frame, move |ctx, _frame| {
            let composite = CompositeCancelable::new();
            ctx.active.assign(composite.clone() as Arc<dyn CancelToken>);

            let won = Arc::new(AtomicBool::new(false));
            let backup = Arc::new(Mutex::new(backup));

            let main_active = MultiAssignmentCancelable::new();
            composite.add(main_active.clone());
            let main_ctx = RunCtx {
                active: main_active,
                ..ctx.clone()
            };

            {
                let cb = cb.clone();
                let won = won.clone();
                let composite = composite.clone();
                let relay: BoxCallback<T> = Box::new(move |outcome| {
                    if !won.swap(true, Ordering::AcqRel) {
                        composite.cancel();
                        match outcome {
                            Ok(value) => cb.success(value),
                            Err(err) => cb.error(err),
                        }
                    }
                });
                let safe = SafeCallback::new(relay, main_ctx.reporter.clone());
                let scheduler = main_ctx.scheduler.clone();
                let ctx_for_main = main_ctx.clone();
                scheduler.execute(Box::new(move || {
                    source.unsafe_run(ctx_for_main, 0, safe)
                }));
            }

            {
                let cb = cb.clone();
                let won = won.clone();
                let composite = composite.clone();
                let backup = backup.clone();
                let ctx_for_backup = ctx.clone();
                let token = ctx.scheduler.schedule_once(
                    delay,
                    Box::new(move || {
                        if !won.swap(true, Ordering::AcqRel) {
                            composite.cancel();
                            match backup.lock().unwrap_or_else(|p| p.into_inner()).take() {
                                Some(backup_task) => backup_task.unsafe_run(ctx_for_backup, 0, cb),
                                None => {
                                    tracing::warn!(?delay, "task timed out");
                                    cb.error(TaskError::Timeout(delay));
                                }
                            }
                        }
                    }),
                );
                composite.add(token);
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
    fn source_finishing_first_wins_and_cancels_the_deadline() {
        let scheduler = VirtualScheduler::new();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let task = Task::now(10).delay_execution(Duration::from_millis(5)).timeout(Duration::from_millis(50));
        runner(&scheduler).run_async_try(task, move |r| *outcome2.lock().unwrap() = Some(r));
        scheduler.advance(Duration::from_millis(5));
        assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(v)) if *v == 10));

        // The deadline's own schedule_once entry was canceled, so advancing
        // past it produces no second callback.
        scheduler.advance(Duration::from_millis(50));
        assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(v)) if *v == 10));
    }

    #[test]
    fn deadline_firing_first_fails_with_timeout() {
        let scheduler = VirtualScheduler::new();
        let never_ran = Arc::new(AtomicU32::new(0));
        let never_ran2 = never_ran.clone();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();

        let slow = Task::eval(move || {
            never_ran2.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(10)
        })
        .delay_execution(Duration::from_millis(100));
        let task = slow.timeout(Duration::from_millis(20));
        runner(&scheduler).run_async_try(task, move |r| *outcome2.lock().unwrap() = Some(r));
        scheduler.advance(Duration::from_millis(20));
        assert!(matches!(
            outcome.lock().unwrap().as_ref(),
            Some(Err(TaskError::Timeout(d))) if *d == Duration::from_millis(20)
        ));

        scheduler.advance(Duration::from_millis(200));
        assert_eq!(never_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timeout_with_backup_runs_the_backup_on_expiry() {
        let scheduler = VirtualScheduler::new();
        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let slow = Task::now(1).delay_execution(Duration::from_millis(100));
        let task = slow.timeout_with_backup(Duration::from_millis(10), Task::now(99));
        runner(&scheduler).run_async_try(task, move |r| *outcome2.lock().unwrap() = Some(r));
        scheduler.advance(Duration::from_millis(10));
        assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(v)) if *v == 99));
    }
}
