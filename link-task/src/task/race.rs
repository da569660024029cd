//! Racing: [`amb_with`] (binary) and [`amb`] (n-ary), both built on one
//! atomic gate shared across every branch plus a [`CompositeCancelable`]
//! used to cancel the losers. Unlike [`super::par::map2`], a race forwards
//! *whichever* outcome -- success or error -- arrives first; there is no
//! pairing to wait for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::callback::{BoxCallback, SafeCallback};
use crate::cancelable::{CancelToken, CompositeCancelable, MultiAssignmentCancelable};
use crate::error::TaskError;
use crate::scheduler::{step, RunCtx};
use crate::task::Task;

/// Race `self` against `other`; the first to complete (success or error)
/// wins and cancels the loser.
pub(super) fn amb_with<T>(left: Task<T>, right: Task<T>) -> Task<T>
where
    T: Send + 'static,
{
    amb(vec![left, right])
}

/// Race a non-empty set of tasks; the first to complete (success or error)
/// wins, cancels every other branch, and its outcome is the only one
/// delivered. Mirrors [`super::par::parallel`]'s precondition: an empty
/// `tasks` is a programming error, not a recoverable [`TaskError`].
pub fn amb<T>(tasks: Vec<Task<T>>) -> Task<T>
where
    T: Send + 'static,
{
    assert!(!tasks.is_empty(), "Task::amb requires at least one task");

    if tasks.len() == 1 {
        return tasks.into_iter().next().expect("length checked above");
    }

    Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<T>>| {
        step(ctx, frame, move |ctx, _frame| {
            let composite = CompositeCancelable::new();
            ctx.active.assign(composite.clone() as Arc<dyn CancelToken>);

            let alive = Arc::new(AtomicBool::new(true));

            for task in tasks {
                let branch_active = MultiAssignmentCancelable::new();
                composite.add(branch_active.clone());
                let branch_ctx = RunCtx {
                    active: branch_active,
                    ..ctx.clone()
                };

                let cb = cb.clone();
                let alive = alive.clone();
                let composite = composite.clone();
                let branch_cb: BoxCallback<T> = Box::new(move |outcome| {
                    if !alive.swap(false, Ordering::AcqRel) {
                        tracing::trace!("amb: branch discarded, race already decided");
                        return;
                    }
                    match &outcome {
                        Ok(_) => tracing::trace!("amb: branch won the race with a success"),
                        Err(err) => tracing::warn!(err = %err, "amb: branch won the race with an error"),
                    }
                    composite.cancel();
                    match outcome {
                        Ok(value) => cb.success(value),
                        Err(err) => cb.error(err),
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
