//! Error recovery and retry: [`on_error_recover`], [`on_error_recover_with`],
//! [`on_error_fallback_to`], [`on_error_retry`], [`on_error_retry_if`].
//!
//! `on_error_recover`/`on_error_recover_with`/`on_error_fallback_to` only
//! ever touch the source's *first* error, so they stay plain `Task<T>`
//! methods that consume `self`. Retrying is different: retrying means
//! re-running the very same computation, and a `Task<T>` here is a one-shot
//! `FnOnce` description the way polling a `Future` to completion consumes
//! it -- there is no `self` left to hand to a second attempt. So
//! [`on_error_retry`] and [`on_error_retry_if`] take a repeatable producer
//! (`Fn() -> Task<T>`, the same shape [`crate::Task::defer`] already uses
//! for "build a fresh description on demand") instead of a `Task<T>` value,
//! and are associated functions rather than `self`-methods.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::callback::{BoxCallback, SafeCallback};
use crate::error::TaskError;
use crate::scheduler::{step, FrameId, RunCtx};
use crate::task::Task;

impl<T> Task<T>
where
    T: Send + 'static,
{
    /// On source error, if `pf(&err)` is `Some(value)`, recover with
    /// `value`; if `None`, forward the original error unchanged. A panic
    /// raised while evaluating `pf` reports the *original* error to the
    /// scheduler's uncaught-exception reporter and delivers the panic as
    /// the new downstream error.
    pub fn on_error_recover(
        self,
        pf: impl FnOnce(&TaskError) -> Option<T> + Send + 'static,
    ) -> Task<T> {
        Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<T>>| {
            let reporter = ctx.reporter.clone();
            let relay: BoxCallback<T> = Box::new(move |outcome| match outcome {
                Ok(value) => cb.success(value),
                Err(err) => match panic::catch_unwind(AssertUnwindSafe(|| pf(&err))) {
                    Ok(Some(recovered)) => cb.success(recovered),
                    Ok(None) => cb.error(err),
                    Err(payload) => {
                        reporter.report_failure(err);
                        cb.error(TaskError::from_panic(payload));
                    }
                },
            });
            let relay_cb = SafeCallback::new(relay, ctx.reporter.clone());
            self.run_stepped(ctx, frame, relay_cb);
        }))
    }

    /// As [`Task::on_error_recover`], but the recovery produces a `Task<T>`
    /// to run next rather than an immediate value.
    pub fn on_error_recover_with(
        self,
        pf: impl FnOnce(&TaskError) -> Option<Task<T>> + Send + 'static,
    ) -> Task<T> {
        Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<T>>| {
            let ctx_for_recovery = ctx.clone();
            let reporter = ctx.reporter.clone();
            let relay: BoxCallback<T> = Box::new(move |outcome| match outcome {
                Ok(value) => cb.success(value),
                Err(err) => match panic::catch_unwind(AssertUnwindSafe(|| pf(&err))) {
                    Ok(Some(next)) => next.run_stepped(ctx_for_recovery, 0, cb),
                    Ok(None) => cb.error(err),
                    Err(payload) => {
                        reporter.report_failure(err);
                        cb.error(TaskError::from_panic(payload));
                    }
                },
            });
            let relay_cb = SafeCallback::new(relay, ctx.reporter.clone());
            self.run_stepped(ctx, frame, relay_cb);
        }))
    }

    /// On source error, run `producer()` as a replacement. If `producer`
    /// itself panics synchronously, the same report-original/deliver-new
    /// rule as [`Task::on_error_recover`] applies.
    pub fn on_error_fallback_to(
        self,
        producer: impl FnOnce() -> Task<T> + Send + 'static,
    ) -> Task<T> {
        Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<T>>| {
            let ctx_for_fallback = ctx.clone();
            let reporter = ctx.reporter.clone();
            let relay: BoxCallback<T> = Box::new(move |outcome| match outcome {
                Ok(value) => cb.success(value),
                Err(err) => match panic::catch_unwind(AssertUnwindSafe(producer)) {
                    Ok(fallback) => fallback.run_stepped(ctx_for_fallback, 0, cb),
                    Err(payload) => {
                        reporter.report_failure(err);
                        cb.error(TaskError::from_panic(payload));
                    }
                },
            });
            let relay_cb = SafeCallback::new(relay, ctx.reporter.clone());
            self.run_stepped(ctx, frame, relay_cb);
        }))
    }

    /// Run `producer()` up to `retries + 1` times, short-circuiting on the
    /// first success. If every attempt fails, the *last* error is
    /// delivered. Equivalent to [`Task::on_error_retry_if`] with a predicate
    /// that always returns `true`.
    pub fn on_error_retry(
        producer: impl Fn() -> Task<T> + Send + Sync + 'static,
        retries: u32,
    ) -> Task<T> {
        Task::on_error_retry_if(producer, move |_| true, retries)
    }

    /// Run `producer()`, retrying up to `retries` additional times as long
    /// as `pred(&err)` is true for the error from the attempt that just
    /// failed. A panic in `pred` reports the original error and delivers
    /// the panic as the new downstream error, without consuming a retry.
    pub fn on_error_retry_if(
        producer: impl Fn() -> Task<T> + Send + Sync + 'static,
        pred: impl Fn(&TaskError) -> bool + Send + Sync + 'static,
        retries: u32,
    ) -> Task<T> {
        let producer: Arc<dyn Fn() -> Task<T> + Send + Sync> = Arc::new(producer);
        let pred: Arc<dyn Fn(&TaskError) -> bool + Send + Sync> = Arc::new(pred);
        Task::Async(Box::new(move |ctx, frame, cb: Arc<SafeCallback<T>>| {
            step(ctx, frame, move |ctx, frame| {
                attempt(producer, pred, retries, ctx, frame, cb)
            })
        }))
    }
}

fn attempt<T>(
    producer: Arc<dyn Fn() -> Task<T> + Send + Sync>,
    pred: Arc<dyn Fn(&TaskError) -> bool + Send + Sync>,
    remaining: u32,
    ctx: RunCtx,
    frame: FrameId,
    cb: Arc<SafeCallback<T>>,
) where
    T: Send + 'static,
{
    let source = producer();
    let ctx_for_retry = ctx.clone();
    let reporter = ctx.reporter.clone();
    let producer_for_retry = producer.clone();
    let pred_for_retry = pred.clone();
    let relay: BoxCallback<T> = Box::new(move |outcome| match outcome {
        Ok(value) => cb.success(value),
        Err(err) => {
            if remaining == 0 {
                cb.error(err);
                return;
            }
            let should_retry = match panic::catch_unwind(AssertUnwindSafe(|| pred_for_retry(&err))) {
                Ok(should_retry) => should_retry,
                Err(payload) => {
                    reporter.report_failure(err);
                    cb.error(TaskError::from_panic(payload));
                    return;
                }
            };
            if !should_retry {
                cb.error(err);
                return;
            }
            tracing::warn!(err = %err, remaining, "task failed, retrying");
            step(ctx_for_retry, 0, move |ctx, frame| {
                attempt(producer_for_retry, pred_for_retry, remaining - 1, ctx, frame, cb)
            });
        }
    });
    let relay_cb = SafeCallback::new(relay, ctx.reporter.clone());
    source.run_stepped(ctx, frame, relay_cb);
}
