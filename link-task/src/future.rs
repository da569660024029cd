//! [`CancelableFuture`]: the `run()` overload's promise/future bridge.
//!
//! Backed by a `tokio::sync::oneshot` pair, the same bridge primitive
//! [`crate::scheduler::ThreadPoolScheduler`] itself is built on. The sender
//! half is shared (behind a mutex) between the task's own completion path
//! and [`CancelableFuture::cancel`], so whichever fires first wins and the
//! other is silently dropped -- the same "first write wins, second is a
//! no-op" shape as a try-complete on a promise.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::FutureExt as _;
use tokio::sync::oneshot;

use crate::cancelable::{CancelToken, MultiAssignmentCancelable};
use crate::error::TaskError;
use crate::runner::Runner;
use crate::task::Task;

type Outcome<T> = Result<T, TaskError>;
type Sender<T> = Arc<Mutex<Option<oneshot::Sender<Outcome<T>>>>>;

/// A [`Task`] run paired with its cancel handle: `.await` it like any other
/// future, or call [`CancelableFuture::cancel`] to abort the underlying
/// work early. Dropping the value without canceling lets the run continue
/// in the background; its outcome is simply discarded once the channel's
/// receiver is gone.
pub struct CancelableFuture<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
    sender: Sender<T>,
    active: Arc<MultiAssignmentCancelable>,
}

impl<T> CancelableFuture<T>
where
    T: Send + 'static,
{
    pub(crate) fn spawn(runner: &Runner, task: Task<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let sender: Sender<T> = Arc::new(Mutex::new(Some(tx)));
        let sender_for_outcome = sender.clone();
        let active = runner.run_async_try(task, move |outcome| {
            if let Some(tx) = sender_for_outcome
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
            {
                let _ = tx.send(outcome);
            }
        });
        Self {
            receiver: rx,
            sender,
            active,
        }
    }

    /// Cancel the underlying run and, idempotently, fail the future with
    /// [`TaskError::Cancelation`] unless it has already completed.
    pub fn cancel(&self) {
        self.active.cancel();
        if let Some(tx) = self.sender.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = tx.send(Err(TaskError::Cancelation));
        }
    }

    /// Whether the run's cancel handle has fired. Monotonic: once true,
    /// always true.
    pub fn is_canceled(&self) -> bool {
        self.active.is_canceled()
    }
}

impl<T> Future for CancelableFuture<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.receiver.poll_unpin(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The sender was dropped without sending: the run's safe
            // callback should always fire exactly once, so this only
            // happens if the run itself was torn down uncompleted.
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Cancelation)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::{TaskError, TracingReporter};
    use crate::runner::Runner;
    use crate::task::Task;
    use crate::testing::VirtualScheduler;

    fn runner(scheduler: &std::sync::Arc<VirtualScheduler>) -> Runner {
        Runner::new(scheduler.clone(), std::sync::Arc::new(TracingReporter))
    }

    #[tokio::test]
    async fn awaiting_resolves_to_the_task_s_outcome() {
        let scheduler = VirtualScheduler::new();
        let future = runner(&scheduler).run(Task::now(9).delay_execution(Duration::from_millis(5)));
        scheduler.advance(Duration::from_millis(5));
        assert_eq!(future.await, Ok(9));
    }

    #[tokio::test]
    async fn awaiting_a_failed_task_resolves_to_its_error() {
        let scheduler = VirtualScheduler::new();
        let future = runner(&scheduler).run(Task::<i32>::error(TaskError::NoSuchElement));
        scheduler.run_ready();
        assert!(matches!(future.await, Err(TaskError::NoSuchElement)));
    }

    #[tokio::test]
    async fn canceling_before_completion_resolves_to_cancelation() {
        let scheduler = VirtualScheduler::new();
        let future = runner(&scheduler).run(Task::now(1).delay_execution(Duration::from_millis(50)));
        future.cancel();
        assert!(future.is_canceled());
        assert!(matches!(future.await, Err(TaskError::Cancelation)));
    }
}
