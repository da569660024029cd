use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::error::{TaskError, UncaughtExceptionReporter};

/// A two-arm completion sink, realized in Rust as a `FnOnce` over the
/// `Result` it is handed -- success and error are the two arms the original
/// design calls `on_success`/`on_error`.
pub type BoxCallback<T> = Box<dyn FnOnce(Result<T, TaskError>) + Send>;

/// Wraps a [`BoxCallback`] with a single-shot gate: the first of
/// [`SafeCallback::success`]/[`SafeCallback::error`] to be called forwards to
/// the wrapped callback, every subsequent call is silently dropped.
///
/// `SafeCallback` is cheap to clone (it is an `Arc` around a mutex-guarded
/// slot) so the same gate can be handed to every branch of a race or join:
/// whichever branch's outcome wins gets delivered, the rest are no-ops. This
/// is used both at the [`crate::Runner::run_async`] boundary and, for
/// defense in depth, as the actual delivery point for race/join arbiters
/// whose own atomic gate decides *which* branch gets to call it.
pub struct SafeCallback<T> {
    inner: Mutex<Option<BoxCallback<T>>>,
    reporter: Arc<dyn UncaughtExceptionReporter>,
}

impl<T> SafeCallback<T>
where
    T: Send + 'static,
{
    pub fn new(callback: BoxCallback<T>, reporter: Arc<dyn UncaughtExceptionReporter>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Some(callback)),
            reporter,
        })
    }

    fn take(&self) -> Option<BoxCallback<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
    }

    /// Deliver `outcome` if no prior call has already fired; otherwise a
    /// no-op. If the wrapped callback itself panics, the panic is caught and
    /// reported via the [`UncaughtExceptionReporter`] instead of being
    /// resumed -- there is no surviving listener to propagate it to. If
    /// `outcome` was an error, that original error is reported too, per the
    /// "report original, and the new failure" rule for listener panics.
    pub fn complete(&self, outcome: Result<T, TaskError>) {
        let Some(callback) = self.take() else {
            return;
        };
        let original_error = outcome.as_ref().err().cloned();
        let result = panic::catch_unwind(AssertUnwindSafe(|| callback(outcome)));
        if let Err(payload) = result {
            if let Some(original) = original_error {
                self.reporter.report_failure(original);
            }
            self.reporter.report_failure(TaskError::from_panic(payload));
        }
    }

    pub fn success(&self, value: T) {
        self.complete(Ok(value))
    }

    pub fn error(&self, error: TaskError) {
        self.complete(Err(error))
    }
}
