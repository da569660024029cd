use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The single error type flowing through a [`crate::Task`]'s `on_error` arm.
///
/// This is a closed enum rather than `Box<dyn Error>` so combinators such as
/// [`crate::Task::timeout`] can match on `Timeout`/`Cancelation` without
/// downcasting. Variants that carry a user payload wrap it in an `Arc` so
/// `TaskError` stays cheap to clone -- needed when the same failure must be
/// handed both to the downstream callback and to the uncaught-exception
/// reporter (see [`crate::SafeCallback`]).
#[derive(Clone, Debug, thiserror::Error)]
pub enum TaskError {
    /// A user-supplied closure panicked, or explicitly failed.
    #[error("{0}")]
    Failed(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// [`crate::Task::timeout`] fired before the source completed.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The run was canceled before it produced an outcome.
    #[error("task was canceled")]
    Cancelation,

    /// A race/join branch violated the at-most-one-signal protocol. This is
    /// a bug in a [`crate::Scheduler`] or `create` bridge, not a recoverable
    /// failure of the computation itself.
    #[error("illegal state: {0}")]
    IllegalState(Arc<str>),

    /// [`crate::Task::failed`] was run on a source that succeeded.
    #[error("source completed successfully; failed() expects a failure")]
    NoSuchElement,
}

impl TaskError {
    /// Build a [`TaskError::Failed`] from an ordinary error value.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskError::Failed(Arc::new(error))
    }

    /// Build a [`TaskError::IllegalState`] from a message.
    pub fn illegal_state(message: impl Into<Arc<str>>) -> Self {
        TaskError::IllegalState(message.into())
    }

    /// Convert a caught panic payload (as produced by
    /// [`std::panic::catch_unwind`]) into a [`TaskError::Failed`].
    ///
    /// Only ordinary panics reach here: a stack overflow or an abort-on-panic
    /// build terminates the process before `catch_unwind` ever gets a chance
    /// to run, which is exactly the fatal/non-fatal split this crate relies
    /// on instead of reimplementing Java's `NonFatal` classifier.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };
        TaskError::Failed(Arc::new(Panicked(message)))
    }
}

#[derive(Debug)]
struct Panicked(String);

impl fmt::Display for Panicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Panicked {}

/// Sink for failures that have nowhere left to go: a panic inside a
/// [`crate::SafeCallback`]'s wrapped listener, or the original error in a
/// recover/retry path once its replacement has been delivered.
pub trait UncaughtExceptionReporter: Send + Sync {
    fn report_failure(&self, error: TaskError);
}

/// Reports uncaught failures via `tracing::error!`. This is the default used
/// by [`crate::scheduler::ThreadPoolScheduler`].
#[derive(Debug, Default)]
pub struct TracingReporter;

impl UncaughtExceptionReporter for TracingReporter {
    fn report_failure(&self, error: TaskError) {
        tracing::error!(err = %error, "uncaught task failure");
    }
}
