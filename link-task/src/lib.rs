//! `link-task` is a lazy, cancelable description of an asynchronous
//! computation, in the spirit of Scala's Monix `Task`.
//!
//! A [`Task<T>`] does nothing on its own: it is a value describing *how* to
//! produce a `T` (or fail), and only [`Runner::run_async`] /
//! [`Runner::run`] ever touches a [`Scheduler`]. Composing tasks with
//! [`Task::map`], [`Task::flat_map`], [`Task::map2`] and friends builds up a
//! bigger description without running anything.
//!
//! # Cancelation
//!
//! Every run is handed a fresh [`cancelable::MultiAssignmentCancelable`],
//! returned to the caller as a cancel handle. Cancelation is cooperative: it
//! is observed between trampoline frames (see [`scheduler::step`]), not by
//! interrupting in-flight user code.
//!
//! # Stack safety
//!
//! Long `map`/`flat_map` chains do not grow the call stack unboundedly.
//! [`scheduler::step`] counts synchronous hops and hands control back to the
//! [`Scheduler`] once a batch threshold is reached.

extern crate link_task_std_ext as std_ext;

mod callback;
pub mod cancelable;
mod error;
pub mod future;
mod runner;
pub mod scheduler;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod task;

pub use callback::{BoxCallback, SafeCallback};
pub use cancelable::{CancelToken, CompositeCancelable, MultiAssignmentCancelable};
pub use error::{TaskError, TracingReporter, UncaughtExceptionReporter};
pub use future::CancelableFuture;
pub use runner::Runner;
pub use scheduler::{BoxRunnable, RunCtx, Scheduler};
pub use task::Task;
