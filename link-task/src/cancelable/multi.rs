use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{empty, CancelToken};

/// A cancel handle whose inner target can be rebound over time.
///
/// This is the handle [`crate::Runner::run_async`] returns to callers, and
/// the one [`crate::scheduler::step`] checks between trampoline frames.
/// Reassigning the inner handle does *not* cancel the handle being replaced
/// -- only an explicit `cancel()` of the outer [`MultiAssignmentCancelable`]
/// does that, and from then on any further `assign` cancels its argument
/// immediately instead of storing it.
pub struct MultiAssignmentCancelable {
    canceled: AtomicBool,
    current: Mutex<Arc<dyn CancelToken>>,
}

impl MultiAssignmentCancelable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            canceled: AtomicBool::new(false),
            current: Mutex::new(empty()),
        })
    }

    /// Rebind the inner handle. If this handle is already canceled, `inner`
    /// is canceled immediately instead of being stored, closing the race
    /// between a concurrent `cancel()` and this `assign()`.
    pub fn assign(&self, inner: Arc<dyn CancelToken>) {
        if self.canceled.load(Ordering::Acquire) {
            inner.cancel();
            return;
        }
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = inner;
        // `cancel()` may have raced us between the load above and the store:
        // re-check and cancel what we just installed if so.
        if self.canceled.load(Ordering::Acquire) {
            self.current
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .cancel();
        }
    }
}

impl CancelToken for MultiAssignmentCancelable {
    fn cancel(&self) {
        if self
            .canceled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.current
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .cancel();
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancelable::Cancelable;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn reassignment_does_not_cancel_previous_inner() {
        let handle = MultiAssignmentCancelable::new();
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let calls = first_calls.clone();
            Arc::new(Cancelable::from_fn(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let second = {
            let calls = second_calls.clone();
            Arc::new(Cancelable::from_fn(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }))
        };

        handle.assign(first);
        handle.assign(second);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);

        handle.cancel();
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_canceled());
    }

    #[test]
    fn assign_after_cancel_cancels_immediately() {
        let handle = MultiAssignmentCancelable::new();
        handle.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let inner = {
            let calls = calls.clone();
            Arc::new(Cancelable::from_fn(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }))
        };
        handle.assign(inner);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_canceled_is_monotonic() {
        let handle = MultiAssignmentCancelable::new();
        assert!(!handle.is_canceled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_canceled());
    }

    proptest! {
        #[test]
        fn is_canceled_is_monotonic_across_arbitrary_assign_cancel_sequences(
            assigns_before_cancel in 0usize..6,
            assigns_after_cancel in 0usize..6,
            extra_cancels in 0usize..4,
        ) {
            let handle = MultiAssignmentCancelable::new();

            for _ in 0..assigns_before_cancel {
                handle.assign(Arc::new(Cancelable::from_fn(|| {})));
                prop_assert!(!handle.is_canceled());
            }

            handle.cancel();
            prop_assert!(handle.is_canceled());

            for _ in 0..assigns_after_cancel {
                let calls = Arc::new(AtomicUsize::new(0));
                let calls2 = calls.clone();
                handle.assign(Arc::new(Cancelable::from_fn(move || {
                    calls2.fetch_add(1, Ordering::SeqCst);
                })));
                // Once canceled, every further assign cancels its argument
                // immediately instead of storing it.
                prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
                prop_assert!(handle.is_canceled());
            }

            for _ in 0..extra_cancels {
                handle.cancel();
                prop_assert!(handle.is_canceled());
            }
        }
    }
}
