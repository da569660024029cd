use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::CancelToken;

/// Owns one arbitrary cancelation thunk, invoked at most once.
pub struct Cancelable {
    canceled: AtomicBool,
    thunk: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Cancelable {
    /// A token whose `cancel()` runs `f` exactly once, on whichever thread
    /// first calls `cancel()`.
    pub fn from_fn(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            canceled: AtomicBool::new(false),
            thunk: Mutex::new(Some(Box::new(f))),
        }
    }
}

impl CancelToken for Cancelable {
    fn cancel(&self) {
        if self
            .canceled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(thunk) = self
                .thunk
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .take()
            {
                thunk();
            }
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}
