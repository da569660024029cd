use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::CancelToken;

/// A cancel handle that fans out to a set of children: canceling it cancels
/// every child, and removing a child drops this handle's responsibility for
/// it. Used by race/join arbiters to cancel every sibling branch once a
/// winner is chosen.
#[derive(Default)]
pub struct CompositeCancelable {
    canceled: AtomicBool,
    children: Mutex<Vec<Arc<dyn CancelToken>>>,
}

impl CompositeCancelable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a child. If this composite is already canceled, `child` is
    /// canceled immediately instead of being tracked.
    pub fn add(&self, child: Arc<dyn CancelToken>) {
        if self.canceled.load(Ordering::Acquire) {
            child.cancel();
            return;
        }
        self.children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(child.clone());
        if self.canceled.load(Ordering::Acquire) {
            child.cancel();
        }
    }

    /// Remove a child, e.g. once it has already completed and no longer
    /// needs to be canceled along with its siblings.
    pub fn remove(&self, child: &Arc<dyn CancelToken>) {
        self.children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|c| !Arc::ptr_eq(c, child));
    }
}

impl CancelToken for CompositeCancelable {
    fn cancel(&self) {
        if self
            .canceled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let children = std::mem::take(&mut *self.children.lock().unwrap_or_else(|p| p.into_inner()));
            for child in children {
                child.cancel();
            }
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}
