//! Cancellation handles returned to consumers.

use crate::locks::lock_or_recover;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type CancelFn = Box<dyn FnOnce() + Send>;

/// Handle for one consumer's subscription.
///
/// `cancel()` is idempotent: the first call detaches the consumer, later
/// calls do nothing. Clones share state. Dropping a handle does NOT cancel.
#[must_use = "dropping a SubscriptionHandle leaves the subscription running"]
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    cancelled: AtomicBool,
    on_cancel: Mutex<Option<CancelFn>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cancelled: AtomicBool::new(false),
                on_cancel: Mutex::new(Some(Box::new(on_cancel))),
            }),
        }
    }

    /// A handle with no cancel action yet; see [`SubscriptionHandle::attach`].
    pub(crate) fn detached() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cancelled: AtomicBool::new(false),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// Install the cancel action. Runs it immediately if the handle was
    /// cancelled in the meantime.
    pub(crate) fn attach(&self, on_cancel: impl FnOnce() + Send + 'static) {
        let mut slot = lock_or_recover(&self.inner.on_cancel, "subscription handle");
        if self.inner.cancelled.load(Ordering::SeqCst) {
            drop(slot);
            on_cancel();
            return;
        }
        *slot = Some(Box::new(on_cancel));
    }

    /// Stop deliveries to this consumer.
    pub fn cancel(&self) {
        let action = {
            let mut slot = lock_or_recover(&self.inner.on_cancel, "subscription handle");
            if self.inner.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            slot.take()
        };
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
