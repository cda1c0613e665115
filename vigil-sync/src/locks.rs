use std::sync::{Mutex, MutexGuard};
use vigil_core::{VigilError, VigilResult};

/// Lock `mutex`, mapping poisoning to `LockPoisoned`.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, resource: &'static str) -> VigilResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| VigilError::lock_poisoned(resource))
}

/// Lock `mutex` from a context that cannot report errors (timer tasks,
/// cancel closures). A poisoned lock is logged and recovered.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, resource: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(resource = resource, "Lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
