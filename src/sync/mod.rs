//! Small synchronisation primitives shared by the executors and schedulers.

mod cancel;
mod notifier;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cancel::{CancelController, Canceller, Checker, Resumer, SubscriptionId};
pub use notifier::ThreadNotifier;

/// Locks a mutex, ignoring poisoning. Task panics are caught before they can
/// unwind through any of the engine's critical sections, so the protected
/// state is always consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
