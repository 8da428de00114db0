use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::lock;

type Subscriber = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`Checker::on_cancelled`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
}

/// A shared cancel flag plus a list of callbacks fired whenever it is set.
///
/// The controller itself can do everything. To hand out less, give away one
/// of its views:
///
/// * [`Checker`] reads the flag and subscribes to cancellation.
/// * [`Canceller`] can additionally set the flag.
/// * [`Resumer`] can additionally clear it.
///
/// All views are cheap to clone and refer to the same flag.
#[derive(Clone)]
pub struct CancelController {
    inner: Arc<Inner>,
}

impl CancelController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn checker(&self) -> Checker {
        Checker {
            inner: self.inner.clone(),
        }
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(self.checker())
    }

    pub fn resumer(&self) -> Resumer {
        Resumer(self.canceller())
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        cancel(&self.inner);
    }

    pub fn resume(&self) {
        self.inner.cancelled.store(false, Ordering::Release);
    }
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelController")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn cancel(inner: &Inner) {
    inner.cancelled.store(true, Ordering::Release);

    // Callbacks run outside the lock so that they may subscribe or
    // unsubscribe themselves.
    let subscribers: Vec<Subscriber> = lock(&inner.subscribers)
        .iter()
        .map(|(_, s)| s.clone())
        .collect();

    for subscriber in subscribers {
        subscriber();
    }
}

/// Read-only view of a cancel flag.
#[derive(Clone)]
pub struct Checker {
    inner: Arc<Inner>,
}

impl Checker {
    /// A checker bound to a fresh controller nobody else can cancel.
    pub fn never() -> Self {
        CancelController::new().checker()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Registers a callback invoked on the cancelling thread each time the
    /// flag is set.
    pub fn on_cancelled<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.subscribers).push((id, Arc::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.inner.subscribers).retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }
}

impl std::fmt::Debug for Checker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checker")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A [`Checker`] that can also set the flag.
#[derive(Clone, Debug)]
pub struct Canceller(Checker);

impl Canceller {
    pub fn cancel(&self) {
        cancel(&self.0.inner);
    }
}

impl Deref for Canceller {
    type Target = Checker;

    fn deref(&self) -> &Checker {
        &self.0
    }
}

/// A [`Canceller`] that can also clear the flag.
#[derive(Clone, Debug)]
pub struct Resumer(Canceller);

impl Resumer {
    pub fn resume(&self) {
        self.0.0.inner.cancelled.store(false, Ordering::Release);
    }
}

impl Deref for Resumer {
    type Target = Canceller;

    fn deref(&self) -> &Canceller {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_views_share_flag() {
        let cc = CancelController::new();
        let checker = cc.checker();
        let resumer = cc.resumer();

        assert!(!checker.is_cancelled());
        resumer.cancel();
        assert!(checker.is_cancelled());
        assert!(cc.is_cancelled());
        resumer.resume();
        assert!(!checker.is_cancelled());
    }

    #[test]
    fn test_subscribers_fire_on_cancel() {
        let cc = CancelController::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let id = cc.checker().on_cancelled(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        cc.canceller().cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        cc.resume();
        cc.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        cc.checker().unsubscribe(id);
        cc.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(cc.checker().subscriber_count(), 0);
    }

    #[test]
    fn test_never_checker() {
        assert!(!Checker::never().is_cancelled());
    }
}
