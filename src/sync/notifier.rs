use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::lock;

/// A latching wake-up signal.
///
/// A notification sent while nobody is waiting is remembered, and the next
/// wait returns immediately and consumes it.
#[derive(Debug, Default)]
pub struct ThreadNotifier {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl ThreadNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_one(&self) {
        *lock(&self.ready) = true;
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        *lock(&self.ready) = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut ready = self
            .cond
            .wait_while(lock(&self.ready), |ready| !*ready)
            .unwrap_or_else(PoisonError::into_inner);
        *ready = false;
    }

    /// Waits at most `timeout`. Returns `false` if no notification arrived in
    /// time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (mut ready, _) = self
            .cond
            .wait_timeout_while(lock(&self.ready), timeout, |ready| !*ready)
            .unwrap_or_else(PoisonError::into_inner);

        if *ready {
            *ready = false;
            true
        } else {
            false
        }
    }

    /// Like [`wait_timeout`](Self::wait_timeout) with an absolute deadline.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return self.wait_timeout(Duration::ZERO);
        }
        self.wait_timeout(deadline - now)
    }
}
