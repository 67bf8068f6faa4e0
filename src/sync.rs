//! Counting semaphore used between the pipeline threads.
//!
//! The realtime thread only ever signals; waiting happens on the decode and
//! collector threads, always with a bounded timeout as a lost-wakeup
//! watchdog. Each loop iteration re-checks its own invariants, so a timed
//! out wait is indistinguishable from a spurious one.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A counting semaphore built from a mutex and a condvar.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Add one permit and wake a waiter.
    ///
    /// Never blocks beyond the internal mutex, which is only ever held for
    /// a counter update.
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        drop(count);
        self.cv.notify_one();
    }

    /// Take a permit, waiting up to `timeout` for one to appear.
    ///
    /// Returns `true` if a permit was consumed, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.count.lock().unwrap();
        let (mut count, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |count| *count == 0)
            .unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
