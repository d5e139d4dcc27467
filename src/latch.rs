//! Blocking latches for lifecycle edges.
//!
//! These sit on cold paths only: waiting for workers to prime, waiting for
//! them to stop, and bounding shutdown with a deadline. Hot-path completion
//! signalling lives with the group's counters instead.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A one-shot latch: starts unset, `set` exactly once, any number of waiters.
pub(crate) struct LockLatch {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl LockLatch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut set = self.state.lock();
        *set = true;
        self.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut set = self.state.lock();
        while !*set {
            self.condvar.wait(&mut set);
        }
    }
}

/// Counts down to zero; waiters release when the count is exhausted.
///
/// Used to observe worker-thread exit during `stop`, where the wait is
/// bounded by the configured shutdown deadline.
pub(crate) struct CountLatch {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl CountLatch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn count_down(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "count latch decremented past zero");
        *count -= 1;
        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    /// Waits for the count to reach zero, giving up after `timeout`.
    /// Returns true if the count reached zero in time.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.condvar.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_latch_releases_waiter() {
        let latch = Arc::new(LockLatch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        latch.set();
        waiter.join().unwrap();
    }

    #[test]
    fn count_latch_times_out_until_exhausted() {
        let latch = CountLatch::new(2);
        latch.count_down();
        assert!(!latch.wait_for(Duration::from_millis(10)));
        latch.count_down();
        assert!(latch.wait_for(Duration::from_millis(10)));
    }
}
