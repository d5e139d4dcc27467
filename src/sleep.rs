//! Idle-worker parking.
//!
//! An epoch-stamped eventcount: a worker snapshots the epoch, makes one full
//! rotation over the registered groups, and parks only if the epoch has not
//! moved. A publisher bumps the epoch before notifying, which closes the
//! window where work arrives between the worker's last look and its wait.
//! Spurious wakeups are tolerated; the worker loop simply rescans.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

pub(crate) struct Sleep {
    lock: Mutex<()>,
    condvar: Condvar,
    epoch: AtomicUsize,
}

/// Snapshot of the wake epoch, taken before an idle scan.
#[derive(Copy, Clone)]
pub(crate) struct IdleToken(usize);

impl Sleep {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            epoch: AtomicUsize::new(0),
        }
    }

    /// Call before scanning for work; pass the token to [`Sleep::sleep`] if
    /// the scan comes up empty.
    pub(crate) fn prepare(&self) -> IdleToken {
        IdleToken(self.epoch.load(Ordering::Acquire))
    }

    /// Parks until a wake arrives. Returns immediately when the epoch moved
    /// since `token` was taken, meaning some publisher raced the scan.
    pub(crate) fn sleep(&self, token: IdleToken) {
        let mut guard = self.lock.lock();
        if self.epoch.load(Ordering::Acquire) != token.0 {
            return;
        }
        self.condvar.wait(&mut guard);
    }

    /// Wakes one parked worker; called once per newly published item.
    pub(crate) fn wake_one(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let _guard = self.lock.lock();
        drop(_guard);
        self.condvar.notify_one();
    }

    /// Wakes every parked worker; used on stop and group-list changes.
    pub(crate) fn wake_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let _guard = self.lock.lock();
        drop(_guard);
        self.condvar.notify_all();
    }
}
