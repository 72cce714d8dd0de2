//! Capacity-released notification
//!
//! An allocator serializes its native calls on one of these and blocked
//! allocations wait on it. Compute partitions handed out by the allocator keep
//! a reference, so releasing one wakes waiters however it is released.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Default)]
pub struct ReleaseSignal {
    lock: Mutex<()>,
    released: Condvar,
}

impl ReleaseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock that native creates and releases run under
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Sleep until the next release
    pub fn wait(&self, guard: &mut MutexGuard<'_, ()>) {
        self.released.wait(guard);
    }

    /// Sleep until the next release or `deadline`; true if the deadline passed
    pub fn wait_until(&self, guard: &mut MutexGuard<'_, ()>, deadline: Instant) -> bool {
        self.released.wait_until(guard, deadline).timed_out()
    }

    /// Wake every waiter; the caller must hold the lock
    pub fn notify(&self) {
        self.released.notify_all();
    }
}

impl std::fmt::Debug for ReleaseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReleaseSignal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wait_until_times_out() {
        let signal = ReleaseSignal::new();
        let mut guard = signal.lock();
        assert!(signal.wait_until(&mut guard, Instant::now() + Duration::from_millis(20)));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let signal = ReleaseSignal::new();
        std::thread::scope(|s| {
            let mut guard = signal.lock();
            s.spawn(|| {
                let _guard = signal.lock();
                signal.notify();
            });
            let timed_out =
                signal.wait_until(&mut guard, Instant::now() + Duration::from_secs(10));
            assert!(!timed_out);
        });
    }
}
