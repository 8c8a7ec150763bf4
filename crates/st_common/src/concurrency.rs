//! Blocking synchronization primitives missing from std.

use std::sync::Condvar;
use std::time::{Duration, Instant};

use crate::prelude::*;

/// A counting semaphore built on a [`Mutex`] and a [`Condvar`].
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Constructs a semaphore holding `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is available and takes it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Takes a permit if one is available without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Waits up to `timeout` until `count` permits are available at once and takes them all.
    /// Takes nothing on timeout.
    pub fn try_acquire_many_timeout(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap();
        while *permits < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            permits = self.available.wait_timeout(permits, deadline - now).unwrap().0;
        }
        *permits -= count;
        true
    }

    /// Adds `count` permits, waking up waiters.
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut permits = self.permits.lock().unwrap();
        *permits += count;
        drop(permits);
        // Waiters for several permits share the condvar with single-permit waiters, so wake everyone.
        self.available.notify_all();
    }

    /// Takes all currently available permits, returning how many were taken.
    pub fn drain_permits(&self) -> usize {
        std::mem::take(&mut *self.permits.lock().unwrap())
    }

    /// The number of currently available permits.
    pub fn available_permits(&self) -> usize {
        *self.permits.lock().unwrap()
    }
}
