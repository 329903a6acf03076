//! Low-level synchronisation helpers.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
///
/// Root task completion is signalled through one of these: the worker that
/// finishes a root task releases a permit, and the thread blocked in the
/// sync-wait surface acquires it.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    permits: Mutex<u32>,
    condvar: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with no available permits.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Blocks the calling thread until a permit is available, then takes it.
    pub(crate) fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.condvar.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Makes one permit available and wakes a waiter.
    pub(crate) fn release(&self) {
        {
            let mut permits = self.permits.lock();
            *permits += 1;
        }
        self.condvar.notify_one();
    }
}
