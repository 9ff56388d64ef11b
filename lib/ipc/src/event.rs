//! Auto-reset completion event.

use parking_lot::{Condvar, Mutex};

/// A single-waiter event that clears itself when a wait consumes it.
///
/// A signal raised before anyone waits is remembered, so a reply that
/// arrives before `wait` is called is never lost.
#[derive(Debug, Default)]
pub struct Event {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears any pending signal.
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    /// Raises the event, waking one waiter.
    pub fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_one();
    }

    /// Blocks until the event is raised, then clears it.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.cond.wait(&mut signalled);
        }
        *signalled = false;
    }

    /// Returns true if a signal is pending.
    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }
}
