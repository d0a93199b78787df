/*!
 * Binary Event
 *
 * One-shot signal/wait built on parking_lot::Condvar. A signal that
 * arrives before the wait is not lost.
 */

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Signal/wait event with a sticky flag
#[derive(Default)]
pub struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_all();
    }

    /// Block until signaled or `timeout` elapses
    ///
    /// Returns `true` if the event was signaled. A timeout too large to
    /// express as a deadline waits without one.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }

    /// Block until signaled
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }
}
