use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// One-shot rendezvous gate. `open` is idempotent: the first call releases
/// every current and future waiter, later calls are no-ops.
pub struct Gate {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Gate {
            opened: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Open the gate. Returns true only for the call that actually opened
    /// it.
    pub fn open(&self) -> bool {
        let mut opened = self.opened.lock().unwrap();
        if *opened {
            return false;
        }
        *opened = true;
        self.cond.notify_all();
        true
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock().unwrap()
    }

    /// Block until the gate opens.
    pub fn wait(&self) {
        let mut opened = self.opened.lock().unwrap();
        while !*opened {
            opened = self.cond.wait(opened).unwrap();
        }
    }

    /// Block until the gate opens or the timeout elapses. Returns whether
    /// the gate is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut opened = self.opened.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !*opened {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(opened, deadline - now).unwrap();
            opened = guard;
            if result.timed_out() && !*opened {
                return false;
            }
        }
        true
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
