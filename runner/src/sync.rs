pub mod signal;

use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Shared flag telling the control loop to stop, observed at its sleep points
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (cancelled, condvar) = &*self.inner;

        *cancelled.lock() = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// sleep for `duration` unless cancelled earlier, returns whether cancellation happened
    pub fn sleep(&self, duration: Duration) -> bool {
        let (cancelled, condvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut guard = cancelled.lock();

        while !*guard {
            if condvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }

        *guard
    }
}
