use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// A set of named bits that tasks can raise, clear and wait on with a timeout.
#[derive(Debug, Default)]
pub struct EventBits {
    bits: Mutex<u32>,
    changed: Condvar,
}

impl EventBits {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        self.bits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, mask: u32) {
        let mut bits = self.lock();
        *bits |= mask;
        self.changed.notify_all();
    }

    pub fn clear(&self, mask: u32) {
        *self.lock() &= !mask;
    }

    pub fn get(&self) -> u32 {
        *self.lock()
    }

    /// Blocks until any bit in `mask` is set or `timeout` elapses and returns
    /// the bits observed on exit. With `clear_on_exit` the matched bits are
    /// cleared before returning.
    pub fn wait_any(&self, mask: u32, clear_on_exit: bool, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut bits = self.lock();

        loop {
            if *bits & mask != 0 {
                let observed = *bits;
                if clear_on_exit {
                    *bits &= !mask;
                }
                return observed;
            }

            let now = Instant::now();
            if now >= deadline {
                return *bits;
            }

            bits = match self.changed.wait_timeout(bits, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
