//! Sleep channels.

use crate::kernel::kernel;
use crate::lock::{Guard, RawLock};

/// A wait channel: processes sleep on its address and are woken by name.
pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// distinct channels could share an address and wake each other's
    /// sleepers.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically release `lk` and sleep on this channel; reacquires `lk`
    /// when awakened.
    pub fn sleep<R: RawLock, T>(&self, lk: &mut Guard<'_, R, T>) {
        kernel().procs.sleep(self as *const WaitChannel as usize, lk);
    }

    /// Wake all processes sleeping on this channel. Must be called
    /// without the process-table lock.
    pub fn wakeup(&self) {
        kernel().procs.wakeup(self as *const WaitChannel as usize);
    }
}
