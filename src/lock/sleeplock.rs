//! Sleeping locks: long-term locks that yield the CPU while contended.
//! May be held across operations that sleep, unlike a spinlock.

use super::{Lock, RawLock, Sleepablelock};
use crate::proc::{self, Pid};

/// Process holding the lock, or -1 when unlocked.
pub struct RawSleeplock {
    locked: Sleepablelock<Pid>,
}

/// Locks that sleep instead of busy-waiting.
pub type SleepLock<T> = Lock<RawSleeplock, T>;
pub type SleepLockGuard<'s, T> = super::Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: Sleepablelock::new(name, -1),
        }
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard != -1 {
            guard.sleep();
        }
        *guard = proc::current_pid();
    }

    fn release(&self) {
        let mut guard = self.locked.lock();
        *guard = -1;
        guard.wakeup();
    }

    fn holding(&self) -> bool {
        let guard = self.locked.lock();
        *guard == proc::current_pid()
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` named `name` protecting `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleeplock::new(name), data)
    }
}
