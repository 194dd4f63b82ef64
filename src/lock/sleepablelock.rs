//! Spin locks whose guard can block.
//!
//! A `Sleepablelock` is a spinlock bundled with a wait channel, so code
//! holding the guard can `sleep()` until another holder calls `wakeup()`.
//! The ticks counter, console input and the sleep-lock internals are built
//! on this.

use super::{Guard, Lock, RawLock, RawSpinlock};
use crate::proc::WaitChannel;

pub struct RawSleepable {
    lock: RawSpinlock,
    /// Waiters blocked while some other guard holds the lock's data in an
    /// unusable state.
    waitchannel: WaitChannel,
}

/// Locks whose guards may block on the bundled channel.
pub type Sleepablelock<T> = Lock<RawSleepable, T>;
pub type SleepablelockGuard<'s, T> = Guard<'s, RawSleepable, T>;

impl RawSleepable {
    pub const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepable {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }

    fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Sleepablelock<T> {
    /// Returns a new `Sleepablelock` named `name` protecting `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleepable::new(name), data)
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically release the lock and sleep on the bundled channel;
    /// reacquires before returning.
    pub fn sleep(&mut self) {
        // The channel reference outlives the guard borrow: it comes from
        // the lock itself.
        let chan: &WaitChannel = &self.lock_ref().raw().waitchannel;
        chan.sleep(self);
    }

    /// Wake every process sleeping on the bundled channel.
    pub fn wakeup(&self) {
        self.lock_ref().raw().waitchannel.wakeup();
    }
}
