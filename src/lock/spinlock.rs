//! Spin locks.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Guard, Lock, RawLock};
use crate::arch;
use crate::cpu::{Cpu, CPUS};

/// Mutual exclusion lock that busy-waits (spins).
pub struct RawSpinlock {
    /// Name of the lock, for panics.
    name: &'static str,

    /// If held, the owning `Cpu`; otherwise null.
    locked: AtomicPtr<Cpu>,

    /// Call stack of the acquirer, for debugging. Written while holding
    /// the lock; `pcs[0]` is cleared on release.
    pcs: UnsafeCell<[usize; 10]>,
}

/// Locks that busy-wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

// SAFETY: pcs is only written by the lock holder.
unsafe impl Sync for RawSpinlock {}

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
            pcs: UnsafeCell::new([0; 10]),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock, spinning until it is free. Disables interrupts
    /// first (nested-cli) so an interrupt handler taking the same lock
    /// cannot deadlock against us.
    ///
    /// The `Acquire` exchange pairs with the `Release` store in
    /// `release()`: stores made inside one critical section are visible to
    /// loads in the next, and neither compiler nor CPU may move accesses
    /// across the lock boundary.
    fn acquire(&self) {
        CPUS.push_off();
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                CPUS.current_raw(),
                Ordering::Acquire,
                // Failure does not enter the critical section, so Relaxed.
                Ordering::Relaxed,
            )
            .is_err()
        {
            core::hint::spin_loop();
        }

        // SAFETY: we hold the lock.
        unsafe { *self.pcs.get() = arch::caller_pcs() };
    }

    /// Releases the lock, restoring interrupts at the outermost release on
    /// this CPU.
    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);

        // SAFETY: we still hold the lock.
        unsafe { (*self.pcs.get())[0] = 0 };
        self.locked.store(ptr::null_mut(), Ordering::Release);
        CPUS.pop_off();
    }

    /// Whether this CPU holds the lock. Interrupts must be off.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == CPUS.current_raw()
    }
}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` named `name` protecting `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSpinlock::new(name), data)
    }
}
