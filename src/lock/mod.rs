//! The lock module. Contains types that provide mutual exclusion.
//!
//! A lock is a raw lock (`RawLock`) plus the data it protects
//! (`Lock<R, T>`). Acquiring returns a `Guard` whose lifetime bounds every
//! access to the data; dropping the guard releases the lock.
//!
//! A `RemoteLock` owns data but no raw lock of its own: it borrows another
//! `Lock`'s raw lock, so one spinlock can protect many fragments. The
//! process table uses this to keep every process's scheduler-visible state
//! under the single table lock.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod remotelock;
mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use remotelock::RemoteLock;
pub use sleepablelock::{RawSleepable, Sleepablelock, SleepablelockGuard};
pub use sleeplock::{RawSleeplock, SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);
    /// Releases the lock.
    fn release(&self);
    /// Whether the current CPU (or process) holds the lock.
    fn holding(&self) -> bool;
}

/// Locks that provide mutual exclusion and own their `RawLock`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

/// Guards that guarantee exclusive access to the lock's inner data.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    _marker: PhantomData<*const ()>,
}

// Do not implement Send; a lock must be released by the CPU that acquired it.
unsafe impl<R: RawLock + Sync, T: Sync> Sync for Guard<'_, R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn from_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns its guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> &R {
        &self.lock
    }

    /// Returns a raw pointer to the inner data without locking. The caller
    /// must ensure that the access does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data. Safe because an
    /// exclusive reference to the lock means nobody else can hold it.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: we have a mutable reference to the lock.
        unsafe { &mut *self.data.get() }
    }

    /// Unlock without a guard.
    ///
    /// # Safety
    ///
    /// Use this only when the lock was acquired and its guard forgotten.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    /// Temporarily releases the lock and calls `f`. After `f` returns,
    /// reacquires the lock and returns the result of the call.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }

    pub fn lock_ref(&self) -> &'s Lock<R, T> {
        self.lock
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}
