//! Data protected by somebody else's lock.

use core::cell::UnsafeCell;
use core::marker::PhantomData;

use super::{Guard, Lock, RawLock};

/// `RemoteLock<R, U, T>` is like `Lock<R, T>`, but has no raw lock of its
/// own: its data is protected by a shared `Lock<R, U>` elsewhere, and
/// access requires that lock's guard. One raw lock can protect a `Lock`
/// and many connected `RemoteLock` fragments — this is how every
/// process's scheduler-visible state sits under the one process-table
/// spinlock.
#[repr(transparent)]
pub struct RemoteLock<R: RawLock, U, T> {
    data: UnsafeCell<T>,
    _marker: PhantomData<*const Lock<R, U>>,
}

unsafe impl<R: RawLock, U: Send, T: Send> Sync for RemoteLock<R, U, T> {}

impl<R: RawLock, U, T> RemoteLock<R, U, T> {
    /// Returns a `RemoteLock` protecting `data`.
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            _marker: PhantomData,
        }
    }

    /// Returns a raw pointer to the inner data. The caller must ensure the
    /// access does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data.
    ///
    /// # Safety
    ///
    /// `_guard` must belong to the `Lock` this `RemoteLock` borrows.
    pub unsafe fn get_mut_unchecked<'t>(&'t self, _guard: &'t mut Guard<'_, R, U>) -> &'t mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Returns a shared reference to the inner data.
    ///
    /// # Safety
    ///
    /// `_guard` must belong to the `Lock` this `RemoteLock` borrows.
    pub unsafe fn get_unchecked<'t>(&'t self, _guard: &'t Guard<'_, R, U>) -> &'t T {
        unsafe { &*self.data.get() }
    }
}
