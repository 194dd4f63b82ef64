//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk blocks and is the
//! synchronization point for blocks used by multiple processes: two CPUs
//! touching the same `(dev, blockno)` meet at the cache lock and then at
//! the block's sleeplock, so disk I/O is serialized per block.
//!
//! Interface:
//! * To get a locked buffer for a block, call `Bcache::read`.
//! * After changing the data, call `Buf::write` to push it to disk.
//! * Drop the `Buf` (or `unlock` it) when done; that moves the entry to
//!   the head of the LRU list.
//!
//! Buffers with live handles are never recycled; recycling picks the
//! least recently used free entry.

use core::mem::ManuallyDrop;
use core::ops::Deref;

use array_macro::array;

use crate::arena::{Arena, MruArena, MruEntry, Rc};
use crate::buf::{BufEntry, BufInner};
use crate::kernel::kernel;
use crate::lock::{SleepLockGuard, Spinlock};
use crate::param::NBUF;

pub type Bcache = Spinlock<MruArena<BufEntry, NBUF>>;

/// A reference to a cache entry, not holding its sleeplock.
pub type BufUnlocked = Rc<Bcache>;

pub const fn new_bcache() -> Bcache {
    Spinlock::new(
        "bcache",
        MruArena::new(array![_ => MruEntry::new(BufEntry::zero()); NBUF]),
    )
}

/// A locked buffer: the sleeplock is held, so the content may be read and
/// written.
pub struct Buf {
    guard: ManuallyDrop<SleepLockGuard<'static, BufInner>>,
    inner: ManuallyDrop<BufUnlocked>,
}

impl Bcache {
    /// Return an unlocked reference to the cache entry for `(dev,
    /// blockno)`, recycling the least recently used free entry on a miss.
    pub fn get(&'static self, dev: u32, blockno: u32) -> BufUnlocked {
        self.find_or_alloc(
            |buf| buf.dev == dev && buf.blockno == blockno,
            |buf| {
                buf.dev = dev;
                buf.blockno = blockno;
                buf.inner.get_mut().valid = false;
            },
        )
        .expect("bget: no buffers")
    }

    /// Return a locked buffer containing the block's data.
    pub fn read(&'static self, dev: u32, blockno: u32) -> Buf {
        let mut buf = self.get(dev, blockno).lock();
        if !buf.deref_inner().valid {
            kernel().disk().sync(&mut buf);
        }
        buf
    }
}

impl BufUnlocked {
    /// Acquire the buffer's sleeplock. Taken outside the cache lock, so a
    /// CPU waiting for a popular block does not stall the whole cache.
    pub fn lock(self) -> Buf {
        // SAFETY: the entry lives in the 'static cache and stays live
        // while this handle exists.
        let entry: &'static BufEntry = unsafe { &*Self::entry_ptr(&self) };
        Buf {
            guard: ManuallyDrop::new(entry.inner.lock()),
            inner: ManuallyDrop::new(self),
        }
    }

    fn entry_ptr(this: &Self) -> *const BufEntry {
        kernel().bcache().data_raw(this.index())
    }
}

impl Buf {
    pub fn dev(&self) -> u32 {
        self.inner.dev
    }

    pub fn blockno(&self) -> u32 {
        self.inner.blockno
    }

    pub fn deref_inner(&self) -> &BufInner {
        &self.guard
    }

    pub fn deref_inner_mut(&mut self) -> &mut BufInner {
        &mut self.guard
    }

    /// Write the buffer's contents through to disk.
    pub fn write(&mut self) {
        self.deref_inner_mut().dirty = true;
        kernel().disk().sync(self);
    }

    /// Release the sleeplock, keeping the cache reference.
    pub fn unlock(mut self) -> BufUnlocked {
        // SAFETY: self is forgotten below and its fields are never touched
        // again.
        let inner = unsafe {
            ManuallyDrop::drop(&mut self.guard);
            ManuallyDrop::take(&mut self.inner)
        };
        core::mem::forget(self);
        inner
    }
}

impl Deref for Buf {
    type Target = BufEntry;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // Release the sleeplock before the cache reference.
        // SAFETY: dropped exactly once, here.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            ManuallyDrop::drop(&mut self.inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_util::{fresh_dev, serial};
    use crate::param::BSIZE;
    use std::vec;

    fn install_image(nblocks: usize) {
        kernel().disk().set_image(vec![0u8; nblocks * BSIZE].leak());
    }

    #[test]
    fn read_write_roundtrip() {
        let _serial = serial();
        install_image(64);
        let dev = fresh_dev();
        let bcache = kernel().bcache();

        let mut b = bcache.read(dev, 7);
        assert!(b.deref_inner().valid);
        b.deref_inner_mut().data.bytes_mut()[0..4].copy_from_slice(b"pv6!");
        b.write();
        drop(b);

        let b = bcache.read(dev, 7);
        assert_eq!(&b.deref_inner().data.bytes()[0..4], b"pv6!");
        drop(b);
    }

    #[test]
    fn single_entry_per_block() {
        let _serial = serial();
        install_image(64);
        let dev = fresh_dev();
        let bcache = kernel().bcache();

        let a = bcache.get(dev, 3);
        let b = bcache.get(dev, 3);
        assert_eq!(a.index(), b.index());
        let c = bcache.get(dev, 4);
        assert_ne!(a.index(), c.index());
        drop((a, b, c));
    }

    #[test]
    fn referenced_buffers_survive_pressure() {
        let _serial = serial();
        install_image(4096);
        let dev = fresh_dev();
        let bcache = kernel().bcache();

        let held = bcache.get(dev, 100);
        let idx = held.index();
        // Touch far more blocks than the cache holds.
        for bno in 0..(NBUF as u32 * 3) {
            drop(bcache.read(dev, bno));
        }
        // The held entry kept its identity.
        assert_eq!(held.dev, dev);
        assert_eq!(held.blockno, 100);
        assert_eq!(held.index(), idx);
        drop(held);
    }

    #[test]
    fn write_through_leaves_buffers_clean() {
        let _serial = serial();
        install_image(64);
        let dev = fresh_dev();
        let bcache = kernel().bcache();
        let mut b = bcache.read(dev, 9);
        b.deref_inner_mut().data.bytes_mut()[0] = 0xAB;
        b.write();
        assert!(!b.deref_inner().dirty);
        assert!(b.deref_inner().valid);
        drop(b);
    }
}
