//! Cached disk blocks.

use crate::arena::{Arena, ArenaObject};
use crate::lock::SleepLock;
use crate::param::BSIZE;

/// The bytes of one disk block. Kept 8-aligned so on-disk structures can
/// be decoded in place.
#[repr(C, align(8))]
pub struct BufData {
    bytes: [u8; BSIZE],
}

impl BufData {
    pub const fn zero() -> Self {
        Self { bytes: [0; BSIZE] }
    }

    pub fn bytes(&self) -> &[u8; BSIZE] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.bytes
    }

    /// The `i`-th little-endian u32 of the block. Indirect blocks are
    /// arrays of these.
    pub fn u32_at(&self, i: usize) -> u32 {
        let off = i * 4;
        u32::from_le_bytes([
            self.bytes[off],
            self.bytes[off + 1],
            self.bytes[off + 2],
            self.bytes[off + 3],
        ])
    }

    pub fn set_u32_at(&mut self, i: usize, value: u32) {
        let off = i * 4;
        self.bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Buffer content, protected by the per-buffer sleeplock.
pub struct BufInner {
    /// Has the data been read from disk?
    pub valid: bool,

    /// Does the data need to be written to disk?
    pub dirty: bool,

    pub data: BufData,
}

impl BufInner {
    const fn zero() -> Self {
        Self {
            valid: false,
            dirty: false,
            data: BufData::zero(),
        }
    }
}

/// One buffer-cache slot. `dev`/`blockno` are the identity fields: they
/// are read and written only under the cache lock (in the arena's find
/// and init closures). Everything else sits behind the sleeplock.
pub struct BufEntry {
    pub dev: u32,
    pub blockno: u32,
    pub inner: SleepLock<BufInner>,
}

impl BufEntry {
    pub const fn zero() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            inner: SleepLock::new("buffer", BufInner::zero()),
        }
    }
}

impl ArenaObject for BufEntry {
    fn finalize<A: Arena<Data = Self>>(&mut self, _guard: &mut A::Guard<'_>) {
        // Buffers are written through synchronously, so a released buffer
        // never carries dirty data; there is nothing to flush here.
    }
}
