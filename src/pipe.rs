//! Pipes: a bounded byte ring with one blocking reader side and one
//! blocking writer side, living in a single allocated page.

use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::arch::mmu::PGSIZE;
use crate::file::{FileType, RcFile};
use crate::kernel::{kernel, Kernel};
use crate::lock::Spinlock;
use crate::page::Page;
use crate::param::PIPESIZE;
use crate::proc::{self, WaitChannel};

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,

    /// Waiters for unread bytes in the ring.
    read_waitchannel: WaitChannel,

    /// Waiters for room in the ring.
    write_waitchannel: WaitChannel,
}

const_assert!(core::mem::size_of::<Pipe>() <= PGSIZE);

enum PipeError {
    WaitForIo,
    InvalidStatus,
}

impl PipeInner {
    /// Copy bytes in until the ring fills; `Ok(i)` bytes were taken.
    /// Fails if the read side has closed or the process is being killed.
    fn try_write(&mut self, src: &[u8]) -> Result<usize, PipeError> {
        if !self.readopen || proc::current_killed() {
            return Err(PipeError::InvalidStatus);
        }
        for (i, &byte) in src.iter().enumerate() {
            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                return Ok(i);
            }
            self.data[self.nwrite as usize % PIPESIZE] = byte;
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(src.len())
    }

    /// Copy out up to `dst.len()` bytes. An empty ring means EOF if the
    /// write side is gone, otherwise the caller should wait.
    fn try_read(&mut self, dst: &mut [u8]) -> Result<usize, PipeError> {
        if self.nread == self.nwrite && self.writeopen {
            if proc::current_killed() {
                return Err(PipeError::InvalidStatus);
            }
            return Err(PipeError::WaitForIo);
        }
        for (i, slot) in dst.iter_mut().enumerate() {
            if self.nread == self.nwrite {
                return Ok(i);
            }
            *slot = self.data[self.nread as usize % PIPESIZE];
            self.nread = self.nread.wrapping_add(1);
        }
        Ok(dst.len())
    }
}

impl Pipe {
    /// Read up to `dst.len()` bytes, sleeping while the ring is empty and
    /// the write side is open. Returns 0 at EOF.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(dst) {
                Ok(r) => {
                    self.write_waitchannel.wakeup();
                    return Ok(r);
                }
                Err(PipeError::WaitForIo) => self.read_waitchannel.sleep(&mut inner),
                Err(_) => return Err(()),
            }
        }
    }

    /// Write all of `src`, waking readers and sleeping whenever the ring
    /// fills. Fails mid-stream if the read side closes.
    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(&src[written..]) {
                Ok(r) => {
                    written += r;
                    self.read_waitchannel.wakeup();
                    if written < src.len() {
                        self.write_waitchannel.sleep(&mut inner);
                    } else {
                        return Ok(written);
                    }
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Close one side, waking the other. True when both sides are gone
    /// and the pipe should be freed.
    fn close_half(&self, writable: bool) -> bool {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup();
        }
        !inner.readopen && !inner.writeopen
    }
}

/// One endpoint's reference to a page-allocated `Pipe`.
///
/// # Safety
///
/// `ptr` refers to a `Pipe` in a page from `Kmem`. There is exactly one
/// read-only and one write-only `AllocatedPipe` per `Pipe`; the
/// `readopen`/`writeopen` flags say which are still open, so the page is
/// freed only when the second side closes.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

unsafe impl Send for AllocatedPipe {}
unsafe impl Sync for AllocatedPipe {}

impl core::ops::Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Self::Target {
        // SAFETY: `ptr` refers to a live `Pipe`.
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Close this endpoint; reclaims the page when the other side is
    /// already gone.
    pub fn close(self, writable: bool) {
        if self.close_half(writable) {
            // SAFETY: both sides are closed, so nothing refers to the
            // pipe, and the page came from Kmem.
            kernel()
                .kmem
                .free(unsafe { Page::from_usize(self.ptr.as_ptr() as usize) });
        }
    }
}

impl Kernel {
    /// Create a pipe and its two file endpoints: read side first.
    pub fn allocate_pipe(&'static self) -> Result<(RcFile, RcFile), ()> {
        let page = self.kmem.alloc().ok_or(())?;
        let page = scopeguard::guard(page, |page| self.kmem.free(page));

        let ptr = NonNull::new(page.addr() as *mut Pipe).unwrap();
        // SAFETY: the page is owned, aligned, and large enough.
        unsafe {
            ptr.as_ptr().write(Pipe {
                inner: Spinlock::new(
                    "pipe",
                    PipeInner {
                        data: [0; PIPESIZE],
                        nread: 0,
                        nwrite: 0,
                        readopen: true,
                        writeopen: true,
                    },
                ),
                read_waitchannel: WaitChannel::new(),
                write_waitchannel: WaitChannel::new(),
            })
        };

        let f0 = self
            .ftable()
            .alloc_file(FileType::Pipe { pipe: AllocatedPipe { ptr } }, true, false)?;
        let f1 = self
            .ftable()
            .alloc_file(FileType::Pipe { pipe: AllocatedPipe { ptr } }, false, true)?;

        // The files own the page now.
        core::mem::forget(scopeguard::ScopeGuard::into_inner(page));
        Ok((f0, f1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_util::{ensure_kmem, serial};

    #[test]
    fn ping() {
        let _serial = serial();
        ensure_kmem();
        let (r, w) = kernel().allocate_pipe().unwrap();

        assert_eq!(w.write(b"abc"), Ok(3));
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf), Ok(3));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn eof_after_writer_close() {
        let _serial = serial();
        ensure_kmem();
        let (r, w) = kernel().allocate_pipe().unwrap();

        assert_eq!(w.write(b"xyz"), Ok(3));
        drop(w);

        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf), Ok(3));
        assert_eq!(&buf[..3], b"xyz");
        // Ring empty, write side closed: EOF.
        assert_eq!(r.read(&mut buf), Ok(0));
    }

    #[test]
    fn write_fails_after_reader_close() {
        let _serial = serial();
        ensure_kmem();
        let (r, w) = kernel().allocate_pipe().unwrap();
        drop(r);
        assert_eq!(w.write(b"doomed"), Err(()));
    }

    #[test]
    fn partial_reads_drain_in_order() {
        let _serial = serial();
        ensure_kmem();
        let (r, w) = kernel().allocate_pipe().unwrap();

        assert_eq!(w.write(b"hello world"), Ok(11));
        let mut buf = [0u8; 5];
        assert_eq!(r.read(&mut buf), Ok(5));
        assert_eq!(&buf, b"hello");
        assert_eq!(r.read(&mut buf), Ok(5));
        assert_eq!(&buf, b" worl");
        assert_eq!(r.read(&mut buf), Ok(1));
        assert_eq!(&buf[..1], b"d");
    }

    #[test]
    fn full_ring_takes_exactly_capacity() {
        let _serial = serial();
        ensure_kmem();
        let (r, w) = kernel().allocate_pipe().unwrap();

        let data = [0x5Au8; PIPESIZE];
        assert_eq!(w.write(&data), Ok(PIPESIZE));

        let mut buf = [0u8; PIPESIZE];
        assert_eq!(r.read(&mut buf), Ok(PIPESIZE));
        assert!(buf.iter().all(|&b| b == 0x5A));
    }
}
