//! Open files.

use core::cell::UnsafeCell;
use core::mem;

use array_macro::array;

use crate::arena::{Arena, ArenaObject, ArrayArena, Rc, RcEntry};
use crate::fs::{RcInode, Stat};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::param::{NDEV, NFILE};
use crate::pipe::AllocatedPipe;

/// Largest slice a single inode write pushes at once, to bound how long
/// one call keeps the inode lock.
const WRITE_BURST: usize = 4096;

pub enum FileType {
    None,
    Pipe {
        pipe: AllocatedPipe,
    },
    Inode {
        ip: RcInode,
        /// Byte offset of the next read or write. Touched only while the
        /// inode lock is held, which serializes offset updates between
        /// the handles sharing this file.
        off: UnsafeCell<u32>,
    },
}

/// An open file. Shared (and reference-counted) between the descriptors
/// produced by dup and fork.
pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

// off is guarded by the inode sleeplock; everything else is immutable
// after allocation.
unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    const fn none() -> Self {
        Self {
            typ: FileType::None,
            readable: false,
            writable: false,
        }
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Metadata of an inode-backed file.
    pub fn stat(&self) -> Result<Stat, ()> {
        match &self.typ {
            FileType::Inode { ip, .. } => {
                let guard = ip.lock();
                Ok(guard.stati())
            }
            _ => Err(()),
        }
    }

    /// Read from the file into `dst`, advancing the offset by the number
    /// of bytes read.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }
        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(dst),
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock();
                // SAFETY: off is accessed only under the inode lock.
                let cur = unsafe { *off.get() };
                let r = guard.readi(dst, cur)?;
                unsafe { *off.get() = cur + r as u32 };
                Ok(r)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write `src` to the file, advancing the offset.
    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }
        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(src),
            FileType::Inode { ip, off } => {
                // A few blocks at a time, so one large write does not
                // monopolize the inode.
                let mut written = 0;
                while written < src.len() {
                    let chunk = &src[written..src.len().min(written + WRITE_BURST)];
                    let mut guard = ip.lock();
                    // SAFETY: off is accessed only under the inode lock.
                    let cur = unsafe { *off.get() };
                    let r = guard.writei(chunk, cur)?;
                    unsafe { *off.get() = cur + r as u32 };
                    drop(guard);
                    if r != chunk.len() {
                        panic!("short File::write");
                    }
                    written += r;
                }
                Ok(written)
            }
            FileType::None => panic!("File::write"),
        }
    }
}

impl ArenaObject for File {
    fn finalize<A: Arena<Data = Self>>(&mut self, guard: &mut A::Guard<'_>) {
        let typ = mem::replace(&mut self.typ, FileType::None);
        let writable = self.writable;
        // Closing the underside takes other locks (the pipe lock, the
        // inode cache); do it without the file-table lock.
        unsafe {
            A::reacquire_after(guard, || match typ {
                FileType::Pipe { pipe } => pipe.close(writable),
                typ => drop(typ),
            })
        };
    }
}

/// The open-file table.
pub type FileTable = Spinlock<ArrayArena<File, NFILE>>;

/// A handle on an open file; the table entry is freed when the last
/// handle closes.
pub type RcFile = Rc<FileTable>;

pub const fn new_ftable() -> FileTable {
    Spinlock::new(
        "ftable",
        ArrayArena::new(array![_ => RcEntry::new(File::none()); NFILE]),
    )
}

impl FileTable {
    /// Allocate a file object.
    pub fn alloc_file(
        &'static self,
        typ: FileType,
        readable: bool,
        writable: bool,
    ) -> Result<RcFile, ()> {
        self.alloc(|f| {
            *f = File {
                typ,
                readable,
                writable,
            }
        })
        .ok_or(())
    }
}

/// Map major device number to device functions.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(&mut [u8]) -> i32>,
    pub write: Option<fn(&[u8]) -> i32>,
}

impl Devsw {
    pub const fn none() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

/// Dispatch a device-inode read to the driver registered for `major`.
pub fn device_read(major: u16, dst: &mut [u8]) -> Result<usize, ()> {
    let read = kernel()
        .devsw
        .lock()
        .get(major as usize)
        .and_then(|d| d.read)
        .ok_or(())?;
    let r = read(dst);
    if r < 0 {
        Err(())
    } else {
        Ok(r as usize)
    }
}

/// Dispatch a device-inode write to the driver registered for `major`.
pub fn device_write(major: u16, src: &[u8]) -> Result<usize, ()> {
    let write = kernel()
        .devsw
        .lock()
        .get(major as usize)
        .and_then(|d| d.write)
        .ok_or(())?;
    let r = write(src);
    if r < 0 {
        Err(())
    } else {
        Ok(r as usize)
    }
}
