//! Directories.
//!
//! A directory is a file holding a sequence of variable-length records:
//! an 8-byte header naming the inode, the record length and the name
//! length, followed by the name itself, padded to 4-byte alignment. A
//! `rec_len` larger than the record's natural size marks free space in
//! the slot's tail; lookups step by `rec_len` and skip records whose
//! inode is zero.

use core::mem;

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes};

use super::{InodeGuard, InodeType, RcInode, NAME_MAX};
use crate::kernel::kernel;
use crate::param::BSIZE;

/// Directory-entry file type: not recorded.
pub const FT_UNKNOWN: u8 = 0;

/// The fixed head of a directory record; `name_len` name bytes follow.
#[derive(Copy, Clone, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct DirentHeader {
    /// Inode number; 0 marks a dead record.
    pub inode: u32,
    /// Distance to the next record.
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

pub const DIRENT_HEADER_SIZE: usize = mem::size_of::<DirentHeader>();

/// Record size for a name: header plus name, 4-byte aligned.
pub const fn dirent_size(name_len: u8) -> u16 {
    ((DIRENT_HEADER_SIZE + name_len as usize + 3) & !3) as u16
}

/// One path component: 1..=NAME_MAX bytes, no NUL, no slash.
#[repr(transparent)]
pub struct FileName {
    inner: [u8],
}

impl FileName {
    pub fn new(bytes: &[u8]) -> Result<&Self, ()> {
        if bytes.is_empty() || bytes.len() > NAME_MAX {
            return Err(());
        }
        if bytes.iter().any(|&c| c == 0 || c == b'/') {
            return Err(());
        }
        // SAFETY: just checked.
        Ok(unsafe { Self::from_bytes_unchecked(bytes) })
    }

    /// # Safety
    ///
    /// `bytes` must be a valid component (see `new`).
    pub unsafe fn from_bytes_unchecked(bytes: &[u8]) -> &Self {
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl PartialEq<[u8]> for FileName {
    fn eq(&self, other: &[u8]) -> bool {
        &self.inner == other
    }
}

impl InodeGuard<'_> {
    /// Read the record at `off`, returning its header and name.
    pub(crate) fn read_entry(&mut self, off: u32) -> (DirentHeader, ArrayVec<u8, NAME_MAX>) {
        let mut head = [0u8; DIRENT_HEADER_SIZE];
        if self.readi(&mut head, off) != Ok(DIRENT_HEADER_SIZE) {
            panic!("dirent: header read");
        }
        let header = DirentHeader::read_from(&head[..]).unwrap();
        if (header.rec_len as usize) < DIRENT_HEADER_SIZE || header.rec_len as usize > BSIZE {
            panic!("dirent: bad rec_len");
        }
        if header.name_len as usize > NAME_MAX {
            panic!("dirent: name too long");
        }

        let mut name = ArrayVec::new();
        if header.name_len > 0 {
            for _ in 0..header.name_len {
                name.push(0);
            }
            if self.readi(&mut name, off + DIRENT_HEADER_SIZE as u32) != Ok(name.len()) {
                panic!("dirent: name read");
            }
        }
        (header, name)
    }

    /// Look for a directory entry named `name`. On a hit, return the
    /// referenced inode and the entry's byte offset.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(RcInode, u32), ()> {
        assert_eq!(self.deref_inner().typ, InodeType::Dir, "dirlookup not DIR");

        let mut off = 0;
        while off < self.deref_inner().size {
            let (header, entry_name) = self.read_entry(off);
            if header.inode != 0 && *name == entry_name[..] {
                let ip = kernel().itable().get_inode(self.dev, header.inode);
                return Ok((ip, off));
            }
            off += header.rec_len as u32;
        }
        Err(())
    }

    /// Append a new directory entry `(name, inum)`. Fails if the name is
    /// already present.
    pub fn dirlink(&mut self, name: &FileName, inum: u32) -> Result<(), ()> {
        if let Ok((ip, _)) = self.dirlookup(name) {
            drop(ip);
            return Err(());
        }

        let rec_len = dirent_size(name.len() as u8);
        let header = DirentHeader {
            inode: inum,
            rec_len,
            name_len: name.len() as u8,
            file_type: FT_UNKNOWN,
        };

        let mut record: ArrayVec<u8, { DIRENT_HEADER_SIZE + NAME_MAX + 3 }> = ArrayVec::new();
        record.try_extend_from_slice(header.as_bytes()).unwrap();
        record.try_extend_from_slice(name.as_bytes()).unwrap();
        while record.len() < rec_len as usize {
            record.push(0);
        }

        let off = self.deref_inner().size;
        if self.writei(&record, off) != Ok(record.len()) {
            panic!("dirlink");
        }
        Ok(())
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut off = 0;
        while off < self.deref_inner().size {
            let (header, name) = self.read_entry(off);
            if header.inode != 0 && &name[..] != b"." && &name[..] != b".." {
                return false;
            }
            off += header.rec_len as u32;
        }
        true
    }
}
