//! Inodes.
//!
//! An inode describes a single unnamed file: type, link count, size, and
//! the address vector naming the blocks holding its content (twelve
//! direct slots, then one single-, one double- and one triple-indirect).
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple processes. The
//! in-memory copy carries bookkeeping that is not stored on disk: the
//! reference count (held by the arena) and `valid`.
//!
//! * Allocation: an inode is allocated on disk if its mode is non-zero.
//!   `Itable::alloc_inode` allocates; the last `RcInode` frees the disk
//!   inode when the link count has also fallen to zero.
//! * Referencing: `Itable::get_inode` finds or creates a table entry and
//!   returns a handle; handles keep the entry pinned.
//! * Valid: the cached fields are meaningful only after the first
//!   `Inode::lock` read them from disk.
//! * Locked: file-system code may examine and modify the cached fields
//!   and the file content only inside an `InodeGuard`.
//!
//! Thus a typical sequence is:
//!   let ip = itable.get_inode(dev, inum);
//!   let mut guard = ip.lock();
//!   ... examine and modify through guard ...
//!   drop(guard);
//!
//! Locking is separate from getting so that a long-lived reference (an
//! open file, a working directory) does not hold the sleeplock between
//! operations, which also keeps pathname lookup deadlock-free.
//!
//! The table spinlock protects identity (`dev`, `inum`) and the counts;
//! every other field is protected by the per-inode sleeplock.

use core::ops::Deref;

use array_macro::array;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::{
    balloc, bfree, geo, group_desc, Geometry, Stat, DIND_SLOT, IND_SLOT, MAXFILE, NDIRECT,
    NINDIRECT, N_BLOCKS, TIND_SLOT,
};
use crate::arena::{Arena, ArenaObject, ArrayArena, Rc, RcEntry};
use crate::file;
use crate::kernel::kernel;
use crate::lock::{SleepLock, SleepLockGuard, Spinlock};
use crate::param::{BSIZE, NINODE};

// Inode mode bits.
pub const S_IFMT: u16 = 0xF000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;

/// Structure of an inode on disk. The kernel reads and writes only the
/// mode, link count, size and block pointers; the rest is written as
/// zero.
#[derive(Clone, FromBytes, AsBytes)]
#[repr(C)]
pub struct Dinode {
    /// File mode
    pub mode: u16,
    /// Low 16 bits of owner uid
    pub uid: u16,
    /// Size in bytes
    pub size: u32,
    /// Access time
    pub atime: u32,
    /// Creation time
    pub ctime: u32,
    /// Modification time
    pub mtime: u32,
    /// Deletion time
    pub dtime: u32,
    /// Low 16 bits of group id
    pub gid: u16,
    /// Links count
    pub links_count: u16,
    /// Blocks count (512-byte units)
    pub blocks: u32,
    /// File flags
    pub flags: u32,
    /// OS dependent 1
    pub osd1: u32,
    /// Pointers to blocks (volume-relative)
    pub block: [u32; N_BLOCKS],
    /// File version (for NFS)
    pub generation: u32,
    /// File ACL
    pub file_acl: u32,
    /// Directory ACL
    pub dir_acl: u32,
    /// Fragment address
    pub faddr: u32,
    /// OS dependent 2
    pub osd2: [u8; 12],
}

const_assert_eq!(core::mem::size_of::<Dinode>(), 128);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

impl InodeType {
    fn mode(self) -> u16 {
        match self {
            InodeType::None => 0,
            InodeType::Dir => S_IFDIR,
            InodeType::File => S_IFREG,
            InodeType::Device { .. } => S_IFCHR,
        }
    }
}

/// Cached copy of the on-disk fields, protected by the sleeplock.
pub struct InodeInner {
    /// Has the inode been read from disk?
    pub valid: bool,
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    /// The address vector: volume-relative block numbers.
    pub addrs: [u32; N_BLOCKS],
}

impl InodeInner {
    const fn zero() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            nlink: 0,
            size: 0,
            addrs: [0; N_BLOCKS],
        }
    }
}

/// In-memory copy of an inode. `dev` and `inum` are the identity fields,
/// protected by the table spinlock.
pub struct Inode {
    pub dev: u32,
    pub inum: u32,
    pub inner: SleepLock<InodeInner>,
}

impl Inode {
    pub const fn zero() -> Self {
        Self {
            dev: 0,
            inum: 0,
            inner: SleepLock::new("inode", InodeInner::zero()),
        }
    }

    /// Lock the inode, reading it from disk on first use.
    pub fn lock(&self) -> InodeGuard<'_> {
        let mut guard = self.inner.lock();
        if !guard.valid {
            let g = geo(self.dev);
            let dinode = read_dinode(&g, self.dev, self.inum);

            guard.typ = match dinode.mode & S_IFMT {
                S_IFDIR => InodeType::Dir,
                S_IFREG => InodeType::File,
                S_IFCHR => {
                    let (major, minor) = kernel()
                        .devtab
                        .lookup(self.inum)
                        .unwrap_or((0, 0));
                    InodeType::Device { major, minor }
                }
                _ => panic!("ilock: no type"),
            };
            guard.nlink = dinode.links_count as i16;
            guard.size = dinode.size;
            guard.addrs = dinode.block;
            guard.valid = true;
        }
        InodeGuard { inode: self, guard }
    }
}

impl ArenaObject for Inode {
    /// Runs when the last reference goes away: if the inode also has no
    /// links, free it on disk.
    fn finalize<A: Arena<Data = Self>>(&mut self, guard: &mut A::Guard<'_>) {
        // SAFETY: no handle is left, so nobody holds the sleeplock.
        let inner = unsafe { &*self.inner.get_mut_raw() };
        if inner.valid && inner.nlink == 0 {
            // Truncation sleeps on buffers; let go of the table lock.
            // Nobody can reach this inode meanwhile: it has no links, so
            // no directory entry names it.
            unsafe {
                A::reacquire_after(guard, || {
                    super::ifree(self.dev, self.inum);
                    let mut ip = self.lock();
                    ip.trunc();
                    ip.deref_inner_mut().typ = InodeType::None;
                    ip.update();
                    ip.deref_inner_mut().valid = false;
                })
            };
        }
    }
}

/// Where `inum`'s on-disk inode lives: (absolute block, byte offset).
fn dinode_location(g: &Geometry, dev: u32, inum: u32) -> (u32, usize) {
    let desc = group_desc(dev, g.group_of_inum(inum));
    let index = g.index_of_inum(inum);
    let block = desc.inode_table + index / g.inodes_per_block();
    let offset = (index % g.inodes_per_block()) * g.inode_size;
    (g.abs(block), offset as usize)
}

fn read_dinode(g: &Geometry, dev: u32, inum: u32) -> Dinode {
    let (block, offset) = dinode_location(g, dev, inum);
    let bp = kernel().bcache().read(dev, block);
    Dinode::read_from_prefix(&bp.deref_inner().data.bytes()[offset..]).expect("read_dinode")
}

/// The in-memory inode cache.
pub type Itable = Spinlock<ArrayArena<Inode, NINODE>>;
pub type RcInode = Rc<Itable>;

pub const fn new_itable() -> Itable {
    Spinlock::new(
        "itable",
        ArrayArena::new(array![_ => RcEntry::new(Inode::zero()); NINODE]),
    )
}

impl Itable {
    /// Find the inode numbered `inum` on device `dev` and return its
    /// in-memory copy, unlocked and not yet read from disk.
    pub fn get_inode(&'static self, dev: u32, inum: u32) -> RcInode {
        self.find_or_alloc(
            |ip| ip.dev == dev && ip.inum == inum,
            |ip| {
                ip.dev = dev;
                ip.inum = inum;
                ip.inner.get_mut().valid = false;
            },
        )
        .expect("iget: no inodes")
    }

    /// Allocate a fresh on-disk inode of type `typ` on `dev`: find a free
    /// bit in some group's inode bitmap and give the matching table slot
    /// a zeroed inode carrying the type's mode. Returns an unlocked,
    /// referenced inode.
    pub fn alloc_inode(&'static self, dev: u32, typ: InodeType) -> Result<RcInode, ()> {
        let g = geo(dev);
        for gno in 0..g.group_count {
            let desc = group_desc(dev, gno);

            let mut bp = kernel().bcache().read(dev, g.abs(desc.inode_bitmap));
            let bit = super::find_free_bit(bp.deref_inner().data.bytes(), g.inodes_per_group);
            let Some(bit) = bit else {
                continue;
            };
            super::bitmap_set(bp.deref_inner_mut().data.bytes_mut(), bit);
            bp.write();
            drop(bp);

            let inum = gno * g.inodes_per_group + bit + 1;
            let (block, offset) = dinode_location(&g, dev, inum);
            let mut bp = kernel().bcache().read(dev, block);
            let slot = &mut bp.deref_inner_mut().data.bytes_mut()[offset..];
            slot[..g.inode_size as usize].fill(0);
            let mut dinode = Dinode::new_zeroed();
            dinode.mode = typ.mode();
            slot[..core::mem::size_of::<Dinode>()].copy_from_slice(dinode.as_bytes());
            bp.write();
            drop(bp);

            return Ok(self.get_inode(dev, inum));
        }
        Err(())
    }
}

/// A locked inode: the sleeplock is held, so the cached fields and the
/// file content may be used.
pub struct InodeGuard<'a> {
    pub inode: &'a Inode,
    guard: SleepLockGuard<'a, InodeInner>,
}

impl Deref for InodeGuard<'_> {
    type Target = Inode;

    fn deref(&self) -> &Self::Target {
        self.inode
    }
}

impl InodeGuard<'_> {
    pub fn deref_inner(&self) -> &InodeInner {
        &self.guard
    }

    pub fn deref_inner_mut(&mut self) -> &mut InodeInner {
        &mut self.guard
    }

    /// Copy the modified in-memory inode to disk. Call after every change
    /// to a field that lives on disk.
    pub fn update(&mut self) {
        let g = geo(self.dev);
        let (block, offset) = dinode_location(&g, self.dev, self.inum);
        let inner = self.deref_inner();

        // Major/minor of device inodes live in the devtab, not on disk;
        // everything the mode/links/size/blocks fields don't cover is
        // written as zero.
        let mut dinode = Dinode::new_zeroed();
        dinode.mode = inner.typ.mode();
        dinode.links_count = inner.nlink as u16;
        dinode.size = inner.size;
        dinode.block = inner.addrs;

        let mut bp = kernel().bcache().read(self.dev, block);
        bp.deref_inner_mut().data.bytes_mut()[offset..offset + core::mem::size_of::<Dinode>()]
            .copy_from_slice(dinode.as_bytes());
        bp.write();
    }

    /// Disk block (absolute) of the `bn`-th block of this file, or `None`
    /// if the block is a hole. Never allocates.
    pub fn bmap(&mut self, bn: u32) -> Option<u32> {
        let dev = self.dev;
        let g = geo(dev);
        let mut bn = bn as usize;

        let nonzero = |rel: u32| if rel == 0 { None } else { Some(rel) };

        if bn < NDIRECT {
            return nonzero(self.deref_inner().addrs[bn]).map(|rel| g.abs(rel));
        }
        bn -= NDIRECT;

        let entry = |table_rel: u32, index: usize| {
            let bp = kernel().bcache().read(dev, g.abs(table_rel));
            let e = bp.deref_inner().data.u32_at(index);
            nonzero(e)
        };

        if bn < NINDIRECT {
            let ind = nonzero(self.deref_inner().addrs[IND_SLOT])?;
            return entry(ind, bn).map(|rel| g.abs(rel));
        }
        bn -= NINDIRECT;

        if bn < NINDIRECT * NINDIRECT {
            let dind = nonzero(self.deref_inner().addrs[DIND_SLOT])?;
            let mid = entry(dind, bn / NINDIRECT)?;
            return entry(mid, bn % NINDIRECT).map(|rel| g.abs(rel));
        }
        bn -= NINDIRECT * NINDIRECT;

        if bn < NINDIRECT * NINDIRECT * NINDIRECT {
            let tind = nonzero(self.deref_inner().addrs[TIND_SLOT])?;
            let mid = entry(tind, bn / (NINDIRECT * NINDIRECT))?;
            let rem = bn % (NINDIRECT * NINDIRECT);
            let leaf_table = entry(mid, rem / NINDIRECT)?;
            return entry(leaf_table, rem % NINDIRECT).map(|rel| g.abs(rel));
        }
        panic!("bmap: block number out of range");
    }

    /// Disk block (absolute) of the `bn`-th block of this file,
    /// allocating it and any missing indirect blocks on the way.
    pub fn bmap_or_alloc(&mut self, bn: u32) -> Result<u32, ()> {
        let dev = self.dev;
        let g = geo(dev);
        let hint = g.group_of_inum(self.inum);
        let mut bn = bn as usize;

        if bn < NDIRECT {
            let mut addr = self.deref_inner().addrs[bn];
            if addr == 0 {
                addr = balloc(dev, hint)?;
                self.deref_inner_mut().addrs[bn] = addr;
            }
            return Ok(g.abs(addr));
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            let ind = self.addr_slot_or_alloc(IND_SLOT, hint)?;
            let addr = indirect_entry_or_alloc(dev, &g, ind, bn, hint)?;
            return Ok(g.abs(addr));
        }
        bn -= NINDIRECT;

        if bn < NINDIRECT * NINDIRECT {
            let dind = self.addr_slot_or_alloc(DIND_SLOT, hint)?;
            let mid = indirect_entry_or_alloc(dev, &g, dind, bn / NINDIRECT, hint)?;
            let addr = indirect_entry_or_alloc(dev, &g, mid, bn % NINDIRECT, hint)?;
            return Ok(g.abs(addr));
        }
        bn -= NINDIRECT * NINDIRECT;

        if bn < NINDIRECT * NINDIRECT * NINDIRECT {
            let tind = self.addr_slot_or_alloc(TIND_SLOT, hint)?;
            let mid = indirect_entry_or_alloc(dev, &g, tind, bn / (NINDIRECT * NINDIRECT), hint)?;
            let rem = bn % (NINDIRECT * NINDIRECT);
            let leaf_table = indirect_entry_or_alloc(dev, &g, mid, rem / NINDIRECT, hint)?;
            let addr = indirect_entry_or_alloc(dev, &g, leaf_table, rem % NINDIRECT, hint)?;
            return Ok(g.abs(addr));
        }
        panic!("bmap: block number out of range");
    }

    /// The address-vector slot `slot`, allocated if empty. Returns a
    /// volume-relative block.
    fn addr_slot_or_alloc(&mut self, slot: usize, hint: u32) -> Result<u32, ()> {
        let mut addr = self.deref_inner().addrs[slot];
        if addr == 0 {
            addr = balloc(self.dev, hint)?;
            self.deref_inner_mut().addrs[slot] = addr;
        }
        Ok(addr)
    }

    /// Truncate the file to zero length: discard every direct block and
    /// every tier of indirect blocks. Called only when the inode has no
    /// links and no other in-memory references.
    pub fn trunc(&mut self) {
        let dev = self.dev;

        for i in 0..NDIRECT {
            let addr = self.deref_inner().addrs[i];
            if addr != 0 {
                bfree(dev, addr);
                self.deref_inner_mut().addrs[i] = 0;
            }
        }

        for (slot, depth) in [(IND_SLOT, 1), (DIND_SLOT, 2), (TIND_SLOT, 3)] {
            let addr = self.deref_inner().addrs[slot];
            if addr != 0 {
                free_indirect(dev, addr, depth);
                self.deref_inner_mut().addrs[slot] = 0;
            }
        }

        self.deref_inner_mut().size = 0;
        self.update();
    }

    /// Read up to `dst.len()` bytes starting at `off` into `dst`.
    /// Device inodes dispatch to the registered driver instead.
    pub fn readi(&mut self, dst: &mut [u8], mut off: u32) -> Result<usize, ()> {
        if let InodeType::Device { major, .. } = self.deref_inner().typ {
            return file::device_read(major, dst);
        }

        let size = self.deref_inner().size;
        let mut n = dst.len() as u32;
        if off > size || off.checked_add(n).is_none() {
            return Err(());
        }
        if off + n > size {
            n = size - off;
        }

        let mut tot: u32 = 0;
        while tot < n {
            let begin = (off % BSIZE as u32) as usize;
            let m = ((n - tot) as usize).min(BSIZE - begin);
            let chunk = &mut dst[tot as usize..tot as usize + m];
            match self.bmap(off / BSIZE as u32) {
                Some(block) => {
                    let bp = kernel().bcache().read(self.dev, block);
                    chunk.copy_from_slice(&bp.deref_inner().data.bytes()[begin..begin + m]);
                }
                // A hole reads as zeroes.
                None => chunk.fill(0),
            }
            tot += m as u32;
            off += m as u32;
        }
        Ok(n as usize)
    }

    /// Write `src` at `off`, extending the file if the write crosses the
    /// end. Writing past the end leaves a hole. The data reaches the disk
    /// before this returns.
    pub fn writei(&mut self, src: &[u8], mut off: u32) -> Result<usize, ()> {
        if let InodeType::Device { major, .. } = self.deref_inner().typ {
            return file::device_write(major, src);
        }

        let n = src.len() as u32;
        if off.checked_add(n).is_none() || off as usize + n as usize > MAXFILE * BSIZE {
            return Err(());
        }

        let mut tot: u32 = 0;
        while tot < n {
            let block = self.bmap_or_alloc(off / BSIZE as u32)?;
            let mut bp = kernel().bcache().read(self.dev, block);
            let begin = (off % BSIZE as u32) as usize;
            let m = ((n - tot) as usize).min(BSIZE - begin);
            bp.deref_inner_mut().data.bytes_mut()[begin..begin + m]
                .copy_from_slice(&src[tot as usize..tot as usize + m]);
            bp.write();
            tot += m as u32;
            off += m as u32;
        }

        if n > 0 && off > self.deref_inner().size {
            self.deref_inner_mut().size = off;
        }
        self.update();
        Ok(n as usize)
    }

    /// Metadata for fstat.
    pub fn stati(&self) -> Stat {
        let inner = self.deref_inner();
        Stat {
            dev: self.dev as i32,
            ino: self.inum,
            typ: match inner.typ {
                InodeType::None => 0,
                InodeType::Dir => Stat::T_DIR,
                InodeType::File => Stat::T_FILE,
                InodeType::Device { .. } => Stat::T_DEV,
            },
            nlink: inner.nlink,
            size: inner.size,
        }
    }
}

/// Entry `index` of the volume-relative indirect block `table_rel`,
/// allocated (and recorded in the table) if empty.
fn indirect_entry_or_alloc(
    dev: u32,
    g: &Geometry,
    table_rel: u32,
    index: usize,
    hint: u32,
) -> Result<u32, ()> {
    let mut bp = kernel().bcache().read(dev, g.abs(table_rel));
    let mut entry = bp.deref_inner().data.u32_at(index);
    if entry == 0 {
        entry = balloc(dev, hint)?;
        bp.deref_inner_mut().data.set_u32_at(index, entry);
        bp.write();
    }
    Ok(entry)
}

/// Free every block reachable through the volume-relative indirect block
/// `rel` (`depth` tiers of tables below it), then the block itself.
fn free_indirect(dev: u32, rel: u32, depth: u32) {
    let g = geo(dev);
    {
        let bp = kernel().bcache().read(dev, g.abs(rel));
        for i in 0..NINDIRECT {
            let entry = bp.deref_inner().data.u32_at(i);
            if entry != 0 {
                if depth > 1 {
                    free_indirect(dev, entry, depth - 1);
                } else {
                    bfree(dev, entry);
                }
            }
        }
    }
    bfree(dev, rel);
}
