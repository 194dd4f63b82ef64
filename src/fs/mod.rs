//! The ext2 file system.
//!
//! The disk is partitioned; partition 1 holds an ext2 volume whose block
//! size equals the buffer block size (1 KiB). Layout, cached at mount:
//! superblock, block-group descriptor table, per-group inode and block
//! bitmaps (read on demand), inode table, data region.
//!
//! Two block-number vocabularies are in play. The allocator and the
//! on-disk pointers (group descriptors, inode address vectors, indirect
//! blocks) speak *volume-relative* blocks; the buffer cache and the disk
//! driver speak *absolute* blocks counted from sector 0. `bmap` returns
//! absolute blocks, and adding the partition base happens exactly once on
//! every path through here.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use cfg_if::cfg_if;
use zerocopy::FromBytes;

use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::mbr::Mbr;
use crate::param::BSIZE;
use crate::println;

mod devtab;
mod dir;
mod inode;
mod path;
mod stat;
mod superblock;

#[cfg(test)]
pub mod mkfs;
#[cfg(test)]
mod tests;

pub use devtab::DevTab;
pub use dir::{DirentHeader, FileName};
pub use inode::{new_itable, Inode, InodeGuard, InodeInner, InodeType, Itable, RcInode};
pub use path::Path;
pub use stat::Stat;
pub use superblock::{GroupDesc, Superblock, EXT2_MAGIC};

/// Direct block slots in an inode.
pub const NDIRECT: usize = 12;
/// Block numbers per indirect block.
pub const NINDIRECT: usize = BSIZE / 4;
/// Slots in an inode's address vector: direct, then single, double and
/// triple indirect.
pub const N_BLOCKS: usize = NDIRECT + 3;
pub const IND_SLOT: usize = 12;
pub const DIND_SLOT: usize = 13;
pub const TIND_SLOT: usize = 14;
/// Largest file, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT + NINDIRECT * NINDIRECT * NINDIRECT;

/// The root directory's inode number.
pub const ROOT_INUM: u32 = 2;

/// Longest directory-entry name.
pub const NAME_MAX: usize = 255;

/// The geometry of a mounted volume, cached from its superblock.
#[derive(Copy, Clone)]
pub struct Geometry {
    pub dev: u32,
    /// Partition start, in absolute blocks.
    pub first_block: u32,
    pub first_data_block: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u32,
    pub group_count: u32,
}

impl Geometry {
    /// Absolute block of a volume-relative block.
    pub fn abs(&self, rel: u32) -> u32 {
        self.first_block + rel
    }

    /// Absolute block of the group-descriptor table.
    fn desc_block(&self) -> u32 {
        self.first_block + 2
    }

    pub fn group_of_inum(&self, inum: u32) -> u32 {
        (inum - 1) / self.inodes_per_group
    }

    pub fn index_of_inum(&self, inum: u32) -> u32 {
        (inum - 1) % self.inodes_per_group
    }

    pub fn inodes_per_block(&self) -> u32 {
        BSIZE as u32 / self.inode_size
    }
}

cfg_if! {
    if #[cfg(test)] {
        static MOUNTS: Spinlock<std::vec::Vec<Geometry>> =
            Spinlock::new("mounts", std::vec::Vec::new());

        fn register_geometry(geo: Geometry) {
            let mut mounts = MOUNTS.lock();
            if let Some(slot) = mounts.iter_mut().find(|g| g.dev == geo.dev) {
                *slot = geo;
                return;
            }
            mounts.push(geo);
        }

        /// Geometry of the volume mounted as `dev`.
        pub fn geo(dev: u32) -> Geometry {
            *MOUNTS
                .lock()
                .iter()
                .find(|g| g.dev == dev)
                .expect("fs: not mounted")
        }
    } else {
        /// The kernel mounts one volume; a slot or two of slack covers a
        /// future second disk.
        const NVOLUME: usize = 2;

        static MOUNTS: Spinlock<[Option<Geometry>; NVOLUME]> =
            Spinlock::new("mounts", [None; NVOLUME]);

        fn register_geometry(geo: Geometry) {
            let mut mounts = MOUNTS.lock();
            for slot in mounts.iter_mut() {
                match slot {
                    Some(g) if g.dev == geo.dev => {
                        *slot = Some(geo);
                        return;
                    }
                    None => {
                        *slot = Some(geo);
                        return;
                    }
                    _ => {}
                }
            }
            panic!("fs: too many volumes");
        }

        /// Geometry of the volume mounted as `dev`.
        pub fn geo(dev: u32) -> Geometry {
            MOUNTS
                .lock()
                .iter()
                .flatten()
                .find(|g| g.dev == dev)
                .copied()
                .expect("fs: not mounted")
        }
    }
}

/// A mounted ext2 volume.
pub struct FileSystem {
    root_dev: AtomicU32,
    ready: AtomicBool,
}

impl FileSystem {
    pub const fn new() -> Self {
        Self {
            root_dev: AtomicU32::new(0),
            ready: AtomicBool::new(false),
        }
    }

    /// Read the MBR and the superblock of `dev`'s first partition, and
    /// cache the volume geometry.
    pub fn mount(&self, dev: u32) -> Result<(), ()> {
        let bcache = kernel().bcache();

        let first_block = {
            let bp = bcache.read(dev, 0);
            Mbr::parse(bp.deref_inner().data.bytes())?.first_partition_block()
        };

        let sb = {
            let bp = bcache.read(dev, first_block + 1);
            Superblock::read_from_prefix(&bp.deref_inner().data.bytes()[..]).ok_or(())?
        };
        if sb.magic != EXT2_MAGIC {
            println!("mount: bad ext2 magic {:#x}", sb.magic);
            return Err(());
        }
        println!(
            "ext2: size {} nblocks {} ninodes {} inodes_per_group {} inode_size {}",
            1024u32 << sb.log_block_size,
            sb.blocks_count,
            sb.inodes_count,
            sb.inodes_per_group,
            sb.inode_size
        );
        assert_eq!(1024u32 << sb.log_block_size, BSIZE as u32, "mount: block size");

        let group_count = (sb.blocks_count + sb.blocks_per_group - 1) / sb.blocks_per_group;
        register_geometry(Geometry {
            dev,
            first_block,
            first_data_block: sb.first_data_block,
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.inode_size as u32,
            group_count: group_count.max(1),
        });
        self.root_dev.store(dev, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Mount `dev` and load the device registry from /etc/devtab. Runs in
    /// the context of the first process, because it reads files.
    pub fn init(&self, dev: u32) {
        if self.ready.load(Ordering::Acquire) {
            return;
        }
        self.mount(dev).expect("fs: mount failed");
        kernel().devtab.load(self);
    }

    pub fn device(&self) -> u32 {
        assert!(self.ready.load(Ordering::Acquire), "fs: not mounted");
        self.root_dev.load(Ordering::Acquire)
    }

    pub fn geometry(&self) -> Geometry {
        geo(self.device())
    }

    /// The root directory.
    pub fn root(&self) -> RcInode {
        kernel().itable().get_inode(self.device(), ROOT_INUM)
    }
}

/// Read group `gno`'s descriptor.
pub(crate) fn group_desc(dev: u32, gno: u32) -> GroupDesc {
    let g = geo(dev);
    let bp = kernel().bcache().read(dev, g.desc_block());
    let off = gno as usize * core::mem::size_of::<GroupDesc>();
    GroupDesc::read_from_prefix(&bp.deref_inner().data.bytes()[off..]).expect("group_desc")
}

// Bitmap blocks: bit `i` of the region is bit `i % 8` of byte `i / 8`.

fn bitmap_get(bytes: &[u8], bit: u32) -> bool {
    bytes[bit as usize / 8] & (1 << (bit % 8)) != 0
}

fn bitmap_set(bytes: &mut [u8], bit: u32) {
    bytes[bit as usize / 8] |= 1 << (bit % 8);
}

fn bitmap_clear(bytes: &mut [u8], bit: u32) {
    bytes[bit as usize / 8] &= !(1 << (bit % 8));
}

/// First zero bit within the first `nbits` of `bytes`, if any.
fn find_free_bit(bytes: &[u8], nbits: u32) -> Option<u32> {
    (0..nbits).find(|&bit| !bitmap_get(bytes, bit))
}

/// Zero a block (given by absolute block number).
fn bzero(dev: u32, abs_block: u32) {
    let mut bp = kernel().bcache().read(dev, abs_block);
    bp.deref_inner_mut().data.bytes_mut().fill(0);
    bp.write();
}

/// Allocate a zeroed disk block, preferring `hint_gno`'s group. Returns a
/// volume-relative block number.
pub(crate) fn balloc(dev: u32, hint_gno: u32) -> Result<u32, ()> {
    let g = geo(dev);
    for step in 0..g.group_count {
        let gno = (hint_gno + step) % g.group_count;
        let desc = group_desc(dev, gno);

        let mut bp = kernel().bcache().read(dev, g.abs(desc.block_bitmap));
        let found = find_free_bit(bp.deref_inner().data.bytes(), g.blocks_per_group);
        if let Some(bit) = found {
            bitmap_set(bp.deref_inner_mut().data.bytes_mut(), bit);
            bp.write();
            drop(bp);

            let rel = g.first_data_block + gno * g.blocks_per_group + bit;
            bzero(dev, g.abs(rel));
            return Ok(rel);
        }
    }
    Err(())
}

/// Free a disk block (volume-relative). Freeing a free block is fatal.
pub(crate) fn bfree(dev: u32, rel_block: u32) {
    let g = geo(dev);
    assert!(rel_block >= g.first_data_block, "bfree: invalid block");

    let index = rel_block - g.first_data_block;
    let gno = index / g.blocks_per_group;
    let offset = index % g.blocks_per_group;
    let desc = group_desc(dev, gno);

    let mut bp = kernel().bcache().read(dev, g.abs(desc.block_bitmap));
    assert!(
        bitmap_get(bp.deref_inner().data.bytes(), offset),
        "bfree: block already free"
    );
    bitmap_clear(bp.deref_inner_mut().data.bytes_mut(), offset);
    bp.write();
}

/// Clear `inum`'s bit in its group's inode bitmap. Freeing a free inode
/// is fatal.
pub(crate) fn ifree(dev: u32, inum: u32) {
    let g = geo(dev);
    let desc = group_desc(dev, g.group_of_inum(inum));
    let index = g.index_of_inum(inum);

    let mut bp = kernel().bcache().read(dev, g.abs(desc.inode_bitmap));
    assert!(
        bitmap_get(bp.deref_inner().data.bytes(), index),
        "ifree: inode already free"
    );
    bitmap_clear(bp.deref_inner_mut().data.bytes_mut(), index);
    bp.write();
}
