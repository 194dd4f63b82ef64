//! Test fixture: builds a minimal one-group ext2 image, the way the mkfs
//! tool lays one out, and mounts it on a fresh device number.

use std::vec;
use std::vec::Vec;

use zerocopy::{AsBytes, FromBytes};

use super::dir::{dirent_size, DirentHeader, FT_UNKNOWN};
use super::inode::{Dinode, S_IFDIR};
use super::{FileSystem, GroupDesc, Superblock, EXT2_MAGIC, ROOT_INUM};
use crate::kernel::kernel;
use crate::kernel::test_util::fresh_dev;
use crate::param::BSIZE;

/// Partition 1 starts at sector 2, i.e. volume block 0 is absolute
/// block 1.
const LBA_START: u32 = 2;
const FIRST_BLOCK: u32 = LBA_START / 2;

const BLOCKS_PER_GROUP: u32 = 8 * BSIZE as u32;
const INODES_PER_GROUP: u32 = 128;
const INODE_SIZE: u32 = 128;
const FIRST_DATA_BLOCK: u32 = 1;

// Volume-relative layout: boot, superblock, group descriptors, block
// bitmap, inode bitmap, inode table, then data.
const SB_BLOCK: u32 = 1;
const GDT_BLOCK: u32 = 2;
const BBITMAP_BLOCK: u32 = 3;
const IBITMAP_BLOCK: u32 = 4;
const ITABLE_BLOCK: u32 = 5;
const ITABLE_BLOCKS: u32 = INODES_PER_GROUP * INODE_SIZE / BSIZE as u32;
const ROOTDIR_BLOCK: u32 = ITABLE_BLOCK + ITABLE_BLOCKS;
pub const FIRST_FREE_BLOCK: u32 = ROOTDIR_BLOCK + 1;

fn block_mut(image: &mut [u8], vol_block: u32) -> &mut [u8] {
    let start = (FIRST_BLOCK + vol_block) as usize * BSIZE;
    &mut image[start..start + BSIZE]
}

/// Build an image whose volume spans `blocks_count` blocks.
pub fn build(blocks_count: u32) -> Vec<u8> {
    assert!(blocks_count > FIRST_FREE_BLOCK && blocks_count <= BLOCKS_PER_GROUP);
    let mut image = vec![0u8; (FIRST_BLOCK + blocks_count) as usize * BSIZE];

    crate::mbr::tests::format(&mut image, LBA_START);

    let mut sb = Superblock::new_zeroed();
    sb.magic = EXT2_MAGIC;
    sb.blocks_count = blocks_count;
    sb.inodes_count = INODES_PER_GROUP;
    sb.first_data_block = FIRST_DATA_BLOCK;
    sb.log_block_size = 0;
    sb.blocks_per_group = BLOCKS_PER_GROUP;
    sb.inodes_per_group = INODES_PER_GROUP;
    sb.inode_size = INODE_SIZE as u16;
    sb.first_ino = 11;
    block_mut(&mut image, SB_BLOCK).copy_from_slice(sb.as_bytes());

    let mut desc = GroupDesc::default();
    desc.block_bitmap = BBITMAP_BLOCK;
    desc.inode_bitmap = IBITMAP_BLOCK;
    desc.inode_table = ITABLE_BLOCK;
    block_mut(&mut image, GDT_BLOCK)[..core::mem::size_of::<GroupDesc>()]
        .copy_from_slice(desc.as_bytes());

    // Block bitmap: bit b covers volume block FIRST_DATA_BLOCK + b. Mark
    // the metadata blocks and the root directory used, and everything
    // past the volume's end.
    {
        let bitmap = block_mut(&mut image, BBITMAP_BLOCK);
        let used = |bitmap: &mut [u8], bit: u32| bitmap[bit as usize / 8] |= 1 << (bit % 8);
        for vol in FIRST_DATA_BLOCK..=ROOTDIR_BLOCK {
            used(bitmap, vol - FIRST_DATA_BLOCK);
        }
        for bit in (blocks_count - FIRST_DATA_BLOCK)..BLOCKS_PER_GROUP {
            used(bitmap, bit);
        }
    }

    // Inode bitmap: inode 1 (reserved) and 2 (root) are taken.
    {
        let bitmap = block_mut(&mut image, IBITMAP_BLOCK);
        bitmap[0] |= 0b11;
    }

    // Root inode.
    {
        let mut root = Dinode::new_zeroed();
        root.mode = S_IFDIR;
        root.links_count = 2;
        root.size = (dirent_size(1) + dirent_size(2)) as u32;
        root.block[0] = ROOTDIR_BLOCK;
        let index = ROOT_INUM - 1;
        let block = ITABLE_BLOCK + index * INODE_SIZE / BSIZE as u32;
        let offset = (index * INODE_SIZE) as usize % BSIZE;
        block_mut(&mut image, block)[offset..offset + core::mem::size_of::<Dinode>()]
            .copy_from_slice(root.as_bytes());
    }

    // Root directory: "." and "..", both the root itself.
    {
        let data = block_mut(&mut image, ROOTDIR_BLOCK);
        let dot = DirentHeader {
            inode: ROOT_INUM,
            rec_len: dirent_size(1),
            name_len: 1,
            file_type: FT_UNKNOWN,
        };
        data[..8].copy_from_slice(dot.as_bytes());
        data[8] = b'.';
        let dotdot = DirentHeader {
            inode: ROOT_INUM,
            rec_len: dirent_size(2),
            name_len: 2,
            file_type: FT_UNKNOWN,
        };
        let off = dirent_size(1) as usize;
        data[off..off + 8].copy_from_slice(dotdot.as_bytes());
        data[off + 8] = b'.';
        data[off + 9] = b'.';
    }

    image
}

/// Build a fresh volume and mount it as the kernel's file system;
/// returns the file system and its device number.
pub fn mount_fresh(blocks_count: u32) -> (&'static FileSystem, u32) {
    let dev = fresh_dev();
    kernel().disk().set_image(build(blocks_count).leak());
    let fs = &kernel().fs;
    fs.mount(dev).unwrap();
    (fs, dev)
}

/// Count the zero bits (free blocks) in the volume's block bitmap.
pub fn free_block_count(dev: u32) -> u32 {
    let g = super::geo(dev);
    let bp = kernel().bcache().read(dev, g.abs(BBITMAP_BLOCK));
    let mut free = 0;
    for bit in 0..g.blocks_per_group {
        let byte = bp.deref_inner().data.bytes()[bit as usize / 8];
        if byte & (1 << (bit % 8)) == 0 {
            free += 1;
        }
    }
    free
}
