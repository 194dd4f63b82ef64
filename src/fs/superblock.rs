//! On-disk ext2 metadata: the superblock and block-group descriptors.
//! Bit-exact with the standard layout; all fields little-endian.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

/// Magic signature of an ext2 volume.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// The ext2 superblock: 1024 bytes at offset 1024 within the partition.
#[derive(Clone, FromBytes, AsBytes)]
#[repr(C)]
pub struct Superblock {
    /// Inodes count
    pub inodes_count: u32,
    /// Blocks count
    pub blocks_count: u32,
    /// Reserved blocks count
    pub r_blocks_count: u32,
    /// Free blocks count
    pub free_blocks_count: u32,
    /// Free inodes count
    pub free_inodes_count: u32,
    /// First data block
    pub first_data_block: u32,
    /// Block size is 1024 << log_block_size
    pub log_block_size: u32,
    /// Fragment size
    pub log_frag_size: u32,
    /// # blocks per group
    pub blocks_per_group: u32,
    /// # fragments per group
    pub frags_per_group: u32,
    /// # inodes per group
    pub inodes_per_group: u32,
    /// Mount time
    pub mtime: u32,
    /// Write time
    pub wtime: u32,
    /// Mount count
    pub mnt_count: u16,
    /// Maximal mount count
    pub max_mnt_count: u16,
    /// Magic signature
    pub magic: u16,
    /// File system state
    pub state: u16,
    /// Behaviour when detecting errors
    pub errors: u16,
    /// Minor revision level
    pub minor_rev_level: u16,
    /// Time of last check
    pub lastcheck: u32,
    /// Max time between checks
    pub checkinterval: u32,
    /// Creator OS
    pub creator_os: u32,
    /// Revision level
    pub rev_level: u32,
    /// Default uid for reserved blocks
    pub def_resuid: u16,
    /// Default gid for reserved blocks
    pub def_resgid: u16,
    /// First non-reserved inode
    pub first_ino: u32,
    /// Size of the on-disk inode structure
    pub inode_size: u16,
    /// Block group # of this superblock
    pub block_group_nr: u16,
    /// Compatible feature set
    pub feature_compat: u32,
    /// Incompatible feature set
    pub feature_incompat: u32,
    /// Readonly-compatible feature set
    pub feature_ro_compat: u32,
    /// 128-bit uuid for the volume
    pub uuid: [u8; 16],
    /// Volume name
    pub volume_name: [u8; 16],
    /// Directory where last mounted
    pub last_mounted: [u8; 64],
    /// For compression
    pub algorithm_usage_bitmap: u32,
    /// # blocks to try to preallocate
    pub prealloc_blocks: u8,
    /// # blocks to preallocate for directories
    pub prealloc_dir_blocks: u8,
    pub padding1: u16,
    /// Uuid of the journal superblock
    pub journal_uuid: [u8; 16],
    /// Inode number of the journal file
    pub journal_inum: u32,
    /// Device number of the journal file
    pub journal_dev: u32,
    /// Start of the list of inodes to delete
    pub last_orphan: u32,
    /// HTREE hash seed
    pub hash_seed: [u32; 4],
    /// Default hash version
    pub def_hash_version: u8,
    pub reserved_char_pad: u8,
    pub reserved_word_pad: u16,
    pub default_mount_opts: u32,
    /// First metablock block group
    pub first_meta_bg: u32,
    /// Padding to the end of the block
    pub reserved: [u32; 190],
}

const_assert_eq!(core::mem::size_of::<Superblock>(), 1024);

/// One block-group descriptor. Block numbers are volume-relative.
#[derive(Copy, Clone, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct GroupDesc {
    /// Blocks bitmap block
    pub block_bitmap: u32,
    /// Inodes bitmap block
    pub inode_bitmap: u32,
    /// Inodes table block
    pub inode_table: u32,
    /// Free blocks count
    pub free_blocks_count: u16,
    /// Free inodes count
    pub free_inodes_count: u16,
    /// Directories count
    pub used_dirs_count: u16,
    pub pad: u16,
    pub reserved: [u32; 3],
}

const_assert_eq!(core::mem::size_of::<GroupDesc>(), 32);
