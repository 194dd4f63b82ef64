//! Master boot record.
//!
//! The first 512 bytes of the disk: 446 bytes of bootstrap code, four
//! 16-byte partition entries, and the 0xAA55 signature. Partition 1 holds
//! the ext2 volume; its LBA start (in 512-byte sectors) divided by two is
//! the volume's first 1 KiB block.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

/// Linux native partition.
pub const MBR_TYPE_LINUX: u8 = 0x83;
/// Empty or unused partition.
pub const MBR_TYPE_EMPTY: u8 = 0x00;

#[derive(Copy, Clone, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct PartitionEntry {
    /// Bootable status.
    pub status: u8,
    /// CHS start address.
    pub chs_start: [u8; 3],
    /// Partition type.
    pub typ: u8,
    /// CHS end address.
    pub chs_end: [u8; 3],
    /// LBA start address, in sectors.
    pub lba_start: u32,
    /// Number of sectors.
    pub num_sectors: u32,
}

impl PartitionEntry {
    pub fn is_empty(&self) -> bool {
        self.typ == MBR_TYPE_EMPTY
    }
}

#[derive(Copy, Clone, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct Mbr {
    pub bootstrap: [u8; 446],
    pub part: [PartitionEntry; 4],
    pub signature: u16,
}

const_assert_eq!(core::mem::size_of::<PartitionEntry>(), 16);
const_assert_eq!(core::mem::size_of::<Mbr>(), 512);

const MBR_SIGNATURE: u16 = 0xAA55;

impl Mbr {
    /// Decode the MBR from the first disk block. Fails on a bad
    /// signature or an empty first partition.
    pub fn parse(block0: &[u8]) -> Result<Mbr, ()> {
        let mbr = Mbr::read_from_prefix(block0).ok_or(())?;
        if mbr.signature != MBR_SIGNATURE {
            crate::println!("invalid mbr signature: {:#x}", { mbr.signature });
            return Err(());
        }
        if mbr.part[0].is_empty() {
            return Err(());
        }
        Ok(mbr)
    }

    /// First 1 KiB block of partition 1's volume, in absolute disk blocks.
    pub fn first_partition_block(&self) -> u32 {
        self.part[0].lba_start / 2
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Write an MBR with a Linux first partition starting at `lba` into
    /// `image`.
    pub fn format(image: &mut [u8], lba: u32) {
        let mut mbr = Mbr {
            bootstrap: [0; 446],
            part: [PartitionEntry {
                status: 0,
                chs_start: [0; 3],
                typ: MBR_TYPE_EMPTY,
                chs_end: [0; 3],
                lba_start: 0,
                num_sectors: 0,
            }; 4],
            signature: MBR_SIGNATURE,
        };
        mbr.part[0].typ = MBR_TYPE_LINUX;
        mbr.part[0].status = 0x80;
        mbr.part[0].lba_start = lba;
        mbr.part[0].num_sectors = (image.len() / 512) as u32 - lba;
        image[..512].copy_from_slice(mbr.as_bytes());
    }

    #[test]
    fn parse_roundtrip() {
        let mut image = [0u8; 1024];
        format(&mut image, 2048);
        let mbr = Mbr::parse(&image).unwrap();
        assert_eq!({ mbr.part[0].lba_start }, 2048);
        assert_eq!(mbr.first_partition_block(), 1024);
        assert_eq!(mbr.part[0].typ, MBR_TYPE_LINUX);
    }

    #[test]
    fn bad_signature_rejected() {
        let image = [0u8; 1024];
        assert!(Mbr::parse(&image).is_err());
    }

    #[test]
    fn short_block_rejected() {
        assert!(Mbr::parse(&[0u8; 100]).is_err());
    }
}
