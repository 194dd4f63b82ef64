//! File-system tests against a RAM-backed volume built by `mkfs`.

use proptest::prelude::*;
use std::format;
use std::string::String;
use std::vec;
use std::vec::Vec;

use super::inode::Dinode;
use super::mkfs::{free_block_count, mount_fresh};
use super::{
    balloc, bfree, geo, group_desc, FileName, FileSystem, InodeType, Path, RcInode, DIND_SLOT,
    IND_SLOT, NDIRECT, ROOT_INUM,
};
use crate::kernel::kernel;
use crate::kernel::test_util::serial;
use crate::param::BSIZE;
use crate::syscall::file::{create, link_path, unlink_path};
use zerocopy::FromBytes;

fn path(s: &str) -> &Path {
    // SAFETY: test paths contain no NUL.
    unsafe { Path::from_bytes(s.as_bytes()) }
}

fn name(s: &str) -> &FileName {
    FileName::new(s.as_bytes()).unwrap()
}

/// Allocate a fresh regular file inode with one link, so dropping
/// handles does not free it.
fn new_file(fs: &FileSystem) -> RcInode {
    let ip = kernel()
        .itable()
        .alloc_inode(fs.device(), InodeType::File)
        .unwrap();
    let mut guard = ip.lock();
    guard.deref_inner_mut().nlink = 1;
    guard.update();
    drop(guard);
    ip
}

/// The raw on-disk inode, bypassing the cache state.
fn dinode_raw(dev: u32, inum: u32) -> Dinode {
    let g = geo(dev);
    let desc = group_desc(dev, g.group_of_inum(inum));
    let index = g.index_of_inum(inum);
    let block = g.abs(desc.inode_table + index / g.inodes_per_block());
    let offset = ((index % g.inodes_per_block()) * g.inode_size) as usize;
    let bp = kernel().bcache().read(dev, block);
    Dinode::read_from_prefix(&bp.deref_inner().data.bytes()[offset..]).unwrap()
}

#[test]
fn mount_reads_geometry() {
    let _serial = serial();
    let (fs, dev) = mount_fresh(256);
    let g = fs.geometry();
    assert_eq!(g.dev, dev);
    assert_eq!(g.first_block, 1);
    assert_eq!(g.blocks_count, 256);
    assert_eq!(g.inode_size, 128);
    assert_eq!(g.group_count, 1);
}

#[test]
fn root_has_dot_entries() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);
    let root = fs.root();
    let mut guard = root.lock();
    assert_eq!(guard.deref_inner().typ, InodeType::Dir);
    let (ip, _) = guard.dirlookup(name(".")).unwrap();
    assert_eq!(ip.inum, ROOT_INUM);
    let (ip, _) = guard.dirlookup(name("..")).unwrap();
    assert_eq!(ip.inum, ROOT_INUM);
    assert!(guard.is_dir_empty());
}

#[test]
fn write_read_roundtrip_across_blocks() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);
    let ip = new_file(fs);
    let mut guard = ip.lock();

    let data: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
    assert_eq!(guard.writei(&data, 0), Ok(3000));
    assert_eq!(guard.deref_inner().size, 3000);

    // Unaligned overwrite crossing a block boundary.
    assert_eq!(guard.writei(b"overwrite", BSIZE as u32 - 4), Ok(9));

    let mut back = vec![0u8; 3000];
    assert_eq!(guard.readi(&mut back, 0), Ok(3000));
    let mut expect = data;
    expect[BSIZE - 4..BSIZE + 5].copy_from_slice(b"overwrite");
    assert_eq!(back, expect);

    // Reads past the end clamp.
    let mut tail = [0u8; 64];
    assert_eq!(guard.readi(&mut tail, 2990), Ok(10));
}

#[test]
fn holes_read_as_zeroes() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);
    let ip = new_file(fs);
    let mut guard = ip.lock();

    assert_eq!(guard.writei(b"tail", 5000), Ok(4));
    assert_eq!(guard.deref_inner().size, 5004);

    let mut back = vec![0xFFu8; 5004];
    assert_eq!(guard.readi(&mut back, 0), Ok(5004));
    assert!(back[..5000].iter().all(|&b| b == 0));
    assert_eq!(&back[5000..], b"tail");

    // The holes stayed holes: only the written block was allocated.
    assert_eq!(guard.deref_inner().addrs[0], 0);
}

#[test]
fn indirect_allocated_only_past_ndirect() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);
    let ip = new_file(fs);
    let mut guard = ip.lock();

    let block = vec![0x42u8; BSIZE];
    for bn in 0..NDIRECT {
        assert_eq!(guard.writei(&block, (bn * BSIZE) as u32), Ok(BSIZE));
    }
    assert_eq!(guard.deref_inner().addrs[IND_SLOT], 0);

    // One more block crosses into the single-indirect tier.
    assert_eq!(guard.writei(&block, (NDIRECT * BSIZE) as u32), Ok(BSIZE));
    assert_ne!(guard.deref_inner().addrs[IND_SLOT], 0);

    let mut back = vec![0u8; BSIZE];
    assert_eq!(guard.readi(&mut back, (NDIRECT * BSIZE) as u32), Ok(BSIZE));
    assert_eq!(back, block);
}

#[test]
fn cross_indirect_write_allocates_expected_tables() {
    let _serial = serial();
    let (fs, dev) = mount_fresh(1024);
    let ip = new_file(fs);
    let mut guard = ip.lock();

    let before = free_block_count(dev);

    // Lands in the double-indirect tier: block index 12 + 256 + 5.
    let off = (12 * 1024 + 256 * 1024 + 5 * 1024) as u32;
    assert_eq!(guard.writei(b"hello", off), Ok(5));

    // Exactly one data block, one double-indirect table and one
    // mid-level table were allocated.
    assert_eq!(before - free_block_count(dev), 3);
    assert_ne!(guard.deref_inner().addrs[DIND_SLOT], 0);
    assert_eq!(guard.deref_inner().addrs[IND_SLOT], 0);

    let mut back = [0u8; 5];
    assert_eq!(guard.readi(&mut back, off), Ok(5));
    assert_eq!(&back, b"hello");
}

#[test]
fn finalize_truncates_and_frees_on_disk() {
    let _serial = serial();
    let (fs, dev) = mount_fresh(1024);
    let baseline = free_block_count(dev);

    let ip = kernel()
        .itable()
        .alloc_inode(fs.device(), InodeType::File)
        .unwrap();
    let inum = ip.inum;

    let mut guard = ip.lock();
    let block = vec![0x17u8; BSIZE];
    // Direct, single-indirect and double-indirect tiers all in play.
    for bn in [0usize, 5, 13, 300] {
        assert_eq!(guard.writei(&block, (bn * BSIZE) as u32), Ok(BSIZE));
    }
    assert!(free_block_count(dev) < baseline);
    drop(guard);

    // Last reference, nlink == 0: everything returns to the bitmaps.
    drop(ip);
    assert_eq!(free_block_count(dev), baseline);

    let din = dinode_raw(dev, inum);
    assert_eq!(din.mode, 0);
    assert_eq!(din.size, 0);
    assert!(din.block.iter().all(|&b| b == 0));
}

#[test]
fn dirlink_lookup_and_namei() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);

    let ip = create(path("/hello.txt"), InodeType::File).unwrap();
    let inum = ip.inum;
    drop(ip);

    let root = fs.root();
    let mut guard = root.lock();
    let (found, _) = guard.dirlookup(name("hello.txt")).unwrap();
    assert_eq!(found.inum, inum);
    assert!(!guard.is_dir_empty());
    drop(guard);

    let by_path = fs.namei(path("/hello.txt")).unwrap();
    assert_eq!(by_path.inum, inum);

    assert!(fs.namei(path("/nonexistent")).is_err());
}

#[test]
fn unlink_removes_name_but_keeps_chain() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);

    drop(create(path("/a"), InodeType::File).unwrap());
    drop(create(path("/b"), InodeType::File).unwrap());
    drop(create(path("/c"), InodeType::File).unwrap());

    unlink_path(path("/b")).unwrap();
    assert!(fs.namei(path("/b")).is_err());
    // Entries on both sides of the dead record still resolve.
    assert!(fs.namei(path("/a")).is_ok());
    assert!(fs.namei(path("/c")).is_ok());

    // And the slot's space does not confuse later links.
    drop(create(path("/d"), InodeType::File).unwrap());
    assert!(fs.namei(path("/d")).is_ok());
}

#[test]
fn unlink_while_open_keeps_data_until_close() {
    let _serial = serial();
    let (fs, dev) = mount_fresh(256);
    let baseline = free_block_count(dev);

    let ip = create(path("/x"), InodeType::File).unwrap();
    let chunk = vec![0xABu8; 8 * 1024];
    {
        let mut guard = ip.lock();
        assert_eq!(guard.writei(&chunk, 0), Ok(8 * 1024));
    }

    unlink_path(path("/x")).unwrap();
    assert!(fs.namei(path("/x")).is_err());

    // The open reference still reads and writes all 16 KiB.
    {
        let mut guard = ip.lock();
        assert_eq!(guard.writei(&chunk, 8 * 1024), Ok(8 * 1024));
        let mut back = vec![0u8; 16 * 1024];
        assert_eq!(guard.readi(&mut back, 0), Ok(16 * 1024));
        assert!(back.iter().all(|&b| b == 0xAB));
    }

    // Closing the last reference frees the data blocks.
    drop(ip);
    assert_eq!(free_block_count(dev), baseline);
}

#[test]
fn namei_and_nameiparent_agree() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);

    drop(create(path("/etc"), InodeType::Dir).unwrap());
    drop(create(path("/etc/rc.d"), InodeType::Dir).unwrap());
    drop(create(path("/etc/rc.d/rc.local"), InodeType::File).unwrap());

    for p in ["/etc", "/etc/rc.d", "/etc/rc.d/rc.local", "//etc///rc.d//"] {
        let final_ip = fs.namei(path(p)).unwrap();
        let (parent, leaf) = fs.nameiparent(path(p)).unwrap();
        let mut guard = parent.lock();
        let (via_parent, _) = guard.dirlookup(leaf).unwrap();
        assert_eq!(via_parent.inum, final_ip.inum, "path {}", p);
    }
}

#[test]
fn dir_link_counts_and_empty_check() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);

    drop(create(path("/sub"), InodeType::Dir).unwrap());
    let root = fs.root();
    {
        // ".." in /sub counts against the root.
        let guard = root.lock();
        assert_eq!(guard.deref_inner().nlink, 3);
    }

    let sub = fs.namei(path("/sub")).unwrap();
    {
        let mut guard = sub.lock();
        assert_eq!(guard.deref_inner().nlink, 1);
        assert!(guard.is_dir_empty());
    }

    drop(create(path("/sub/file"), InodeType::File).unwrap());
    {
        let mut guard = sub.lock();
        assert!(!guard.is_dir_empty());
    }

    // A populated directory cannot be unlinked.
    assert!(unlink_path(path("/sub")).is_err());
    unlink_path(path("/sub/file")).unwrap();
    unlink_path(path("/sub")).unwrap();
    {
        let guard = root.lock();
        assert_eq!(guard.deref_inner().nlink, 2);
    }
    assert!(fs.namei(path("/sub")).is_err());
}

#[test]
fn link_shares_inode_and_unlink_keeps_it_alive() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);

    let ip = create(path("/orig"), InodeType::File).unwrap();
    {
        let mut guard = ip.lock();
        guard.writei(b"shared", 0).unwrap();
    }
    drop(ip);

    link_path(path("/orig"), path("/alias")).unwrap();
    let a = fs.namei(path("/orig")).unwrap();
    let b = fs.namei(path("/alias")).unwrap();
    assert_eq!(a.inum, b.inum);
    {
        let guard = a.lock();
        assert_eq!(guard.deref_inner().nlink, 2);
    }
    drop((a, b));

    unlink_path(path("/orig")).unwrap();
    let b = fs.namei(path("/alias")).unwrap();
    let mut guard = b.lock();
    let mut back = [0u8; 6];
    assert_eq!(guard.readi(&mut back, 0), Ok(6));
    assert_eq!(&back, b"shared");

    // Directories refuse to be linked.
    drop(guard);
    drop(b);
    assert!(link_path(path("/"), path("/rootlink")).is_err());
}

#[test]
fn overlong_component_fails_resolution() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);
    let long = format!("/{}", "x".repeat(300));
    assert!(fs.namei(path(&long)).is_err());
    assert!(create(path(&long), InodeType::File).is_err());

    // 255 bytes is still legal.
    let edge = format!("/{}", "y".repeat(255));
    drop(create(path(&edge), InodeType::File).unwrap());
    assert!(fs.namei(path(&edge)).is_ok());
}

#[test]
fn relative_path_without_process_fails() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);
    assert!(fs.namei(path("no/cwd/here")).is_err());
}

#[test]
fn create_existing_semantics() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);

    let a = create(path("/f"), InodeType::File).unwrap();
    // O_CREATE of an existing file reuses the inode.
    let b = create(path("/f"), InodeType::File).unwrap();
    assert_eq!(a.inum, b.inum);

    // But an existing name blocks a directory or device creation.
    assert!(create(path("/f"), InodeType::Dir).is_err());
    drop(create(path("/d"), InodeType::Dir).unwrap());
    assert!(create(path("/d"), InodeType::File).is_err());
    let _ = fs;
}

#[test]
fn disk_inode_exhaustion_is_an_error() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);

    // Inodes 1 and 2 are reserved by mkfs; the rest are ours.
    let mut made = 0;
    loop {
        match kernel().itable().alloc_inode(fs.device(), InodeType::File) {
            Ok(ip) => {
                let mut guard = ip.lock();
                guard.deref_inner_mut().nlink = 1;
                guard.update();
                made += 1;
            }
            Err(()) => break,
        }
    }
    assert_eq!(made, 126);
}

#[test]
#[should_panic(expected = "bfree: block already free")]
fn double_free_is_fatal() {
    let _serial = serial();
    let (fs, dev) = mount_fresh(256);
    let _ = fs;
    let rel = balloc(dev, 0).unwrap();
    bfree(dev, rel);
    bfree(dev, rel);
}

#[test]
fn devtab_loads_from_volume() {
    let _serial = serial();
    let (fs, _) = mount_fresh(256);

    drop(create(path("/etc"), InodeType::Dir).unwrap());
    let ip = create(path("/etc/devtab"), InodeType::File).unwrap();
    {
        let mut guard = ip.lock();
        guard.writei(b"9\tchar\t1\t1\t#/dev/console\n", 0).unwrap();
    }
    drop(ip);

    let devtab = super::DevTab::new();
    devtab.load(fs);
    assert_eq!(devtab.lookup(9), Some((1, 1)));
}

#[test]
fn devtab_parse_and_lookup() {
    let _serial = serial();
    let devtab = super::DevTab::new();
    devtab.parse(b"9\tchar\t1\t1\t#/dev/console\n# full comment line\nnot a record\n12\tblock\t3\t0\n15\tchar\t2\t7\n");
    assert_eq!(devtab.lookup(9), Some((1, 1)));
    // Non-"char" classes and junk lines are ignored.
    assert_eq!(devtab.lookup(12), None);
    assert_eq!(devtab.lookup(15), Some((2, 7)));
    assert_eq!(devtab.lookup(99), None);
}

#[test]
fn path_decomposition() {
    let cases: [(&str, &[&str]); 5] = [
        ("a/bb/c", &["a", "bb", "c"]),
        ("///a//bb", &["a", "bb"]),
        ("a", &["a"]),
        ("", &[]),
        ("////", &[]),
    ];
    for (input, want) in cases {
        let mut p = path(input);
        let mut got: Vec<String> = Vec::new();
        while let Some((rest, elem)) = p.skipelem() {
            got.push(String::from_utf8(elem.to_vec()).unwrap());
            p = rest;
        }
        assert_eq!(got, *want, "input {:?}", input);
    }

    assert_eq!(path("/etc/rc.d/rc.local").file_name(), b"rc.local");
    assert_eq!(path("/etc/").file_name(), b"etc");
    assert_eq!(path("/").file_name(), b"");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Sequential and overlapping writes followed by reads behave like a
    /// growable byte vector.
    #[test]
    fn writei_readi_match_model(
        ops in proptest::collection::vec((0u32..200_000, 1usize..4000, any::<u8>()), 1..12)
    ) {
        let _serial = serial();
        let (fs, _) = mount_fresh(1024);
        let ip = new_file(fs);
        let mut guard = ip.lock();
        let mut model: Vec<u8> = Vec::new();

        for (off, len, fill) in ops {
            // Keep offsets near the written region so the image stays
            // small, while still crossing block boundaries freely.
            let off = (off as usize).min(model.len() + 3 * BSIZE) as u32;
            let data = vec![fill; len];
            prop_assert_eq!(guard.writei(&data, off), Ok(len));

            let end = off as usize + len;
            if end > model.len() {
                model.resize(end, 0);
            }
            model[off as usize..end].copy_from_slice(&data);

            prop_assert_eq!(guard.deref_inner().size as usize, model.len());
            let mut back = vec![0u8; model.len()];
            prop_assert_eq!(guard.readi(&mut back, 0), Ok(model.len()));
            prop_assert_eq!(&back, &model);
        }
    }

    /// Every linked name can be looked up again and resolves to the inode
    /// it was linked as.
    #[test]
    fn dirents_roundtrip(
        names in proptest::collection::btree_set("[a-zA-Z0-9_.-]{1,40}", 1..12)
    ) {
        let _serial = serial();
        let (fs, _) = mount_fresh(1024);
        let names: Vec<_> = names
            .into_iter()
            .filter(|n| n != "." && n != "..")
            .collect();

        let mut inums = Vec::new();
        for n in &names {
            let p = format!("/{}", n);
            let ip = create(path(&p), InodeType::File).unwrap();
            inums.push(ip.inum);
        }

        let root = fs.root();
        let mut guard = root.lock();
        for (n, inum) in names.iter().zip(&inums) {
            let (found, _) = guard.dirlookup(name(n)).unwrap();
            prop_assert_eq!(found.inum, *inum, "name {}", n);
        }
    }
}
