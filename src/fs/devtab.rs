//! The device-inode registry, persisted as /etc/devtab.
//!
//! The ext2 inode of a character device carries only the S_IFCHR mode;
//! which driver it names lives in /etc/devtab, a line-oriented text file
//! of `inum<TAB>class<TAB>major<TAB>minor` records (text after `#` is a
//! comment). The table is parsed once at mount, before any user process
//! runs, so later `mknod` calls cannot race the parse; `mknod` appends a
//! line and installs the mapping under the table lock.
//!
//! The console must appear as `9 char 1 1`.

use arrayvec::ArrayString;
use core::fmt::Write;

use super::{FileSystem, Path};
use crate::lock::Spinlock;
use crate::param::NDEV;
use crate::println;

#[derive(Copy, Clone)]
struct Entry {
    inum: u32,
    major: u16,
    minor: u16,
}

pub struct DevTab {
    entries: Spinlock<[Option<Entry>; NDEV]>,
}

/// Longest devtab file the kernel will parse.
const DEVTAB_MAX: usize = 1024;

impl DevTab {
    pub const fn new() -> Self {
        Self {
            entries: Spinlock::new("devtab", [None; NDEV]),
        }
    }

    /// Major/minor of the device inode `inum`.
    pub fn lookup(&self, inum: u32) -> Option<(u16, u16)> {
        self.entries
            .lock()
            .iter()
            .flatten()
            .find(|e| e.inum == inum)
            .map(|e| (e.major, e.minor))
    }

    /// Install (or update) the mapping for `inum`.
    pub fn register(&self, inum: u32, major: u16, minor: u16) {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.inum == inum))
            .or_else(|| entries.iter().position(|e| e.is_none()));
        match pos {
            Some(i) => entries[i] = Some(Entry { inum, major, minor }),
            None => println!("devtab: table full, dropping inum {}", inum),
        }
    }

    /// Parse devtab text, installing each record.
    pub fn parse(&self, text: &[u8]) {
        for line in text.split(|&c| c == b'\n') {
            let line = match line.iter().position(|&c| c == b'#') {
                Some(hash) => &line[..hash],
                None => line,
            };
            let Ok(line) = core::str::from_utf8(line) else {
                continue;
            };
            let mut fields = line.split_whitespace();
            let (Some(inum), Some(class), Some(major), Some(minor)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if class != "char" {
                continue;
            }
            let (Ok(inum), Ok(major), Ok(minor)) =
                (inum.parse::<u32>(), major.parse::<u16>(), minor.parse::<u16>())
            else {
                continue;
            };
            self.register(inum, major, minor);
        }
    }

    /// Read /etc/devtab from the mounted volume and install its records.
    pub fn load(&self, fs: &FileSystem) {
        // SAFETY: the literal contains no NUL.
        let path = unsafe { Path::from_bytes(b"/etc/devtab") };
        let Ok(ip) = fs.namei(path) else {
            println!("devtab: /etc/devtab missing");
            return;
        };

        let mut buf = [0u8; DEVTAB_MAX];
        let mut guard = ip.lock();
        let n = guard.readi(&mut buf, 0).unwrap_or(0);
        drop(guard);
        drop(ip);

        self.parse(&buf[..n]);
    }

    /// Append a `mknod`-created device to /etc/devtab and install it.
    pub fn append(&self, fs: &FileSystem, inum: u32, major: u16, minor: u16, path: &Path) {
        self.register(inum, major, minor);

        let mut line = ArrayString::<192>::new();
        let name = core::str::from_utf8(path.as_bytes()).unwrap_or("?");
        if write!(line, "{}\tchar\t{}\t{}\t#{}\n", inum, major, minor, name).is_err() {
            return;
        }

        // SAFETY: the literal contains no NUL.
        let devtab_path = unsafe { Path::from_bytes(b"/etc/devtab") };
        let Ok(ip) = fs.namei(devtab_path) else {
            return;
        };
        let mut guard = ip.lock();
        let size = guard.deref_inner().size;
        let _ = guard.writei(line.as_bytes(), size);
    }
}
