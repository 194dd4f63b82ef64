//! Pathname resolution.

use cstr_core::CStr;

use super::{FileName, FileSystem, InodeType, RcInode};

/// A slash-separated path. Contains no NUL bytes.
#[repr(transparent)]
pub struct Path {
    inner: [u8],
}

impl Path {
    pub fn new(cstr: &CStr) -> &Self {
        // SAFETY: a CStr's bytes contain no NUL.
        unsafe { Self::from_bytes(cstr.to_bytes()) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain NUL.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of
        // repr(transparent).
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    /// The final path component; empty for "/" and "".
    pub fn file_name(&self) -> &[u8] {
        self.inner
            .rsplit(|&c| c == b'/')
            .find(|s| !s.is_empty())
            .unwrap_or(b"")
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Split off the first path element.
    ///
    /// Returns the remainder (with no leading slashes) and the element's
    /// bytes, or `None` if no element remains.
    ///
    /// Examples:
    ///   skipelem("a/bb/c") = Some(("bb/c", "a"))
    ///   skipelem("///a//bb") = Some(("bb", "a"))
    ///   skipelem("a") = Some(("", "a"))
    ///   skipelem("") = skipelem("////") = None
    pub(crate) fn skipelem(&self) -> Option<(&Self, &[u8])> {
        let bytes = &self.inner;
        let start = bytes.iter().position(|&c| c != b'/')?;
        let bytes = &bytes[start..];

        let len = bytes
            .iter()
            .position(|&c| c == b'/')
            .unwrap_or(bytes.len());
        let elem = &bytes[..len];

        let rest = &bytes[len..];
        let next = rest
            .iter()
            .position(|&c| c != b'/')
            .unwrap_or(rest.len());
        // SAFETY: a subslice of self contains no NUL.
        Some((unsafe { Self::from_bytes(&rest[next..]) }, elem))
    }
}

impl FileSystem {
    /// Resolve `path` to its final inode. The result is referenced and
    /// unlocked.
    pub fn namei(&self, path: &Path) -> Result<RcInode, ()> {
        Ok(self.namex(path, false)?.0)
    }

    /// Resolve `path` to its parent directory and the unresolved final
    /// component. The parent is referenced and unlocked.
    pub fn nameiparent<'s>(&self, path: &'s Path) -> Result<(RcInode, &'s FileName), ()> {
        let (ip, name) = self.namex(path, true)?;
        Ok((ip, name.ok_or(())?))
    }

    /// Walk `path` from the root (absolute) or the current directory
    /// (relative), locking each directory only while looking up the next
    /// component. With `parent`, stop one level early and hand back the
    /// leaf name. Every returned inode is unlocked.
    fn namex<'s>(
        &self,
        mut path: &'s Path,
        parent: bool,
    ) -> Result<(RcInode, Option<&'s FileName>), ()> {
        let mut ip = if path.is_absolute() {
            self.root()
        } else {
            crate::proc::current_cwd().ok_or(())?
        };

        while let Some((rest, elem)) = path.skipelem() {
            // Over-long names fail resolution rather than being truncated.
            let name = FileName::new(elem)?;

            let mut guard = ip.lock();
            if guard.deref_inner().typ != InodeType::Dir {
                return Err(());
            }
            if parent && rest.is_empty() {
                // Stop one level early.
                drop(guard);
                return Ok((ip, Some(name)));
            }
            let (next, _) = guard.dirlookup(name)?;
            drop(guard);
            ip = next;
            path = rest;
        }

        if parent {
            return Err(());
        }
        Ok((ip, None))
    }
}
