//! File-related system calls, and the path-level operations they are
//! built from (create, unlink, link).

use arrayvec::ArrayVec;
use cstr_core::CStr;
use zerocopy::AsBytes;

use crate::exec::exec;
use crate::fcntl::FcntlFlags;
use crate::file::FileType;
use crate::fs::{FileName, InodeType, Path, RcInode, Stat};
use crate::kernel::kernel;
use crate::param::MAXARG;
use crate::proc::myproc;

/// Create `path` as a `typ` inode, linked into its parent directory.
/// A directory gets its "." and ".." entries; open(O_CREATE) of an
/// existing regular file yields the existing inode. The result is
/// referenced and unlocked.
pub(crate) fn create(path: &Path, typ: InodeType) -> Result<RcInode, ()> {
    let fs = &kernel().fs;
    let (dp, name) = fs.nameiparent(path)?;
    let mut dguard = dp.lock();

    if let Ok((ip, _)) = dguard.dirlookup(name) {
        drop(dguard);
        drop(dp);
        let iguard = ip.lock();
        let exists_ok =
            matches!(typ, InodeType::File) && iguard.deref_inner().typ == InodeType::File;
        drop(iguard);
        return if exists_ok { Ok(ip) } else { Err(()) };
    }

    let ip = kernel().itable().alloc_inode(dp.dev, typ)?;
    let mut iguard = ip.lock();
    iguard.deref_inner_mut().typ = typ;
    iguard.deref_inner_mut().nlink = 1;
    iguard.update();

    if matches!(typ, InodeType::Dir) {
        // The new directory's ".." counts against the parent.
        dguard.deref_inner_mut().nlink += 1;
        dguard.update();

        let dot = FileName::new(b".").unwrap();
        let dotdot = FileName::new(b"..").unwrap();
        iguard.dirlink(dot, ip.inum).expect("create dots");
        iguard.dirlink(dotdot, dp.inum).expect("create dots");
    }

    dguard.dirlink(name, ip.inum).expect("create: dirlink");
    drop(iguard);
    drop(dguard);
    Ok(ip)
}

/// Remove `path`'s directory entry; the inode itself dies when its link
/// and reference counts run out. Refuses "."/".." and non-empty
/// directories.
pub(crate) fn unlink_path(path: &Path) -> Result<(), ()> {
    let fs = &kernel().fs;
    let (dp, name) = fs.nameiparent(path)?;
    let mut dguard = dp.lock();

    if *name == b"."[..] || *name == b".."[..] {
        return Err(());
    }

    let (ip, off) = dguard.dirlookup(name)?;
    let mut iguard = ip.lock();
    assert!(iguard.deref_inner().nlink >= 1, "unlink: nlink < 1");

    let is_dir = iguard.deref_inner().typ == InodeType::Dir;
    if is_dir && !iguard.is_dir_empty() {
        return Err(());
    }

    // Kill the record in place, preserving its rec_len so the chain
    // stays walkable.
    let (mut header, _) = dguard.read_entry(off);
    header.inode = 0;
    header.name_len = 0;
    if dguard.writei(header.as_bytes(), off) != Ok(core::mem::size_of_val(&header)) {
        panic!("unlink: writei");
    }

    if is_dir {
        dguard.deref_inner_mut().nlink -= 1;
        dguard.update();
    }
    drop(dguard);
    drop(dp);

    iguard.deref_inner_mut().nlink -= 1;
    iguard.update();
    drop(iguard);
    drop(ip);
    Ok(())
}

/// Make `new` another name for the file at `old`. Directories cannot be
/// linked.
pub(crate) fn link_path(old: &Path, new: &Path) -> Result<(), ()> {
    let fs = &kernel().fs;

    let ip = fs.namei(old)?;
    let mut iguard = ip.lock();
    if iguard.deref_inner().typ == InodeType::Dir {
        return Err(());
    }
    iguard.deref_inner_mut().nlink += 1;
    iguard.update();
    drop(iguard);

    let rollback = |ip: &RcInode| {
        let mut iguard = ip.lock();
        iguard.deref_inner_mut().nlink -= 1;
        iguard.update();
    };

    let Ok((dp, name)) = fs.nameiparent(new) else {
        rollback(&ip);
        return Err(());
    };
    let mut dguard = dp.lock();
    if dp.dev != ip.dev || dguard.dirlink(name, ip.inum).is_err() {
        drop(dguard);
        rollback(&ip);
        return Err(());
    }
    Ok(())
}

pub fn sys_open() -> Result<usize, ()> {
    let mut cur = myproc().ok_or(())?;
    let path = Path::new(cur.arg_str(0)?);
    let omode = FcntlFlags::from_bits_truncate(cur.arg_int(1)?);

    let ip = if omode.contains(FcntlFlags::O_CREATE) {
        create(path, InodeType::File)?
    } else {
        let ip = kernel().fs.namei(path)?;
        let guard = ip.lock();
        // Directories only open read-only.
        if guard.deref_inner().typ == InodeType::Dir && omode != FcntlFlags::O_RDONLY {
            return Err(());
        }
        drop(guard);
        ip
    };

    let file = kernel().ftable().alloc_file(
        FileType::Inode {
            ip,
            off: core::cell::UnsafeCell::new(0),
        },
        omode.readable(),
        omode.writable(),
    )?;
    cur.fd_alloc(file)
}

pub fn sys_close() -> Result<usize, ()> {
    let mut cur = myproc().ok_or(())?;
    let (fd, file) = cur.arg_fd(0)?;
    drop(file);
    cur.data().open_files[fd] = None;
    Ok(0)
}

pub fn sys_read() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let (_, file) = cur.arg_fd(0)?;
    let n = cur.arg_int(2)?;
    if n < 0 {
        return Err(());
    }
    let buf = cur.arg_buf(1, n as usize)?;
    file.read(buf)
}

pub fn sys_write() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let (_, file) = cur.arg_fd(0)?;
    let n = cur.arg_int(2)?;
    if n < 0 {
        return Err(());
    }
    let buf = cur.arg_buf(1, n as usize)?;
    file.write(buf)
}

pub fn sys_dup() -> Result<usize, ()> {
    let mut cur = myproc().ok_or(())?;
    let (_, file) = cur.arg_fd(0)?;
    cur.fd_alloc(file)
}

pub fn sys_fstat() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let (_, file) = cur.arg_fd(0)?;
    let dst = cur.arg_buf(1, core::mem::size_of::<Stat>())?;
    let st = file.stat()?;
    // SAFETY: Stat is plain data and dst is exactly its size.
    let bytes = unsafe {
        core::slice::from_raw_parts(&st as *const Stat as *const u8, core::mem::size_of::<Stat>())
    };
    dst.copy_from_slice(bytes);
    Ok(0)
}

pub fn sys_pipe() -> Result<usize, ()> {
    let mut cur = myproc().ok_or(())?;
    // Validate the fd array before allocating anything.
    let addr = cur.arg_int(0)? as usize;
    cur.user_slice(addr, 2 * core::mem::size_of::<i32>())?;

    let (rf, wf) = kernel().allocate_pipe()?;
    let fd0 = cur.fd_alloc(rf)?;
    let fd1 = match cur.fd_alloc(wf) {
        Ok(fd) => fd,
        Err(()) => {
            cur.data().open_files[fd0] = None;
            return Err(());
        }
    };

    let dst = cur.user_slice(addr, 2 * core::mem::size_of::<i32>())?;
    dst[..4].copy_from_slice(&(fd0 as i32).to_le_bytes());
    dst[4..].copy_from_slice(&(fd1 as i32).to_le_bytes());
    Ok(0)
}

pub fn sys_chdir() -> Result<usize, ()> {
    let mut cur = myproc().ok_or(())?;
    let path = Path::new(cur.arg_str(0)?);

    let ip = kernel().fs.namei(path)?;
    let guard = ip.lock();
    if guard.deref_inner().typ != InodeType::Dir {
        return Err(());
    }
    drop(guard);
    cur.data().cwd = Some(ip);
    Ok(0)
}

pub fn sys_mkdir() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let path = Path::new(cur.arg_str(0)?);
    let ip = create(path, InodeType::Dir)?;
    drop(ip);
    Ok(0)
}

pub fn sys_mknod() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let path = Path::new(cur.arg_str(0)?);
    let major = cur.arg_int(1)?;
    let minor = cur.arg_int(2)?;
    if major < 0 || minor < 0 {
        return Err(());
    }

    let ip = create(
        path,
        InodeType::Device {
            major: major as u16,
            minor: minor as u16,
        },
    )?;
    if major != 0 || minor != 0 {
        kernel()
            .devtab
            .append(&kernel().fs, ip.inum, major as u16, minor as u16, path);
    }
    drop(ip);
    Ok(0)
}

pub fn sys_unlink() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let path = Path::new(cur.arg_str(0)?);
    unlink_path(path)?;
    Ok(0)
}

pub fn sys_link() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let old = Path::new(cur.arg_str(0)?);
    let new = Path::new(cur.arg_str(1)?);
    link_path(old, new)?;
    Ok(0)
}

pub fn sys_exec() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let path = Path::new(cur.arg_str(0)?);
    let uargv = cur.arg_int(1)? as usize;

    let mut argv: ArrayVec<&CStr, MAXARG> = ArrayVec::new();
    for i in 0.. {
        if i >= MAXARG {
            return Err(());
        }
        let uarg = cur.fetch_usize(uargv + 4 * i)?;
        if uarg == 0 {
            break;
        }
        argv.push(cur.fetch_str(uarg)?);
    }
    exec(path, &argv)
}
