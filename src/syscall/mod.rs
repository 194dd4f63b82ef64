//! System calls: argument fetch, validation and dispatch.
//!
//! The user invokes `int T_SYSCALL` with the call number in %eax and the
//! arguments on the user stack. Every user address crossing into the
//! kernel is checked against the process size first; a bad pointer is a
//! plain -1, never a kernel fault.

use cstr_core::CStr;

use crate::arch::TrapFrame;
use crate::file::RcFile;
use crate::param::NOFILE;
use crate::println;
use crate::proc::{myproc, CurrentProc};

pub mod file;
pub mod proc;

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_PIPE: usize = 4;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_FSTAT: usize = 8;
pub const SYS_CHDIR: usize = 9;
pub const SYS_DUP: usize = 10;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_OPEN: usize = 15;
pub const SYS_WRITE: usize = 16;
pub const SYS_MKNOD: usize = 17;
pub const SYS_UNLINK: usize = 18;
pub const SYS_LINK: usize = 19;
pub const SYS_MKDIR: usize = 20;
pub const SYS_CLOSE: usize = 21;

/// Decode and run the system call in `tf`; the result (or -1) goes back
/// in %eax.
pub fn dispatch(tf: &mut TrapFrame) {
    let num = tf.eax as usize;
    let r = match num {
        SYS_FORK => proc::sys_fork(),
        SYS_EXIT => proc::sys_exit(),
        SYS_WAIT => proc::sys_wait(),
        SYS_PIPE => file::sys_pipe(),
        SYS_READ => file::sys_read(),
        SYS_KILL => proc::sys_kill(),
        SYS_EXEC => file::sys_exec(),
        SYS_FSTAT => file::sys_fstat(),
        SYS_CHDIR => file::sys_chdir(),
        SYS_DUP => file::sys_dup(),
        SYS_GETPID => proc::sys_getpid(),
        SYS_SBRK => proc::sys_sbrk(),
        SYS_SLEEP => proc::sys_sleep(),
        SYS_UPTIME => proc::sys_uptime(),
        SYS_OPEN => file::sys_open(),
        SYS_WRITE => file::sys_write(),
        SYS_MKNOD => file::sys_mknod(),
        SYS_UNLINK => file::sys_unlink(),
        SYS_LINK => file::sys_link(),
        SYS_MKDIR => file::sys_mkdir(),
        SYS_CLOSE => file::sys_close(),
        _ => {
            let cur = myproc().expect("syscall");
            println!("{} {}: unknown sys call {}", cur.pid(), cur.name(), num);
            Err(())
        }
    };
    tf.eax = match r {
        Ok(v) => v as u32,
        Err(()) => u32::MAX,
    };
}

impl CurrentProc {
    /// Fetch the word at user address `addr`.
    pub fn fetch_usize(&self, addr: usize) -> Result<usize, ()> {
        let sz = self.size();
        if addr >= sz || addr.checked_add(4).map_or(true, |end| end > sz) {
            return Err(());
        }
        // SAFETY: bounds-checked, and this process's page directory is
        // the one installed.
        Ok(unsafe { core::ptr::read_unaligned(addr as *const u32) } as usize)
    }

    /// Fetch the NUL-terminated string at user address `addr`. The NUL
    /// must lie within the address space.
    pub fn fetch_str(&self, addr: usize) -> Result<&CStr, ()> {
        let sz = self.size();
        if addr >= sz {
            return Err(());
        }
        // SAFETY: [addr, sz) is user memory of the installed directory.
        let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, sz - addr) };
        let nul = bytes.iter().position(|&c| c == 0).ok_or(())?;
        CStr::from_bytes_with_nul(&bytes[..=nul]).map_err(|_| ())
    }

    /// The raw nth system call argument, from the user stack.
    fn arg_raw(&self, n: usize) -> Result<usize, ()> {
        // SAFETY: the trap frame sits on this process's kernel stack.
        let esp = unsafe { (*self.data_ref().trap_frame).esp } as usize;
        self.fetch_usize(esp + 4 + 4 * n)
    }

    /// The nth argument as a 32-bit integer.
    pub fn arg_int(&self, n: usize) -> Result<i32, ()> {
        Ok(self.arg_raw(n)? as i32)
    }

    /// The user buffer [addr, addr+len) as a slice, fully validated.
    pub fn user_slice(&self, addr: usize, len: usize) -> Result<&mut [u8], ()> {
        let sz = self.size();
        if addr >= sz || addr.checked_add(len).map_or(true, |end| end > sz) {
            return Err(());
        }
        // SAFETY: bounds-checked user memory of the installed directory.
        // The kernel is the only thread touching it during this call.
        Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
    }

    /// The nth argument as a user buffer of length `len`.
    pub fn arg_buf(&self, n: usize, len: usize) -> Result<&mut [u8], ()> {
        let addr = self.arg_raw(n)?;
        self.user_slice(addr, len)
    }

    /// The nth argument as a string.
    pub fn arg_str(&self, n: usize) -> Result<&CStr, ()> {
        let addr = self.arg_raw(n)?;
        self.fetch_str(addr)
    }

    /// The nth argument as a file descriptor; returns a new handle on the
    /// open file.
    pub fn arg_fd(&self, n: usize) -> Result<(usize, RcFile), ()> {
        let fd = self.arg_int(n)?;
        if fd < 0 || fd as usize >= NOFILE {
            return Err(());
        }
        let file = self.data_ref().open_files[fd as usize]
            .as_ref()
            .cloned()
            .ok_or(())?;
        Ok((fd as usize, file))
    }

    /// Put `file` in the first free descriptor slot.
    pub fn fd_alloc(&mut self, file: RcFile) -> Result<usize, ()> {
        let files = &mut self.data().open_files;
        for (fd, slot) in files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd);
            }
        }
        Err(())
    }
}
