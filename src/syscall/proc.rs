//! Process-related system calls.

use crate::kernel::kernel;
use crate::param::KSTACKSIZE;
use crate::proc::myproc;

pub fn sys_fork() -> Result<usize, ()> {
    kernel().procs.fork().map(|pid| pid as usize)
}

pub fn sys_exit() -> Result<usize, ()> {
    kernel().procs.exit_current()
}

pub fn sys_wait() -> Result<usize, ()> {
    kernel().procs.wait().map(|pid| pid as usize)
}

pub fn sys_kill() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let pid = cur.arg_int(0)?;
    kernel().procs.kill(pid).map(|()| 0)
}

pub fn sys_getpid() -> Result<usize, ()> {
    Ok(myproc().ok_or(())?.pid() as usize)
}

/// Grow or shrink the user address space; returns the old break.
pub fn sys_sbrk() -> Result<usize, ()> {
    let mut cur = myproc().ok_or(())?;
    let n = cur.arg_int(0)?;
    let old = cur.size();

    let data = cur.data();
    let pgdir = data.pgdir.as_mut().ok_or(())?;
    if n > 0 {
        data.sz = pgdir.alloc_uvm(old, old.checked_add(n as usize).ok_or(())?)?;
    } else if n < 0 {
        let target = old.saturating_sub(n.unsigned_abs() as usize);
        data.sz = pgdir.dealloc_uvm(old, target);
    }

    // The mappings changed under us; reload them.
    let kstack_top = data.kstack + KSTACKSIZE;
    data.pgdir.as_ref().unwrap().switch_to(kstack_top);
    Ok(old)
}

/// Sleep for `n` ticks; interrupted by kill.
pub fn sys_sleep() -> Result<usize, ()> {
    let cur = myproc().ok_or(())?;
    let n = cur.arg_int(0)?;
    if n < 0 {
        return Err(());
    }

    let mut ticks = kernel().ticks.lock();
    let start = *ticks;
    while ticks.wrapping_sub(start) < n as u32 {
        if cur.killed() {
            return Err(());
        }
        ticks.sleep();
    }
    Ok(0)
}

pub fn sys_uptime() -> Result<usize, ()> {
    Ok(*kernel().ticks.lock() as usize)
}
