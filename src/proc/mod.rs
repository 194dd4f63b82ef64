//! Processes.

use core::cell::UnsafeCell;
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::arch::{Context, TrapFrame};
use crate::cpu::CPUS;
use crate::file::RcFile;
use crate::fs::RcInode;
use crate::lock::{RawSpinlock, RemoteLock};
use crate::param::{MAXPROCNAME, NOFILE};
use crate::vm::PageDir;

mod procs;
mod wait_channel;

pub use procs::Procs;
pub use wait_channel::WaitChannel;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    fn as_str(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// A generation-stamped reference to a process-table slot. Slot reuse
/// bumps the epoch, so a stale handle dereferences to nothing instead of
/// to an unrelated process.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ProcHandle {
    pub idx: usize,
    pub epoch: u32,
}

/// Scheduler-visible process state. Lives under the process-table
/// spinlock; see `Procs`.
pub struct ProcInfo {
    pub state: ProcState,

    pub pid: Pid,

    /// If sleeping, the channel slept on; otherwise 0.
    pub chan: usize,

    /// Parent process.
    pub parent: Option<ProcHandle>,

    /// This slot's generation stamp.
    pub epoch: u32,
}

/// State private to the process: only the process itself touches it while
/// it runs, and only the reaper touches it once the process is a zombie.
pub struct ProcData {
    /// Bottom of the kernel stack for this process.
    pub kstack: usize,

    /// Size of user memory, in bytes.
    pub sz: usize,

    /// User page directory.
    pub pgdir: Option<PageDir>,

    /// Trap frame at the top of the kernel stack.
    pub trap_frame: *mut TrapFrame,

    /// swtch() here to run the process.
    pub context: *mut Context,

    /// Current directory.
    pub cwd: Option<RcInode>,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Process name, for debugging.
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            pgdir: None,
            trap_frame: ptr::null_mut(),
            context: ptr::null_mut(),
            cwd: None,
            open_files: array![_ => None; NOFILE],
            name: [0; MAXPROCNAME],
        }
    }
}

/// Per-process state.
pub struct Proc {
    /// This slot's index in the process table.
    pub idx: usize,

    /// Guarded by the process-table lock, through `TableGuard`.
    pub info: RemoteLock<RawSpinlock, (), ProcInfo>,

    data: UnsafeCell<ProcData>,

    /// Soft kill flag, checked at every syscall boundary and wakeup.
    killed: AtomicBool,
}

// Access to `data` follows the ownership discipline above; everything
// else is a lock or an atomic.
unsafe impl Sync for Proc {}

impl Proc {
    const fn new(idx: usize) -> Self {
        Self {
            idx,
            info: RemoteLock::new(ProcInfo {
                state: ProcState::Unused,
                pid: 0,
                chan: 0,
                parent: None,
                epoch: 0,
            }),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
        }
    }

    /// Mark the process killed; it exits at the next trap boundary.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    fn clear_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }

    /// The process's data, for the scheduler-side paths that own it
    /// structurally (allocation, reaping, context switch).
    ///
    /// # Safety
    ///
    /// The caller must be the only one touching `data`: the process must
    /// not be running, or the caller must be that process.
    pub unsafe fn data_raw(&self) -> *mut ProcData {
        self.data.get()
    }

    /// The channel a `wait`ing parent sleeps on.
    pub fn wait_chan(&self) -> usize {
        self as *const Proc as usize
    }
}

/// The process currently running on this CPU.
///
/// # Safety
///
/// `proc` is the CPU's current process, so its `data` is ours to touch.
pub struct CurrentProc {
    proc: &'static Proc,
}

impl CurrentProc {
    pub fn data(&mut self) -> &mut ProcData {
        // SAFETY: only the running process itself reaches its data here.
        unsafe { &mut *self.proc.data.get() }
    }

    pub fn data_ref(&self) -> &ProcData {
        // SAFETY: only the running process itself mutates its data.
        unsafe { &*self.proc.data.get() }
    }

    /// Size of this process's user address space.
    pub fn size(&self) -> usize {
        self.data_ref().sz
    }

    pub fn pid(&self) -> Pid {
        // pid does not change while the process runs.
        unsafe { (*self.proc.info.get_mut_raw()).pid }
    }

    /// The process's name, for diagnostics.
    pub fn name(&self) -> &str {
        let name = &self.data_ref().name;
        let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
        core::str::from_utf8(&name[..len]).unwrap_or("???")
    }
}

impl Deref for CurrentProc {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.proc
    }
}

/// The current process, if any.
pub fn myproc() -> Option<CurrentProc> {
    let proc = CPUS.current_proc();
    // SAFETY: the table lives in the static kernel; a CPU's proc pointer
    // stays valid while that process runs on it.
    let proc = unsafe { proc.as_ref()? };
    Some(CurrentProc { proc })
}

/// Pid of the current process, or 0 in early boot when there is none.
pub fn current_pid() -> Pid {
    myproc().map(|p| p.pid()).unwrap_or(0)
}

/// Is the current process being killed?
pub fn current_killed() -> bool {
    myproc().map(|p| p.killed()).unwrap_or(false)
}

/// The current process's working directory.
pub fn current_cwd() -> Option<RcInode> {
    let mut p = myproc()?;
    p.data().cwd.clone()
}
