//! The process table and the per-CPU scheduler.
//!
//! One spinlock guards every process's scheduler-visible state (the
//! `ProcInfo` fragments reached through `TableGuard`), and it is the lock
//! held across `sched`: a context entering `swtch` holds it with a
//! nested-cli depth of exactly one, and whichever context comes out the
//! other side releases it.

use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use array_macro::array;
use itertools::izip;

use super::*;
use crate::arch;
use crate::arch::mmu::PGSIZE;
use crate::cpu::CPUS;
use crate::fs::ROOT_INUM;
use crate::kernel::kernel;
use crate::lock::{Guard, RawLock, Spinlock, SpinlockGuard};
use crate::param::{KSTACKSIZE, NPROC, ROOTDEV};
use crate::println;
use crate::vm::PageDir;

/// A user program that calls exec("/init", {"/init", 0}), hand-assembled:
///
///   push $argv; push $init; push $0
///   mov $SYS_exec, %eax; int $T_SYSCALL
///   exit: mov $SYS_exit, %eax; int $T_SYSCALL; jmp exit
///   init: "/init\0"
///   argv: .long init; .long 0
const INITCODE: [u8; 44] = [
    0x68, 0x24, 0x00, 0x00, 0x00, // push $argv
    0x68, 0x1c, 0x00, 0x00, 0x00, // push $init
    0x6a, 0x00, // push $0
    0xb8, 0x07, 0x00, 0x00, 0x00, // mov $SYS_exec, %eax
    0xcd, 0x40, // int $T_SYSCALL
    0xb8, 0x02, 0x00, 0x00, 0x00, // mov $SYS_exit, %eax
    0xcd, 0x40, // int $T_SYSCALL
    0xeb, 0xf7, // jmp exit
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, // "/init\0"
    0x00, 0x00, // padding
    0x1c, 0x00, 0x00, 0x00, // argv[0] = init
    0x00, 0x00, 0x00, 0x00, // argv[1] = 0
];

/// The process system.
pub struct Procs {
    /// The process-table lock. Its data lives in the `pool` entries'
    /// `info` fragments.
    table: Spinlock<()>,

    pool: [Proc; NPROC],

    nextpid: AtomicI32,

    /// Index of the init process; `usize::MAX` until user_init ran.
    init_idx: AtomicUsize,
}

/// Holding this guard is holding the process-table lock; it is the key
/// to every `ProcInfo`.
pub struct TableGuard<'s> {
    guard: SpinlockGuard<'s, ()>,
}

impl<'s> TableGuard<'s> {
    /// The scheduler-visible state of `p`.
    pub fn info<'a>(&'a mut self, p: &'a Proc) -> &'a mut ProcInfo {
        // SAFETY: this guard holds the table lock the fragment borrows.
        unsafe { p.info.get_mut_unchecked(&mut self.guard) }
    }

    /// Switch to the scheduler. The caller must have changed `p`'s state
    /// and must hold only the table lock.
    ///
    /// Saves and restores the CPU's saved interrupt-enable bit, because
    /// it is a property of this kernel thread, not of the CPU: the next
    /// thread the CPU runs may have entered the kernel with interrupts
    /// in a different state.
    ///
    /// # Safety
    ///
    /// `p` must be the current process.
    pub unsafe fn sched(&mut self, p: &Proc) {
        assert!(!arch::intr_get(), "sched interruptible");
        let cpu = CPUS.current_raw();
        // SAFETY: interrupts are off.
        unsafe {
            assert_eq!((*cpu).ncli(), 1, "sched locks");
        }
        assert_ne!(self.info(p).state, ProcState::Running, "sched running");

        unsafe {
            let int_ena = (*cpu).int_ena();
            arch::swtch(&mut (*p.data_raw()).context, (*cpu).scheduler);
            // swtch may have moved this thread to another CPU.
            let cpu = CPUS.current_raw();
            (*cpu).set_int_ena(int_ena);
        }
    }

    /// Wake every process sleeping on `chan`.
    pub fn wakeup(&mut self, procs: &Procs, chan: usize) {
        for p in procs.pool.iter() {
            let info = self.info(p);
            if info.state == ProcState::Sleeping && info.chan == chan {
                info.state = ProcState::Runnable;
            }
        }
    }
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            table: Spinlock::new("ptable", ()),
            pool: array![i => Proc::new(i); NPROC],
            nextpid: AtomicI32::new(1),
            init_idx: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn lock_table(&self) -> TableGuard<'_> {
        TableGuard {
            guard: self.table.lock(),
        }
    }

    fn allocpid(&self) -> Pid {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    fn initial_proc(&self) -> &Proc {
        let idx = self.init_idx.load(Ordering::Acquire);
        assert_ne!(idx, usize::MAX, "no init process");
        &self.pool[idx]
    }

    /// The handle naming `p` right now.
    fn handle_of(&self, table: &mut TableGuard<'_>, p: &Proc) -> ProcHandle {
        ProcHandle {
            idx: p.idx,
            epoch: table.info(p).epoch,
        }
    }

    /// The process a handle names, unless the slot was recycled since.
    fn resolve(&self, table: &mut TableGuard<'_>, handle: ProcHandle) -> Option<&Proc> {
        let p = &self.pool[handle.idx];
        if table.info(p).epoch == handle.epoch {
            Some(p)
        } else {
            None
        }
    }

    /// Find an unused slot, mark it embryo, and build its kernel stack:
    /// from the top, a trap frame, the address of the trap-return stub,
    /// and a context that starts in `forkret`. Fully unwinds on failure.
    fn alloc_proc(&self) -> Result<&Proc, ()> {
        let mut table = self.lock_table();
        let mut found = None;
        for p in self.pool.iter() {
            if table.info(p).state == ProcState::Unused {
                found = Some(p);
                break;
            }
        }
        let p = found.ok_or(())?;
        let info = table.info(p);
        info.state = ProcState::Embryo;
        info.pid = self.allocpid();
        drop(table);

        // Allocate the kernel stack.
        let Some(kstack) = kernel().kmem.alloc() else {
            let mut table = self.lock_table();
            table.info(p).state = ProcState::Unused;
            return Err(());
        };
        let kstack = kstack.into_usize();

        // SAFETY: the slot is Embryo: nobody else touches its data.
        let data = unsafe { &mut *p.data_raw() };
        data.kstack = kstack;

        let mut sp = kstack + KSTACKSIZE;

        // Leave room for the trap frame.
        sp -= core::mem::size_of::<TrapFrame>();
        data.trap_frame = sp as *mut TrapFrame;

        // The address forkret returns to: the trap-return stub.
        sp -= core::mem::size_of::<usize>();
        // SAFETY: sp is inside the fresh kernel stack.
        unsafe { (sp as *mut usize).write(arch::trapret_addr()) };

        // The context the scheduler switches into; it starts in forkret.
        sp -= core::mem::size_of::<Context>();
        data.context = sp as *mut Context;
        unsafe {
            (sp as *mut Context).write(Context::new());
            (*data.context).eip = forkret as usize;
        }

        Ok(p)
    }

    /// Tear a process down to an unused slot. Frees the kernel stack and
    /// the page directory, clears identity, and bumps the slot's epoch so
    /// stale handles die.
    ///
    /// # Safety
    ///
    /// `p` must not be running, and the caller must hold the table lock.
    unsafe fn clear_proc(&self, table: &mut TableGuard<'_>, p: &Proc) {
        // SAFETY: p is a zombie (or a failed embryo); we own its data.
        let data = unsafe { &mut *p.data_raw() };
        if data.kstack != 0 {
            // SAFETY: the stack page came from Kmem and nothing uses it.
            kernel().kmem.free(unsafe { crate::page::Page::from_usize(data.kstack) });
            data.kstack = 0;
        }
        if let Some(pgdir) = data.pgdir.take() {
            pgdir.free(data.sz);
        }
        data.sz = 0;
        data.trap_frame = core::ptr::null_mut();
        data.context = core::ptr::null_mut();
        data.name[0] = 0;

        p.clear_killed();
        let info = table.info(p);
        info.pid = 0;
        info.chan = 0;
        info.parent = None;
        info.epoch = info.epoch.wrapping_add(1);
        info.state = ProcState::Unused;
    }

    /// Set up the first user process: one page holding the init code,
    /// a trap frame that "returns" into it, and a runnable state.
    pub fn user_init(&'static self) {
        let p = self.alloc_proc().expect("user_init: alloc_proc");

        let mut pgdir = PageDir::new_kvm().expect("user_init: new_kvm");
        pgdir.init_uvm(&INITCODE).expect("user_init: init_uvm");

        // SAFETY: the process is Embryo; nobody else touches its data.
        let data = unsafe { &mut *p.data_raw() };
        data.pgdir = Some(pgdir);
        data.sz = PGSIZE;

        // Fabricate a return to user address 0 with interrupts enabled.
        // SAFETY: alloc_proc pointed trap_frame into the kernel stack.
        unsafe {
            let tf = &mut *data.trap_frame;
            *tf = TrapFrame::default();
            tf.cs = arch::UCODE_SEL;
            tf.ds = arch::UDATA_SEL;
            tf.es = tf.ds;
            tf.fs = tf.ds;
            tf.gs = tf.ds;
            tf.ss = tf.ds;
            tf.eflags = arch::FL_IF as u32;
            tf.esp = PGSIZE as u32;
            tf.eip = 0;
        }

        let name = b"initcode\x00";
        data.name[..name.len()].copy_from_slice(name);
        data.cwd = Some(kernel().itable().get_inode(ROOTDEV, ROOT_INUM));

        self.init_idx.store(p.idx, Ordering::Release);

        let mut table = self.lock_table();
        table.info(p).state = ProcState::Runnable;
    }

    /// Create a new process copying the caller: same user memory, same
    /// open files, same cwd. Returns the child's pid to the parent; the
    /// child wakes up in forkret returning 0.
    pub fn fork(&'static self) -> Result<Pid, ()> {
        let mut cur = myproc().ok_or(())?;

        let np = self.alloc_proc()?;
        // SAFETY: the child is Embryo; nobody else touches its data.
        let ndata = unsafe { &mut *np.data_raw() };

        // Copy the user address space.
        let parent_sz = cur.data().sz;
        let Some(pgdir) = cur.data().pgdir.as_mut().unwrap().copy_uvm(parent_sz) else {
            let mut table = self.lock_table();
            // SAFETY: the embryo never ran.
            unsafe { self.clear_proc(&mut table, np) };
            return Err(());
        };
        ndata.pgdir = Some(pgdir);
        ndata.sz = parent_sz;

        // Same registers as the parent, but fork returns 0 in the child.
        unsafe {
            *ndata.trap_frame = *cur.data().trap_frame;
            (*ndata.trap_frame).eax = 0;
        }

        for (nf, f) in izip!(ndata.open_files.iter_mut(), cur.data().open_files.iter()) {
            *nf = f.clone();
        }
        ndata.cwd = cur.data().cwd.clone();
        ndata.name.copy_from_slice(&cur.data().name);

        let mut table = self.lock_table();
        let pid = table.info(np).pid;
        let parent = self.handle_of(&mut table, &cur);
        let info = table.info(np);
        info.parent = Some(parent);
        info.state = ProcState::Runnable;
        Ok(pid)
    }

    /// Exit the current process: close files, drop the cwd, hand children
    /// to init, wake the parent and become a zombie. Never returns; the
    /// parent's wait() reclaims the slot.
    pub fn exit_current(&'static self) -> ! {
        let mut cur = myproc().expect("exit");
        assert!(
            !core::ptr::eq(&*cur as *const Proc, self.initial_proc()),
            "init exiting"
        );

        for f in cur.data().open_files.iter_mut() {
            drop(f.take());
        }
        drop(cur.data().cwd.take());

        let mut table = self.lock_table();

        // Parent might be sleeping in wait().
        let me = self.handle_of(&mut table, &cur);
        if let Some(parent) = table.info(&cur).parent {
            if let Some(parent) = self.resolve(&mut table, parent) {
                let chan = parent.wait_chan();
                table.wakeup(self, chan);
            }
        }

        // Pass abandoned children to init.
        let init = self.initial_proc();
        let init_handle = self.handle_of(&mut table, init);
        for p in self.pool.iter() {
            let info = table.info(p);
            if info.parent == Some(me) {
                info.parent = Some(init_handle);
                if info.state == ProcState::Zombie {
                    table.wakeup(self, init.wait_chan());
                }
            }
        }

        table.info(&cur).state = ProcState::Zombie;
        // SAFETY: table lock held, state changed, we are the current
        // process.
        unsafe { table.sched(&cur) };
        unreachable!("zombie exit");
    }

    /// Wait for a child to exit; reap it and return its pid. Fails if
    /// the caller has no children, or was killed while waiting.
    pub fn wait(&'static self) -> Result<Pid, ()> {
        let cur = myproc().expect("wait");
        let mut table = self.lock_table();

        loop {
            let me = self.handle_of(&mut table, &cur);
            let mut havekids = false;
            for p in self.pool.iter() {
                let info = table.info(p);
                if info.parent != Some(me) {
                    continue;
                }
                havekids = true;
                if info.state == ProcState::Zombie {
                    let pid = info.pid;
                    // SAFETY: zombies do not run; the table lock is held.
                    unsafe { self.clear_proc(&mut table, p) };
                    return Ok(pid);
                }
            }

            if !havekids || cur.killed() {
                return Err(());
            }

            // Wait for a child to exit; exit_current wakes this channel.
            self.sleep_locked(cur.wait_chan(), &mut table);
        }
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_cpu(&self) {
        let cur = myproc().expect("yield");
        let mut table = self.lock_table();
        table.info(&cur).state = ProcState::Runnable;
        // SAFETY: table lock held, state changed.
        unsafe { table.sched(&cur) };
    }

    /// Atomically release `lk` and sleep on `chan`; reacquires `lk`
    /// before returning.
    ///
    /// The table lock is taken before `lk` is released, and wakeup takes
    /// the table lock too, so the wakeup window is closed: no wakeup
    /// between the release and the state change can be missed.
    pub fn sleep<R: RawLock, T>(&self, chan: usize, lk: &mut Guard<'_, R, T>) {
        let cur = myproc().expect("sleep");
        let mut table = self.lock_table();
        lk.reacquire_after(move || {
            {
                let info = table.info(&cur);
                info.chan = chan;
                info.state = ProcState::Sleeping;
            }
            // SAFETY: table lock held, state changed.
            unsafe { table.sched(&cur) };
            table.info(&cur).chan = 0;
            drop(table);
        });
    }

    /// Sleep on `chan` for callers that already hold the table lock
    /// (wait), instead of some other lock.
    pub fn sleep_locked(&self, chan: usize, table: &mut TableGuard<'_>) {
        let cur = myproc().expect("sleep");
        {
            let info = table.info(&cur);
            info.chan = chan;
            info.state = ProcState::Sleeping;
        }
        // SAFETY: table lock held, state changed.
        unsafe { table.sched(&cur) };
        table.info(&cur).chan = 0;
    }

    /// Wake every process sleeping on `chan`.
    pub fn wakeup(&self, chan: usize) {
        let mut table = self.lock_table();
        table.wakeup(self, chan);
    }

    /// Mark the process with pid `pid` killed. It exits when it next
    /// crosses the trap boundary; if it is sleeping, wake it so that
    /// happens soon.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        let mut table = self.lock_table();
        for p in self.pool.iter() {
            let info = table.info(p);
            if info.pid == pid && info.state != ProcState::Unused {
                p.kill();
                if info.state == ProcState::Sleeping {
                    table.info(p).state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// The per-CPU scheduler. Never returns: pick a runnable process,
    /// switch to it, and take back over when it yields. With nothing
    /// runnable, wait for an interrupt.
    pub fn scheduler(&'static self) -> ! {
        let cpu = CPUS.current_raw();
        loop {
            // Devices must be able to interrupt between scans.
            unsafe { arch::intr_on() };

            let mut ran = false;
            let mut table = self.lock_table();
            for p in self.pool.iter() {
                if table.info(p).state != ProcState::Runnable {
                    continue;
                }

                // Switch to the chosen process. It releases the table
                // lock and reacquires it before coming back.
                table.info(p).state = ProcState::Running;
                unsafe {
                    (*cpu).proc = p;
                    let data = &mut *p.data_raw();
                    data.pgdir
                        .as_ref()
                        .expect("scheduler: no pgdir")
                        .switch_to(data.kstack + KSTACKSIZE);
                    arch::swtch(&mut (*cpu).scheduler, data.context);
                    crate::vm::kvm_switch();
                    (*cpu).proc = core::ptr::null();
                }
                ran = true;
            }
            drop(table);

            if !ran {
                arch::halt();
            }
        }
    }

    /// Print a process listing to the console. Runs when the user types
    /// ^P; takes no locks, to avoid wedging a stuck machine further.
    pub fn dump(&self) {
        println!();
        for p in self.pool.iter() {
            // SAFETY: debugging aid; reads may tear.
            let info = unsafe { &*p.info.get_mut_raw() };
            if info.state == ProcState::Unused {
                continue;
            }
            let data = unsafe { &*p.data_raw() };
            let len = data.name.iter().position(|&c| c == 0).unwrap_or(data.name.len());
            println!(
                "{} {} {}",
                info.pid,
                info.state.as_str(),
                core::str::from_utf8(&data.name[..len]).unwrap_or("???")
            );
        }
    }
}

/// A forked child's first scheduling switches here. Still holding the
/// process-table lock from the scheduler; release it, then return into
/// the trap-return stub, which lands in user space.
extern "C" fn forkret() {
    // SAFETY: the scheduler acquired the table lock before switching to
    // us; its guard is on the scheduler stack.
    unsafe { kernel().procs.table_raw_unlock() };

    // The file system is mounted from a process context, because reading
    // the superblock sleeps. First process to get here does it.
    kernel().fs.init(ROOTDEV);
}

impl Procs {
    /// Release the table spinlock without a guard: forkret's half of the
    /// scheduler's acquisition.
    ///
    /// # Safety
    ///
    /// The caller must actually hold the lock.
    pub unsafe fn table_raw_unlock(&self) {
        unsafe { self.table.unlock() };
    }
}
