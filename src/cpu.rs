//! Per-CPU state.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use array_macro::array;

use crate::arch::{self, Context};
use crate::param::NCPU;
use crate::proc::Proc;

/// Per-CPU state.
pub struct Cpu {
    /// Local APIC id.
    pub apicid: u32,

    /// swtch() here to enter the scheduler.
    pub scheduler: *mut Context,

    /// The process running on this CPU, or null.
    pub proc: *const Proc,

    /// Depth of push_off() nesting.
    ncli: i32,

    /// Were interrupts enabled before the outermost push_off()?
    int_ena: bool,

    /// Has this CPU finished its setup?
    pub started: AtomicBool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            apicid: 0,
            scheduler: ptr::null_mut(),
            proc: ptr::null(),
            ncli: 0,
            int_ena: false,
            started: AtomicBool::new(false),
        }
    }

    pub fn ncli(&self) -> i32 {
        self.ncli
    }

    pub fn int_ena(&self) -> bool {
        self.int_ena
    }

    pub fn set_int_ena(&mut self, on: bool) {
        self.int_ena = on;
    }
}

/// The CPU table. Each CPU mutates only its own entry, and only with
/// interrupts disabled, so a shared reference plus `UnsafeCell` suffices.
pub struct Cpus {
    inner: [UnsafeCell<Cpu>; NCPU],
    ncpu: AtomicUsize,
}

// SAFETY: see Cpus. Cross-CPU reads are limited to `apicid` (written once
// at boot) and the atomic `started` flag.
unsafe impl Sync for Cpus {}

pub static CPUS: Cpus = Cpus::new();

impl Cpus {
    const fn new() -> Self {
        Self {
            inner: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
            ncpu: AtomicUsize::new(1),
        }
    }

    /// Record the APIC ids found by MP discovery. Boot CPU only, before
    /// the other CPUs start.
    pub unsafe fn init(&self, apicids: &[u32]) {
        assert!(!apicids.is_empty() && apicids.len() <= NCPU);
        for (i, &id) in apicids.iter().enumerate() {
            unsafe { (*self.inner[i].get()).apicid = id };
        }
        self.ncpu.store(apicids.len(), Ordering::Release);
    }

    pub fn count(&self) -> usize {
        self.ncpu.load(Ordering::Acquire)
    }

    pub fn get(&self, idx: usize) -> *mut Cpu {
        self.inner[idx].get()
    }

    /// Index of the executing CPU. Interrupts must be off; otherwise a
    /// timer interrupt could migrate us mid-lookup.
    pub fn current_idx(&self) -> usize {
        assert!(!arch::intr_get(), "current_idx interruptible");
        let apicid = arch::lapic_id();
        for i in 0..self.count() {
            // SAFETY: apicid is written once at boot.
            if unsafe { (*self.inner[i].get()).apicid } == apicid {
                return i;
            }
        }
        panic!("unknown apicid {}", apicid);
    }

    /// The executing CPU's record. Interrupts must be off.
    pub fn current_raw(&self) -> *mut Cpu {
        self.inner[self.current_idx()].get()
    }

    /// push_off/pop_off are like intr_off()/intr_on() except that they are
    /// matched: it takes two pop_off()s to undo two push_off()s, and if
    /// interrupts were off to begin with they stay off.
    pub fn push_off(&self) {
        let old = arch::intr_get();
        unsafe { arch::intr_off() };
        // SAFETY: interrupts are off, so this CPU cannot race itself.
        let cpu = unsafe { &mut *self.current_raw() };
        if cpu.ncli == 0 {
            cpu.int_ena = old;
        }
        cpu.ncli += 1;
    }

    pub fn pop_off(&self) {
        assert!(!arch::intr_get(), "pop_off - interruptible");
        // SAFETY: interrupts are off.
        let cpu = unsafe { &mut *self.current_raw() };
        assert!(cpu.ncli >= 1, "pop_off");
        cpu.ncli -= 1;
        if cpu.ncli == 0 && cpu.int_ena {
            unsafe { arch::intr_on() };
        }
    }

    /// The process running on this CPU, if any.
    pub fn current_proc(&self) -> *const Proc {
        self.push_off();
        // SAFETY: interrupts are off.
        let p = unsafe { (*self.current_raw()).proc };
        self.pop_off();
        p
    }
}

/// Index of the executing CPU, usable with interrupts enabled only during
/// single-CPU boot.
pub fn cpu_id() -> usize {
    CPUS.current_idx()
}
