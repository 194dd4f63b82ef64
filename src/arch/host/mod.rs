//! Host stand-ins for the hardware layer, used when the kernel is compiled
//! for the build machine (tests, `cargo check`). One CPU, identity
//! phys/virt translation, interrupts modeled as a plain flag.

use core::sync::atomic::{AtomicBool, Ordering};

/// Top of the user address space the page-table walker can cover.
pub const USERTOP: usize = crate::arch::mmu::NPDENTRIES * crate::arch::mmu::PTSIZE;

/// Interrupt-enable flag bit, mirroring %eflags.
pub const FL_IF: usize = 0x200;

/// Stand-in user segment selectors.
pub const UCODE_SEL: u16 = (3 << 3) | 3;
pub const UDATA_SEL: u16 = (4 << 3) | 3;

/// There is no trap-return path on the host.
pub fn trapret_addr() -> usize {
    0
}

static INTR: AtomicBool = AtomicBool::new(false);

pub unsafe fn intr_on() {
    INTR.store(true, Ordering::Release);
}

pub unsafe fn intr_off() {
    INTR.store(false, Ordering::Release);
}

pub fn intr_get() -> bool {
    INTR.load(Ordering::Acquire)
}

/// Wait for the next interrupt. Nothing will arrive on the host.
pub fn halt() {
    core::hint::spin_loop();
}

/// Kernel virtual address of a physical address.
pub fn p2v(pa: usize) -> usize {
    pa
}

/// Physical address of a kernel virtual address.
pub fn v2p(va: usize) -> usize {
    va
}

pub fn lapic_id() -> u32 {
    0
}

pub fn lapic_eoi() {}

/// Install `pgdir_pa` as the active page directory. The host has no MMU.
pub unsafe fn lcr3(_pgdir_pa: usize) {}

/// Point the CPU's task segment at the given kernel stack top.
pub unsafe fn set_task_segment(_cpu_idx: usize, _kstack_top: usize) {}

/// Snapshot of the call stack. Not recoverable portably on the host.
pub fn caller_pcs() -> [usize; 10] {
    [0; 10]
}

/// Switch kernel contexts. Only meaningful on real hardware.
pub unsafe fn swtch(_old: *mut *mut super::Context, _new: *mut super::Context) {
    panic!("swtch on host");
}

/// Console transmit path.
pub fn console_putc(c: u8) {
    #[cfg(test)]
    {
        use std::io::Write;
        let _ = std::io::stdout().write_all(&[c]);
    }
    #[cfg(not(test))]
    let _ = c;
}

pub fn uart_getc() -> i32 {
    -1
}

pub fn kbd_getc() -> i32 {
    -1
}

pub fn ide_intr() {}

pub fn lapic_start_ap(_apicid: u32, _addr: u32) {}

pub fn ioapic_enable(_irq: u32, _cpu: u32) {}
