//! Trap dispatch: syscalls, device interrupts, faults.

use crate::arch::{self, TrapFrame};
use crate::console;
use crate::cpu::CPUS;
use crate::kernel::kernel;
use crate::println;
use crate::proc::{myproc, ProcState};
use crate::syscall;

// x86 trap numbers.
pub const T_GPFLT: usize = 13;
pub const T_PGFLT: usize = 14;
/// User system call vector.
pub const T_SYSCALL: usize = 64;
/// IRQ 0 maps here.
pub const T_IRQ0: usize = 32;

pub const IRQ_TIMER: usize = 0;
pub const IRQ_KBD: usize = 1;
pub const IRQ_COM1: usize = 4;
pub const IRQ_IDE: usize = 14;
pub const IRQ_ERROR: usize = 19;
pub const IRQ_SPURIOUS: usize = 31;

/// Route the device IRQs we service to the IO APIC. Disk completion goes
/// to the highest CPU so CPU 0's timer duties stay cheap.
pub fn enable_irqs() {
    arch::ioapic_enable(IRQ_KBD as u32, 0);
    arch::ioapic_enable(IRQ_COM1 as u32, 0);
    arch::ioapic_enable(IRQ_IDE as u32, CPUS.count() as u32 - 1);
}

fn from_user(tf: &TrapFrame) -> bool {
    tf.cs & 3 == 3
}

/// All traps funnel here from the entry stubs.
#[no_mangle]
pub extern "C" fn trap(tf: *mut TrapFrame) {
    // SAFETY: the stub built a full frame on the kernel stack.
    let tf = unsafe { &mut *tf };

    if tf.trapno as usize == T_SYSCALL {
        if let Some(p) = myproc() {
            if p.killed() {
                kernel().procs.exit_current();
            }
            syscall::dispatch(tf);
            if p.killed() {
                kernel().procs.exit_current();
            }
        }
        return;
    }

    match tf.trapno as usize {
        n if n == T_IRQ0 + IRQ_TIMER => {
            // Only CPU 0 advances time, so a tick is a tick no matter how
            // many CPUs came up.
            if CPUS.current_idx() == 0 {
                let mut ticks = kernel().ticks.lock();
                *ticks = ticks.wrapping_add(1);
                ticks.wakeup();
            }
            arch::lapic_eoi();
        }
        n if n == T_IRQ0 + IRQ_IDE => {
            arch::ide_intr();
            arch::lapic_eoi();
        }
        n if n == T_IRQ0 + IRQ_KBD => {
            console::intr(arch::kbd_getc);
            arch::lapic_eoi();
        }
        n if n == T_IRQ0 + IRQ_COM1 => {
            console::intr(arch::uart_getc);
            arch::lapic_eoi();
        }
        n if n == T_IRQ0 + 7 || n == T_IRQ0 + IRQ_SPURIOUS || n == T_IRQ0 + IRQ_ERROR => {
            println!(
                "cpu{}: spurious interrupt at {:#x}:{:#x}",
                CPUS.current_idx(),
                tf.cs,
                tf.eip
            );
            arch::lapic_eoi();
        }
        n => match myproc() {
            Some(p) if from_user(tf) => {
                // A fault in user space kills the process.
                println!(
                    "pid {}: trap {} err {} on cpu {} eip {:#x} addr {:#x} -- kill",
                    p.pid(),
                    n,
                    tf.err,
                    CPUS.current_idx(),
                    tf.eip,
                    if n == T_PGFLT || n == T_GPFLT { tf.err } else { 0 }
                );
                p.kill();
            }
            // A fault in the kernel is a kernel bug.
            _ => panic!("unexpected trap from kernel: {:?}", tf),
        },
    }

    // A killed process leaves at the trap boundary rather than returning
    // to user space.
    if let Some(p) = myproc() {
        if p.killed() && from_user(tf) {
            kernel().procs.exit_current();
        }

        // The timer preempts user code; kernel code runs to its next
        // explicit suspension point.
        if tf.trapno as usize == T_IRQ0 + IRQ_TIMER && from_user(tf) {
            // Racy read, like the dump: a stale Running is corrected by
            // the state checks inside yield.
            let state = unsafe { (*p.info.get_mut_raw()).state };
            if state == ProcState::Running {
                kernel().procs.yield_cpu();
            }
        }

        if p.killed() && from_user(tf) {
            kernel().procs.exit_current();
        }
    }
}
