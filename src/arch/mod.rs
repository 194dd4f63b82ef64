//! Architecture seam.
//!
//! `x86` is the real thing: MMU constants matching the two-level 32-bit
//! paging hardware, the trap/context-switch assembly, segment and IDT
//! setup, and the `extern "C"` declarations for the driver objects the
//! kernel links against.
//!
//! `host` substitutes identity phys/virt translation, a single CPU and
//! no-op interrupt toggles so the layers above this seam can be exercised
//! by `cargo test` on the build machine.

use cfg_if::cfg_if;

pub mod mmu;

cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        mod x86;
        pub use x86::*;
    } else {
        mod host;
        pub use host::*;
    }
}

/// Saved registers for kernel context switches.
///
/// The callee-saved x86 registers, plus the return address pushed by the
/// `call` into `swtch`. Caller-saved registers live on the stack already;
/// the segment registers and %cr3 are per-process state handled elsewhere.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Context {
    pub edi: usize,
    pub esi: usize,
    pub ebx: usize,
    pub ebp: usize,
    pub eip: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebx: 0,
            ebp: 0,
            eip: 0,
        }
    }
}

/// Layout of the registers built on the kernel stack by the trap entry
/// stub. C-compatible because the assembly pushes it field by field.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct TrapFrame {
    // registers as pushed by pusha
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// useless & ignored
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // rest of trap frame
    pub gs: u16,
    pub padding1: u16,
    pub fs: u16,
    pub padding2: u16,
    pub es: u16,
    pub padding3: u16,
    pub ds: u16,
    pub padding4: u16,
    pub trapno: u32,

    // below here defined by x86 hardware
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding5: u16,
    pub eflags: u32,

    // below here only when crossing rings, such as from user to kernel
    pub esp: u32,
    pub ss: u16,
    pub padding6: u16,
}

impl core::fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "trap {} err {:#x} eip {:#x} cs {:#x} eflags {:#x} esp {:#x} \
             eax {:#x} ebx {:#x} ecx {:#x} edx {:#x} esi {:#x} edi {:#x} ebp {:#x}",
            self.trapno,
            self.err,
            self.eip,
            self.cs,
            self.eflags,
            self.esp,
            self.eax,
            self.ebx,
            self.ecx,
            self.edx,
            self.esi,
            self.edi,
            self.ebp
        )
    }
}
