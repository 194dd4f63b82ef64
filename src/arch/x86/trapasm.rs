//! Trap entry stubs: 256 vectors funneling into `alltraps`, which builds a
//! `TrapFrame` and calls `trap()`. `trapret` unwinds the frame; it is also
//! the fabricated return path of a newly forked process.

use core::arch::global_asm;

global_asm!(
    r#"
.macro vector num
.globl vector\num
vector\num:
  .if \num == 8 || (\num >= 10 && \num <= 14) || \num == 17
  .else
  # the hardware pushed no error code for this vector
  pushl $0
  .endif
  pushl $\num
  jmp alltraps
.endm

.macro vecptr num
  .long vector\num
.endm

.text
.altmacro
.set i, 0
.rept 256
  vector %i
  .set i, i+1
.endr

.globl alltraps
alltraps:
  # Build the rest of the trap frame.
  pushl %ds
  pushl %es
  pushl %fs
  pushl %gs
  pushal

  # Enter with the kernel data segment.
  movw $(2<<3), %ax     # SEG_KDATA
  movw %ax, %ds
  movw %ax, %es

  # Call trap(tf), where tf=%esp.
  pushl %esp
  call trap
  addl $4, %esp

.globl trapret
trapret:
  popal
  popl %gs
  popl %fs
  popl %es
  popl %ds
  addl $0x8, %esp       # trapno and errcode
  iret

# Table of entry points, indexed by vector number.
.data
.globl vectors
.p2align 2
vectors:
.altmacro
.set i, 0
.rept 256
  vecptr %i
  .set i, i+1
.endr
"#,
    options(att_syntax)
);
