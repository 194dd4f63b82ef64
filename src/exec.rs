//! exec: replace the current image with an ELF executable.

use core::cell::Cell;

use arrayvec::ArrayVec;
use cstr_core::CStr;
use zerocopy::FromBytes;

use crate::arch::mmu::{pg_round_up, PGSIZE};
use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::Path;
use crate::kernel::kernel;
use crate::param::{KSTACKSIZE, MAXARG, MAXPROCNAME};
use crate::proc::myproc;
use crate::vm::PageDir;

/// Load `path` into a fresh address space, build the new user stack from
/// `argv`, and commit it to the current process. On success control
/// "returns" to the ELF entry point; on any failure before commit the
/// caller's image is untouched.
pub fn exec(path: &Path, argv: &ArrayVec<&CStr, MAXARG>) -> Result<usize, ()> {
    let mut cur = myproc().ok_or(())?;

    let ip = kernel().fs.namei(path)?;
    let mut ipg = ip.lock();

    // Validate the header.
    let mut buf = [0u8; core::mem::size_of::<ElfHdr>()];
    if ipg.readi(&mut buf, 0)? != buf.len() {
        return Err(());
    }
    let elf = ElfHdr::read_from(&buf[..]).unwrap();
    if elf.magic != ELF_MAGIC {
        return Err(());
    }

    // Build the new address space; roll everything back on failure.
    let pgdir = PageDir::new_kvm().ok_or(())?;
    let sz = Cell::new(0usize);
    let mut pgdir = scopeguard::guard(pgdir, |pd| pd.free(sz.get()));

    // Load each program segment.
    for i in 0..elf.phnum as u32 {
        let mut buf = [0u8; core::mem::size_of::<ProgHdr>()];
        let off = elf
            .phoff
            .checked_add(i * core::mem::size_of::<ProgHdr>() as u32)
            .ok_or(())?;
        if ipg.readi(&mut buf, off)? != buf.len() {
            return Err(());
        }
        let ph = ProgHdr::read_from(&buf[..]).unwrap();
        if ph.typ != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(());
        }
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            return Err(());
        }
        if ph.vaddr as usize % PGSIZE != 0 {
            return Err(());
        }
        sz.set(pgdir.alloc_uvm(sz.get(), (ph.vaddr + ph.memsz) as usize)?);
        pgdir.load_uvm(&mut ipg, ph.vaddr as usize, ph.off, ph.filesz as usize)?;
    }
    drop(ipg);
    drop(ip);

    // Two pages at the next page boundary: an inaccessible stack guard,
    // then the user stack.
    let base = pg_round_up(sz.get());
    sz.set(pgdir.alloc_uvm(base, base + 2 * PGSIZE)?);
    pgdir.clear_pte_u(base);
    let mut sp = sz.get();

    // Push the argument strings, word-aligned, remembering each address.
    let mut ustack = [0u32; 3 + MAXARG + 1];
    let argc = argv.len();
    for (i, arg) in argv.iter().enumerate() {
        let bytes = arg.to_bytes_with_nul();
        if bytes.len() >= sp {
            return Err(());
        }
        sp = (sp - bytes.len()) & !3;
        pgdir.copy_out(sp, bytes)?;
        ustack[3 + i] = sp as u32;
    }
    ustack[3 + argc] = 0;

    let frame = 3 + argc + 1;
    if frame * 4 > sp {
        return Err(());
    }

    // Then the bookkeeping below them: a fake return PC, argc, argv.
    ustack[0] = 0xffffffff;
    ustack[1] = argc as u32;
    ustack[2] = (sp - (argc + 1) * 4) as u32;

    sp -= frame * 4;
    let bytes = {
        // SAFETY: u32s are plain bytes.
        unsafe { core::slice::from_raw_parts(ustack.as_ptr() as *const u8, frame * 4) }
    };
    pgdir.copy_out(sp, bytes)?;

    // Save the program name for debugging.
    let name = path.file_name();
    let len = name.len().min(MAXPROCNAME - 1);
    let data = cur.data();
    data.name[..len].copy_from_slice(&name[..len]);
    data.name[len] = 0;

    // Commit to the new image.
    let pgdir = scopeguard::ScopeGuard::into_inner(pgdir);
    let old = data.pgdir.replace(pgdir);
    let old_sz = core::mem::replace(&mut data.sz, sz.get());
    // SAFETY: the trap frame lives on our kernel stack.
    unsafe {
        (*data.trap_frame).eip = elf.entry;
        (*data.trap_frame).esp = sp as u32;
    }
    let kstack_top = data.kstack + KSTACKSIZE;
    data.pgdir.as_ref().unwrap().switch_to(kstack_top);

    if let Some(old) = old {
        old.free(old_sz);
    }
    Ok(0)
}
