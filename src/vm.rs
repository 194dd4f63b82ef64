//! Virtual memory: kernel and user page directories.
//!
//! The kernel lives in the high half of every address space; each process
//! gets its own directory whose low half maps its user memory. All of the
//! walking and mapping here is plain memory manipulation through the
//! direct map, so it runs (and is tested) on the host as well; only
//! `switch_to`/`kvm_switch` touch the MMU.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{
    self,
    mmu::{pg_round_down, pg_round_up, pdx, pte_addr, pte_flags, ptx, NPDENTRIES, PGSIZE, PteFlags},
};
use crate::cpu::CPUS;
use crate::fs::InodeGuard;
use crate::kernel::kernel;
use crate::page::Page;

/// A page directory, owning its page-table pages and the user memory
/// mapped below `arch::USERTOP`. Must be released with `free`; dropping
/// one panics (via the owned `Page`).
pub struct PageDir {
    dir: Page,
}

impl PageDir {
    fn new_empty() -> Option<Self> {
        Some(Self {
            dir: kernel().kmem.alloc_zeroed()?,
        })
    }

    fn entries_mut(&mut self) -> &mut [usize; NPDENTRIES] {
        // SAFETY: the directory page is owned and NPDENTRIES entries fill
        // it exactly.
        unsafe { &mut *(self.dir.addr() as *mut [usize; NPDENTRIES]) }
    }

    /// A fresh page directory carrying the kernel's mappings.
    pub fn new_kvm() -> Option<Self> {
        let mut pd = Self::new_empty()?;
        if pd.map_kernel().is_err() {
            pd.free(0);
            return None;
        }
        Some(pd)
    }

    /// Pointer to the PTE for `va`, building intermediate page-table
    /// pages when `alloc`.
    fn walk(&mut self, va: usize, alloc: bool) -> Option<*mut usize> {
        let pde = &mut self.entries_mut()[pdx(va)];
        let table = if pte_flags(*pde).contains(PteFlags::P) {
            arch::p2v(pte_addr(*pde)) as *mut usize
        } else {
            if !alloc {
                return None;
            }
            let page = kernel().kmem.alloc_zeroed()?;
            let pa = arch::v2p(page.into_usize());
            *pde = pa | (PteFlags::P | PteFlags::W | PteFlags::U).bits();
            arch::p2v(pa) as *mut usize
        };
        // SAFETY: a page-table page holds NPTENTRIES entries.
        Some(unsafe { table.add(ptx(va)) })
    }

    /// Create PTEs for [va, va+size) referring to physical [pa, ...).
    /// Neither needs to be page-aligned. Mapping over a present entry is
    /// fatal.
    fn map_pages(&mut self, va: usize, size: usize, pa: usize, perm: PteFlags) -> Result<(), ()> {
        let mut a = pg_round_down(va);
        let last = pg_round_down(va + size - 1);
        let mut pa = pa;
        loop {
            let pte = self.walk(a, true).ok_or(())?;
            // SAFETY: walk returned a valid PTE slot.
            unsafe {
                assert!(!pte_flags(*pte).contains(PteFlags::P), "remap");
                *pte = pte_addr(pa) | (perm | PteFlags::P).bits();
            }
            if a == last {
                break;
            }
            a += PGSIZE;
            pa += PGSIZE;
        }
        Ok(())
    }

    /// Map the first user page and copy `code` into it; used only for the
    /// init process.
    pub fn init_uvm(&mut self, code: &[u8]) -> Result<(), ()> {
        assert!(code.len() < PGSIZE, "init_uvm: more than a page");
        let mut page = kernel().kmem.alloc_zeroed().ok_or(())?;
        page[..code.len()].copy_from_slice(code);
        let addr = page.into_usize();
        if self
            .map_pages(0, PGSIZE, arch::v2p(addr), PteFlags::W | PteFlags::U)
            .is_err()
        {
            // SAFETY: the page was never mapped.
            kernel().kmem.free(unsafe { Page::from_usize(addr) });
            return Err(());
        }
        Ok(())
    }

    /// Grow user memory from `oldsz` to `newsz`. Returns the new size;
    /// rolls back everything it allocated on failure.
    pub fn alloc_uvm(&mut self, oldsz: usize, newsz: usize) -> Result<usize, ()> {
        if newsz >= arch::USERTOP {
            return Err(());
        }
        if newsz < oldsz {
            return Ok(oldsz);
        }

        let mut a = pg_round_up(oldsz);
        while a < newsz {
            let Some(page) = kernel().kmem.alloc_zeroed() else {
                self.dealloc_uvm(a, oldsz);
                return Err(());
            };
            let addr = page.into_usize();
            if self
                .map_pages(a, PGSIZE, arch::v2p(addr), PteFlags::W | PteFlags::U)
                .is_err()
            {
                // SAFETY: the page was never mapped.
                kernel().kmem.free(unsafe { Page::from_usize(addr) });
                self.dealloc_uvm(a, oldsz);
                return Err(());
            }
            a += PGSIZE;
        }
        Ok(newsz)
    }

    /// Shrink user memory from `oldsz` to `newsz`, freeing the pages in
    /// between. Returns the new size.
    pub fn dealloc_uvm(&mut self, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }
        let mut a = pg_round_up(newsz);
        while a < pg_round_up(oldsz) {
            if let Some(pte) = self.walk(a, false) {
                // SAFETY: walk returned a valid PTE slot.
                unsafe {
                    if pte_flags(*pte).contains(PteFlags::P) {
                        let pa = pte_addr(*pte);
                        kernel().kmem.free(Page::from_usize(arch::p2v(pa)));
                        *pte = 0;
                    }
                }
            }
            a += PGSIZE;
        }
        newsz
    }

    /// Load `sz` bytes of a file, starting at `offset`, into user memory
    /// at `va`. The pages must already be mapped and `va` page-aligned.
    pub fn load_uvm(
        &mut self,
        ip: &mut InodeGuard<'_>,
        va: usize,
        offset: u32,
        sz: usize,
    ) -> Result<(), ()> {
        assert_eq!(va % PGSIZE, 0, "load_uvm: addr not page aligned");
        let mut i = 0;
        while i < sz {
            let pte = self.walk(va + i, false).expect("load_uvm: address should exist");
            // SAFETY: the segment's pages were mapped by alloc_uvm.
            let pa = unsafe { pte_addr(*pte) };
            let n = (sz - i).min(PGSIZE);
            // SAFETY: pa is an owned user page; we hold the only mapping
            // being touched.
            let dst = unsafe { core::slice::from_raw_parts_mut(arch::p2v(pa) as *mut u8, n) };
            if ip.readi(dst, offset + i as u32)? != n {
                return Err(());
            }
            i += PGSIZE;
        }
        Ok(())
    }

    /// Deep-copy the first `sz` bytes of this address space into a new
    /// directory (for fork). Frees everything on failure.
    pub fn copy_uvm(&mut self, sz: usize) -> Option<Self> {
        let mut new = Self::new_kvm()?;
        let mut a = 0;
        while a < sz {
            let pte = self.walk(a, false).expect("copy_uvm: pte should exist");
            // SAFETY: walk returned a valid PTE slot.
            let (pa, flags) = unsafe { (pte_addr(*pte), pte_flags(*pte)) };
            assert!(flags.contains(PteFlags::P), "copy_uvm: page not present");

            let Some(mut page) = kernel().kmem.alloc() else {
                new.free(a);
                return None;
            };
            // SAFETY: pa maps a full, owned user page.
            let src = unsafe { core::slice::from_raw_parts(arch::p2v(pa) as *const u8, PGSIZE) };
            page.copy_from_slice(src);

            let addr = page.into_usize();
            if new.map_pages(a, PGSIZE, arch::v2p(addr), flags).is_err() {
                // SAFETY: the page was never mapped.
                kernel().kmem.free(unsafe { Page::from_usize(addr) });
                new.free(a);
                return None;
            }
            a += PGSIZE;
        }
        Some(new)
    }

    /// Clear the user bit on the page at `va`: the stack-guard page.
    pub fn clear_pte_u(&mut self, va: usize) {
        let pte = self.walk(va, false).expect("clear_pte_u");
        // SAFETY: walk returned a valid PTE slot.
        unsafe { *pte = pte_addr(*pte) | (pte_flags(*pte) - PteFlags::U).bits() };
    }

    /// Kernel address of the user-accessible page at `va`.
    fn uva2ka(&mut self, va: usize) -> Option<*mut u8> {
        let pte = self.walk(va, false)?;
        // SAFETY: walk returned a valid PTE slot.
        let pte = unsafe { *pte };
        if !pte_flags(pte).contains(PteFlags::P | PteFlags::U) {
            return None;
        }
        Some(arch::p2v(pte_addr(pte)) as *mut u8)
    }

    /// Copy `src` into this address space at `va`, page by page. Used to
    /// build a user stack in a directory that is not installed yet.
    pub fn copy_out(&mut self, va: usize, src: &[u8]) -> Result<(), ()> {
        let mut off = 0;
        let mut va = va;
        while off < src.len() {
            let va0 = pg_round_down(va);
            let pa0 = self.uva2ka(va0).ok_or(())?;
            let n = (src.len() - off).min(PGSIZE - (va - va0));
            // SAFETY: pa0 is a mapped, user-accessible page; n stays
            // within it.
            unsafe {
                core::ptr::copy(src[off..].as_ptr(), pa0.add(va - va0), n);
            }
            off += n;
            va = va0 + PGSIZE;
        }
        Ok(())
    }

    /// Install this directory and point the CPU's task segment at
    /// `kstack_top`, so traps land on the process's kernel stack.
    pub fn switch_to(&self, kstack_top: usize) {
        CPUS.push_off();
        let idx = CPUS.current_idx();
        unsafe {
            arch::set_task_segment(idx, kstack_top);
            arch::lcr3(arch::v2p(self.dir.addr()));
        }
        CPUS.pop_off();
    }

    /// Release the user pages below `sz`, every page-table page, and the
    /// directory itself.
    pub fn free(mut self, sz: usize) {
        self.dealloc_uvm(sz, 0);
        for pde in self.entries_mut().iter_mut() {
            if pte_flags(*pde).contains(PteFlags::P) {
                let pa = pte_addr(*pde);
                // SAFETY: page-table pages are owned by the directory.
                kernel().kmem.free(unsafe { Page::from_usize(arch::p2v(pa)) });
                *pde = 0;
            }
        }
        let Self { dir } = self;
        kernel().kmem.free(dir);
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        use crate::arch::{DEVSPACE, EXTMEM, KERNBASE, KERNLINK, PHYSTOP};

        extern "C" {
            /// Start of kernel data, from the linker script; text and
            /// rodata below it are mapped read-only.
            static data: [u8; 0];
        }

        /// Physical address of the kernel page directory.
        static KPGDIR_PA: AtomicUsize = AtomicUsize::new(0);

        impl PageDir {
            /// The kernel's view: low physical memory mapped at KERNBASE,
            /// text read-only, and the memory-mapped device space.
            fn map_kernel(&mut self) -> Result<(), ()> {
                let data_va = unsafe { data.as_ptr() as usize };
                let maps = [
                    // I/O space
                    (KERNBASE, 0, EXTMEM, PteFlags::W),
                    // kernel text and rodata
                    (KERNLINK, arch::v2p(KERNLINK), data_va - KERNLINK, PteFlags::empty()),
                    // kernel data and free memory
                    (data_va, arch::v2p(data_va), PHYSTOP - arch::v2p(data_va), PteFlags::W),
                    // devices
                    (DEVSPACE, DEVSPACE, 0usize.wrapping_sub(DEVSPACE), PteFlags::W),
                ];
                for (va, pa, size, perm) in maps {
                    self.map_pages(va, size, pa, perm)?;
                }
                Ok(())
            }
        }

        /// Build the kernel page directory and switch to it. Boot CPU
        /// only.
        pub fn kvm_init() {
            let pd = PageDir::new_kvm().expect("kvm_init");
            // The kernel directory lives forever.
            let PageDir { dir } = pd;
            KPGDIR_PA.store(arch::v2p(dir.into_usize()), Ordering::Release);
            kvm_switch();
        }

        /// Install the kernel page directory.
        pub fn kvm_switch() {
            unsafe { arch::lcr3(KPGDIR_PA.load(Ordering::Acquire)) };
        }
    } else {
        /// The host has no MMU to point anywhere.
        pub fn kvm_switch() {}

        impl PageDir {
            fn map_kernel(&mut self) -> Result<(), ()> {
                Ok(())
            }
        }

        #[allow(dead_code)]
        static KPGDIR_PA: AtomicUsize = AtomicUsize::new(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_util::{ensure_kmem, serial};

    #[test]
    fn alloc_and_dealloc_roundtrip() {
        let _serial = serial();
        ensure_kmem();

        let mut pd = PageDir::new_kvm().unwrap();
        let sz = pd.alloc_uvm(0, 3 * PGSIZE + 17).unwrap();
        assert_eq!(sz, 3 * PGSIZE + 17);

        // Pages are mapped, zeroed, and writable through the direct map.
        for a in (0..3 * PGSIZE).step_by(PGSIZE) {
            let ka = pd.uva2ka(a).unwrap();
            unsafe {
                assert_eq!(*ka, 0);
                *ka = 0xA5;
            }
        }
        pd.free(sz);
    }

    #[test]
    fn copy_uvm_duplicates_content() {
        let _serial = serial();
        ensure_kmem();

        let mut pd = PageDir::new_kvm().unwrap();
        let sz = pd.alloc_uvm(0, 2 * PGSIZE).unwrap();
        unsafe { *pd.uva2ka(PGSIZE).unwrap() = 0x77 };

        let mut copy = pd.copy_uvm(sz).unwrap();
        // The copy sees the data at a different physical page.
        let a = pd.uva2ka(PGSIZE).unwrap();
        let b = copy.uva2ka(PGSIZE).unwrap();
        assert_ne!(a, b);
        unsafe {
            assert_eq!(*b, 0x77);
            *a = 0x11;
            assert_eq!(*b, 0x77);
        }

        copy.free(sz);
        pd.free(sz);
    }

    #[test]
    fn copy_out_spans_pages() {
        let _serial = serial();
        ensure_kmem();

        let mut pd = PageDir::new_kvm().unwrap();
        let sz = pd.alloc_uvm(0, 2 * PGSIZE).unwrap();

        let data: std::vec::Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let va = PGSIZE - 100;
        pd.copy_out(va, &data).unwrap();

        for (i, &b) in data.iter().enumerate() {
            let ka = pd.uva2ka(pg_round_down(va + i)).unwrap();
            let off = (va + i) % PGSIZE;
            assert_eq!(unsafe { *ka.add(off) }, b);
        }
        pd.free(sz);
    }

    #[test]
    fn guard_page_loses_user_bit() {
        let _serial = serial();
        ensure_kmem();

        let mut pd = PageDir::new_kvm().unwrap();
        let sz = pd.alloc_uvm(0, 2 * PGSIZE).unwrap();
        assert!(pd.uva2ka(0).is_some());
        pd.clear_pte_u(0);
        assert!(pd.uva2ka(0).is_none());
        pd.free(sz);
    }

    #[test]
    fn grow_then_shrink_returns_pages() {
        let _serial = serial();
        ensure_kmem();

        let mut pd = PageDir::new_kvm().unwrap();
        let sz = pd.alloc_uvm(0, 8 * PGSIZE).unwrap();
        let sz = pd.dealloc_uvm(sz, 2 * PGSIZE);
        assert_eq!(sz, 2 * PGSIZE);
        assert!(pd.uva2ka(0).is_some());
        assert!(pd.uva2ka(4 * PGSIZE).is_none());
        pd.free(sz);
    }
}
