//! Physical page allocator, for user memory, kernel stacks, page-table
//! pages and pipe buffers. Allocates whole 4096-byte pages from a free
//! list threaded through the pages themselves.
//!
//! Initialization happens in two phases: `init_phase1` seeds the pages
//! already mapped by the boot page directory and runs without the lock
//! (only the bootstrap CPU exists yet, and CPU identification is not up);
//! `init_phase2` adds the rest of physical memory and switches to locked
//! operation.

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::mmu::{pg_round_up, PGSIZE};
use crate::lock::Spinlock;
use crate::page::Page;

/// Byte written over every freed page, to catch use after free.
const POISON: u8 = 0x01;

struct Run {
    next: *mut Run,
}

/// # Safety
///
/// `head` is null or points to a valid free page, and the list threaded
/// through `next` is acyclic; every member lies in [start, end).
struct Freelist {
    head: *mut Run,
    start: usize,
    end: usize,
}

unsafe impl Send for Freelist {}

pub struct Kmem {
    /// False until `init_phase2`; before that only the boot CPU runs and
    /// the lock (which needs CPU identification) is bypassed.
    use_lock: AtomicBool,
    freelist: Spinlock<Freelist>,
}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            use_lock: AtomicBool::new(false),
            freelist: Spinlock::new(
                "kmem",
                Freelist {
                    head: ptr::null_mut(),
                    start: usize::MAX,
                    end: 0,
                },
            ),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Freelist) -> R) -> R {
        if self.use_lock.load(Ordering::Acquire) {
            let mut guard = self.freelist.lock();
            f(&mut guard)
        } else {
            // SAFETY: a single CPU, pre-init_phase2.
            f(unsafe { &mut *self.freelist.get_mut_raw() })
        }
    }

    /// Seed the allocator with [vstart, vend), lock-free.
    ///
    /// # Safety
    ///
    /// Call once, on the boot CPU, before any other CPU runs. The range
    /// must be unused memory mapped by the boot page directory.
    pub unsafe fn init_phase1(&self, vstart: usize, vend: usize) {
        unsafe { self.free_range(vstart, vend) };
    }

    /// Add [vstart, vend) and switch to locked operation.
    ///
    /// # Safety
    ///
    /// Call once, after `init_phase1`, with the full kernel mapping
    /// installed. The range must be unused memory.
    pub unsafe fn init_phase2(&self, vstart: usize, vend: usize) {
        unsafe { self.free_range(vstart, vend) };
        self.use_lock.store(true, Ordering::Release);
    }

    unsafe fn free_range(&self, vstart: usize, vend: usize) {
        self.with(|list| {
            list.start = list.start.min(pg_round_up(vstart));
            list.end = list.end.max(vend);
        });
        let mut p = pg_round_up(vstart);
        while p + PGSIZE <= vend {
            // SAFETY: pages in the range are unused and unaliased.
            self.free(unsafe { Page::from_usize(p) });
            p += PGSIZE;
        }
    }

    /// Return a page to the free list, poisoning its contents.
    pub fn free(&self, mut page: Page) {
        page.write_bytes(POISON);
        let addr = page.into_usize();
        self.with(|list| {
            assert!(
                addr % PGSIZE == 0 && addr >= list.start && addr + PGSIZE <= list.end,
                "kfree"
            );
            let run = addr as *mut Run;
            // SAFETY: the page is unaliased, so linking it cannot create a
            // cycle.
            unsafe { (*run).next = list.head };
            list.head = run;
        });
    }

    /// Take a page off the free list. Contents are unspecified.
    pub fn alloc(&self) -> Option<Page> {
        self.with(|list| {
            if list.head.is_null() {
                return None;
            }
            // SAFETY: head is a valid free page by the list invariant.
            let next = unsafe { (*list.head).next };
            let addr = core::mem::replace(&mut list.head, next) as usize;
            // SAFETY: the page just left the free list, so it is unaliased.
            Some(unsafe { Page::from_usize(addr) })
        })
    }

    /// A zeroed page.
    pub fn alloc_zeroed(&self) -> Option<Page> {
        let mut page = self.alloc()?;
        page.write_bytes(0);
        Some(page)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::kernel::test_util::serial;
    use std::vec;

    /// Hand `npages` of leaked host memory to `kmem`, phase 1 only.
    pub fn seed(kmem: &Kmem, npages: usize) -> (usize, usize) {
        let buf = vec![0u8; (npages + 1) * PGSIZE].leak();
        let start = pg_round_up(buf.as_ptr() as usize);
        let end = start + npages * PGSIZE;
        unsafe { kmem.init_phase1(start, end) };
        (start, end)
    }

    #[test]
    fn alloc_free_cycle() {
        let _serial = serial();
        let kmem = Kmem::new();
        let (start, end) = seed(&kmem, 8);

        let mut pages = vec![];
        while let Some(p) = kmem.alloc() {
            assert_eq!(p.addr() % PGSIZE, 0);
            assert!(p.addr() >= start && p.addr() + PGSIZE <= end);
            pages.push(p);
        }
        assert_eq!(pages.len(), 8);

        for p in pages.drain(..) {
            kmem.free(p);
        }
        let p = kmem.alloc().unwrap();
        assert!(p.iter().all(|&b| b == POISON));
        kmem.free(p);
    }

    #[test]
    fn two_phase_init_extends() {
        let _serial = serial();
        let kmem = Kmem::new();
        seed(&kmem, 2);
        let buf = vec![0u8; 3 * PGSIZE].leak();
        let start = pg_round_up(buf.as_ptr() as usize);
        unsafe { kmem.init_phase2(start, start + 2 * PGSIZE) };

        let mut n = 0;
        let mut pages = vec![];
        while let Some(p) = kmem.alloc() {
            n += 1;
            pages.push(p);
        }
        assert_eq!(n, 4);
        for p in pages.drain(..) {
            kmem.free(p);
        }
    }
}
