//! Paging constants shared by the real MMU and the host shim.
//!
//! A page-table entry is one `usize` holding a physical address in its high
//! bits and flag bits in its low 12. On x86 that is exactly the hardware
//! layout of the two-level 32-bit MMU; the host shim reuses the same
//! encoding (with fewer entries per level, since its `usize` is wider) so
//! the page-table walkers in `vm` behave identically under test.

use bitflags::bitflags;

/// Bytes mapped by a page.
pub const PGSIZE: usize = 4096;

/// Bytes mapped by one directory entry (a whole page table).
pub const PTSIZE: usize = NPTENTRIES * PGSIZE;

/// Entries per page directory / page table: one page worth of `usize`s.
pub const NPDENTRIES: usize = PGSIZE / core::mem::size_of::<usize>();
pub const NPTENTRIES: usize = NPDENTRIES;

/// Offset of the page-table index in a virtual address.
pub const PTXSHIFT: usize = 12;

/// Offset of the page-directory index in a virtual address.
pub const PDXSHIFT: usize = PTXSHIFT + NPTENTRIES.trailing_zeros() as usize;

/// Page-directory index of a virtual address.
pub const fn pdx(va: usize) -> usize {
    (va >> PDXSHIFT) & (NPDENTRIES - 1)
}

/// Page-table index of a virtual address.
pub const fn ptx(va: usize) -> usize {
    (va >> PTXSHIFT) & (NPTENTRIES - 1)
}

/// Round up to the next page boundary.
pub const fn pg_round_up(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

/// Round down to the current page boundary.
pub const fn pg_round_down(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

bitflags! {
    /// Page table / directory entry flags.
    pub struct PteFlags: usize {
        /// Present
        const P = 0x001;
        /// Writeable
        const W = 0x002;
        /// User-accessible
        const U = 0x004;
        /// Page size (4 MiB superpage; directory entries only)
        const PS = 0x080;
    }
}

/// Address bits of a page-table entry.
pub const fn pte_addr(pte: usize) -> usize {
    pte & !0xfff
}

/// Flag bits of a page-table entry. Status bits the hardware may set
/// (accessed, dirty) are not modeled and drop out here.
pub const fn pte_flags(pte: usize) -> PteFlags {
    PteFlags::from_bits_truncate(pte)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_recompose() {
        let va = (3 << PDXSHIFT) | (5 << PTXSHIFT) | 0x123;
        assert_eq!(pdx(va), 3);
        assert_eq!(ptx(va), 5);
        assert_eq!(pg_round_down(va), (3 << PDXSHIFT) | (5 << PTXSHIFT));
    }

    #[test]
    fn rounding() {
        assert_eq!(pg_round_up(0), 0);
        assert_eq!(pg_round_up(1), PGSIZE);
        assert_eq!(pg_round_up(PGSIZE), PGSIZE);
        assert_eq!(pg_round_down(PGSIZE + 1), PGSIZE);
    }

    #[test]
    fn entries_split_into_address_and_flags() {
        let pte = 0x1234_5000 | (PteFlags::P | PteFlags::W | PteFlags::U).bits();
        assert_eq!(pte_addr(pte), 0x1234_5000);
        assert_eq!(pte_flags(pte), PteFlags::P | PteFlags::W | PteFlags::U);
        assert!(pte_flags(pte).contains(PteFlags::P));
        assert!(!pte_flags(pte).contains(PteFlags::PS));
    }
}
