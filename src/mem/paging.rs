//! The guest page-table walker: resolves guest virtual addresses against the guest's own
//! PD/PT hierarchy in physical memory, with architectural A/D-bit side effects.

use bitflags::bitflags;

use crate::arch::x86::{page_of, PteFlags, CR0_WP, LPAGE_SHIFT, PAGE_MASK, PTE_ADDR_MASK};
use crate::error::Error;

use super::phys::GuestRam;

bitflags! {
    /// Options controlling a guest page-table walk.
    pub struct PtwalkFlags: u32 {
        /// Treat a failed walk as a monitor bug rather than a guest fault.
        const ASSERT = 1 << 0;
        /// Walk the shadow hierarchy instead of the guest one.
        const SHADOW = 1 << 1;
        /// Set the accessed bit in entries as the walk passes them.
        const SET_A  = 1 << 2;
        /// Set the dirty bit in the leaf entry (the access is a write).
        const SET_D  = 1 << 3;
        /// The access executes at user privilege; entries must carry the U bit.
        const USER   = 1 << 4;
        /// The access is a write; entries must grant W under the applicable privilege rule.
        const WRITE  = 1 << 5;
        /// CR0.WP is set: supervisor writes honor read-only entries too.
        const WP     = 1 << 6;
    }
}

/// The walk flags for a plain data access: write intent, privilege level and the guest's
/// CR0.WP setting, composed the way every accessor needs them.
pub fn access_flags(write: bool, user: bool, cr0: u32) -> PtwalkFlags {
    let mut flags = PtwalkFlags::SET_A;
    if write {
        flags |= PtwalkFlags::SET_D | PtwalkFlags::WRITE;
        if cr0 & CR0_WP != 0 {
            flags |= PtwalkFlags::WP;
        }
    }
    if user {
        flags |= PtwalkFlags::USER;
    }
    flags
}

/// Why a walk failed. The caller converts these into guest page faults, with the error-code
/// bits derived from the access kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkError {
    /// The page-directory entry is not present.
    PdeNotPresent,
    /// The page-directory entry forbids the access (user bit missing, or a write into a
    /// read-only entry).
    PdePrivilege,
    /// The page-table entry is not present.
    PteNotPresent,
    /// The page-table entry forbids the access.
    PtePrivilege,
}

impl WalkError {
    /// Whether the fault is a protection violation (P set in the page-fault error code).
    pub fn is_protection(self) -> bool {
        matches!(self, WalkError::PdePrivilege | WalkError::PtePrivilege)
    }
}

/// The outcome of a successful walk.
#[derive(Clone, Copy, Debug)]
pub struct WalkResult {
    /// The physical address the virtual address maps to.
    pub paddr: u32,
    /// The (possibly updated) page-directory entry.
    pub pde: u32,
    /// The guest physical address of the page-directory entry.
    pub pde_addr: u32,
    /// The leaf page-table entry, absent for 4 MiB mappings.
    pub pte: Option<u32>,
    /// The guest physical address of the leaf entry.
    pub pte_addr: Option<u32>,
    /// Whether the mapping came from a 4 MiB page-directory entry.
    pub large: bool,
}

/// Walks the guest page table rooted at physical address `cr3` for `vaddr`.
///
/// Architectural side effects: with [`PtwalkFlags::SET_A`] the walk sets accessed bits in the
/// entries it traverses, and with [`PtwalkFlags::SET_D`] the dirty bit in the leaf. The U bit
/// is enforced when [`PtwalkFlags::USER`] is given; the W bit is enforced for
/// [`PtwalkFlags::WRITE`] accesses from user mode, and from supervisor mode as well when
/// [`PtwalkFlags::WP`] carries the guest's CR0.WP. A/D bits are only written once the access
/// is known to be permitted.
pub fn pt_walk(
    ram: &mut GuestRam,
    cr3: u32,
    vaddr: u32,
    flags: PtwalkFlags,
) -> Result<WalkResult, WalkError> {
    // A table frame outside RAM cannot hold a present entry.
    let io = |_e: Error| WalkError::PdeNotPresent;
    // Writes honor read-only entries at user privilege always, at supervisor privilege only
    // under CR0.WP.
    let write_denied = |entry: u32| {
        flags.contains(PtwalkFlags::WRITE)
            && entry & PteFlags::W.bits() == 0
            && (flags.contains(PtwalkFlags::USER) || flags.contains(PtwalkFlags::WP))
    };

    let pd_base = cr3 & PTE_ADDR_MASK;
    let pde_addr = pd_base + ((vaddr >> LPAGE_SHIFT) << 2);
    let mut pde = ram.ldl(pde_addr).map_err(io)?;

    if pde & PteFlags::P.bits() == 0 {
        return Err(WalkError::PdeNotPresent);
    }
    if flags.contains(PtwalkFlags::USER) && pde & PteFlags::U.bits() == 0 {
        return Err(WalkError::PdePrivilege);
    }

    if pde & PteFlags::PS.bits() != 0 {
        // 4 MiB page: the directory entry is also the leaf.
        if write_denied(pde) {
            return Err(WalkError::PdePrivilege);
        }
        let mut new_pde = pde;
        if flags.contains(PtwalkFlags::SET_A) {
            new_pde |= PteFlags::A.bits();
        }
        if flags.contains(PtwalkFlags::SET_D) {
            new_pde |= PteFlags::D.bits();
        }
        if new_pde != pde {
            ram.stl(pde_addr, new_pde).map_err(io)?;
            pde = new_pde;
        }
        let paddr = (pde & 0xffc0_0000) | (vaddr & 0x003f_ffff);
        return Ok(WalkResult {
            paddr,
            pde,
            pde_addr,
            pte: None,
            pte_addr: None,
            large: true,
        });
    }

    if flags.contains(PtwalkFlags::SET_A) && pde & PteFlags::A.bits() == 0 {
        ram.stl(pde_addr, pde | PteFlags::A.bits()).map_err(io)?;
        pde |= PteFlags::A.bits();
    }

    let pt_base = pde & PTE_ADDR_MASK;
    let pte_addr = pt_base + (((vaddr >> 12) & 0x3ff) << 2);
    let mut pte = ram.ldl(pte_addr).map_err(io)?;

    if pte & PteFlags::P.bits() == 0 {
        return Err(WalkError::PteNotPresent);
    }
    if flags.contains(PtwalkFlags::USER) && pte & PteFlags::U.bits() == 0 {
        return Err(WalkError::PtePrivilege);
    }
    // Access rights combine across both levels; the directory can deny a write the leaf
    // would grant.
    if write_denied(pde) {
        return Err(WalkError::PdePrivilege);
    }
    if write_denied(pte) {
        return Err(WalkError::PtePrivilege);
    }

    let mut new_pte = pte;
    if flags.contains(PtwalkFlags::SET_A) {
        new_pte |= PteFlags::A.bits();
    }
    if flags.contains(PtwalkFlags::SET_D) {
        new_pte |= PteFlags::D.bits();
    }
    if new_pte != pte {
        ram.stl(pte_addr, new_pte).map_err(io)?;
        pte = new_pte;
    }

    Ok(WalkResult {
        paddr: (pte & PTE_ADDR_MASK) | (vaddr & PAGE_MASK),
        pde,
        pde_addr,
        pte: Some(pte),
        pte_addr: Some(pte_addr),
        large: false,
    })
}

/// Installs a minimal identity page table for tests and early boot checks: one page directory
/// at `pd_base` mapping the first `n_pages` pages through a page table at `pt_base`.
pub fn build_identity_table(
    ram: &mut GuestRam,
    pd_base: u32,
    pt_base: u32,
    n_pages: u32,
    user: bool,
) -> Result<(), Error> {
    let mut flags = PteFlags::P | PteFlags::W;
    if user {
        flags |= PteFlags::U;
    }
    ram.stl(pd_base, (pt_base & PTE_ADDR_MASK) | flags.bits())?;
    for i in 0..n_pages {
        ram.stl(pt_base + i * 4, (i << 12) | flags.bits())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PD: u32 = 0x1000;
    const PT: u32 = 0x2000;

    fn setup() -> GuestRam {
        let mut ram = GuestRam::new(0x10_0000).unwrap();
        build_identity_table(&mut ram, PD, PT, 16, false).unwrap();
        ram
    }

    #[test]
    fn identity_walk_resolves() {
        let mut ram = setup();
        let r = pt_walk(&mut ram, PD, 0x3123, PtwalkFlags::empty()).unwrap();
        assert_eq!(r.paddr, 0x3123);
        assert!(!r.large);
        assert_eq!(r.pte_addr, Some(PT + 3 * 4));
    }

    #[test]
    fn not_present_entries_fault() {
        let mut ram = setup();
        // vaddr beyond the mapped 16 pages.
        let err = pt_walk(&mut ram, PD, 0x20_0000, PtwalkFlags::empty()).unwrap_err();
        assert_eq!(err, WalkError::PdeNotPresent);
        let err = pt_walk(&mut ram, PD, 0x1_0000, PtwalkFlags::empty()).unwrap_err();
        assert_eq!(err, WalkError::PteNotPresent);
    }

    #[test]
    fn user_bit_enforced() {
        let mut ram = setup();
        let err = pt_walk(&mut ram, PD, 0x3000, PtwalkFlags::USER).unwrap_err();
        assert_eq!(err, WalkError::PdePrivilege);
        assert!(err.is_protection());
    }

    #[test]
    fn user_write_to_read_only_page_faults() {
        let mut ram = GuestRam::new(0x10_0000).unwrap();
        build_identity_table(&mut ram, PD, PT, 16, true).unwrap();
        // Clear W on page 3's leaf.
        let pte = ram.ldl(PT + 3 * 4).unwrap();
        ram.stl(PT + 3 * 4, pte & !PteFlags::W.bits()).unwrap();
        let err = pt_walk(&mut ram, PD, 0x3000, access_flags(true, true, 0)).unwrap_err();
        assert_eq!(err, WalkError::PtePrivilege);
        assert!(err.is_protection());
        // Reads still resolve, and the failed write left the dirty bit clear.
        pt_walk(&mut ram, PD, 0x3000, access_flags(false, true, 0)).unwrap();
        assert_eq!(ram.ldl(PT + 3 * 4).unwrap() & PteFlags::D.bits(), 0);
    }

    #[test]
    fn supervisor_write_honors_cr0_wp() {
        let mut ram = setup();
        let pte = ram.ldl(PT + 3 * 4).unwrap();
        ram.stl(PT + 3 * 4, pte & !PteFlags::W.bits()).unwrap();
        // Without WP a supervisor write sails through read-only entries.
        let r = pt_walk(&mut ram, PD, 0x3000, access_flags(true, false, 0)).unwrap();
        assert_eq!(r.paddr, 0x3000);
        // With WP it faults.
        let err = pt_walk(&mut ram, PD, 0x3000, access_flags(true, false, CR0_WP)).unwrap_err();
        assert_eq!(err, WalkError::PtePrivilege);
    }

    #[test]
    fn read_only_directory_denies_user_write() {
        let mut ram = GuestRam::new(0x10_0000).unwrap();
        build_identity_table(&mut ram, PD, PT, 16, true).unwrap();
        let pde = ram.ldl(PD).unwrap();
        ram.stl(PD, pde & !PteFlags::W.bits()).unwrap();
        let err = pt_walk(&mut ram, PD, 0x3000, access_flags(true, true, 0)).unwrap_err();
        assert_eq!(err, WalkError::PdePrivilege);
    }

    #[test]
    fn large_page_write_protection() {
        let mut ram = GuestRam::new(0x10_0000).unwrap();
        // Read-only user 4 MiB page at physical 0.
        ram.stl(PD, (PteFlags::P | PteFlags::U | PteFlags::PS).bits())
            .unwrap();
        let err = pt_walk(&mut ram, PD, 0x3000, access_flags(true, true, 0)).unwrap_err();
        assert_eq!(err, WalkError::PdePrivilege);
        assert!(pt_walk(&mut ram, PD, 0x3000, access_flags(false, true, 0)).is_ok());
    }

    #[test]
    fn accessed_and_dirty_bits_set() {
        let mut ram = setup();
        pt_walk(&mut ram, PD, 0x3000, PtwalkFlags::SET_A | PtwalkFlags::SET_D).unwrap();
        let pde = ram.ldl(PD).unwrap();
        let pte = ram.ldl(PT + 3 * 4).unwrap();
        assert_ne!(pde & PteFlags::A.bits(), 0);
        assert_ne!(pte & PteFlags::A.bits(), 0);
        assert_ne!(pte & PteFlags::D.bits(), 0);
        // The dirty bit lands only on the leaf.
        assert_eq!(pde & PteFlags::D.bits(), 0);
    }

    #[test]
    fn large_page_walk() {
        let mut ram = GuestRam::new(0x10_0000).unwrap();
        // PDE 0: 4 MiB page at physical 0, present+write+PS.
        ram.stl(PD, (PteFlags::P | PteFlags::W | PteFlags::PS).bits())
            .unwrap();
        let r = pt_walk(&mut ram, PD, 0x12_3456, PtwalkFlags::SET_D).unwrap();
        assert!(r.large);
        assert_eq!(r.paddr, 0x12_3456);
        assert_ne!(ram.ldl(PD).unwrap() & PteFlags::D.bits(), 0);
    }

    #[test]
    fn page_of_helper() {
        assert_eq!(page_of(0x1fff), 0x1000);
    }
}
