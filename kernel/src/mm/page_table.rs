//! Four-level x86-64 page tables
//!
//! Raw table walker for 4 KiB and 2 MiB pages. Intermediate tables are
//! allocated from the PMM on demand and counted as kernel-owned; the
//! refcount table never touches them. Three architectural software bits
//! carry VMM bookkeeping: FIXED (do not relocate), MANAGED (frame owned by
//! the refcount table), SHARED (refcount participates across address
//! spaces).

use bitflags::bitflags;

use crate::mm::{self, pmm, PAGE_SIZE};

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;
/// Entries of the top level that form the kernel half (256..512).
pub const KERNEL_HALF_START: usize = ENTRIES_PER_TABLE / 2;

/// Mask selecting the physical address bits of an entry.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Architectural page-table entry bits plus the kernel's software bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const LARGE    = 1 << 7;
        /// Software: mapping must not be relocated.
        const FIXED    = 1 << 9;
        /// Software: frame is reclaimable through the refcount table.
        const MANAGED  = 1 << 10;
        /// Software: frame is deliberately shared across address spaces.
        const SHARED   = 1 << 11;
        const NX       = 1 << 63;
    }
}

bitflags! {
    /// Mapping-request flags, the VMM's public vocabulary. Filtered down to
    /// [`PageFlags`] before touching the tables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u64 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const EXEC     = 1 << 2;
        const USER     = 1 << 3;
        /// Use 2 MiB pages; bases must be 2 MiB aligned.
        const LARGE    = 1 << 4;
        /// Honor the hint exactly, replacing whatever is there.
        const FIXED    = 1 << 5;
        /// Frame refcounts are shared across fork instead of COW.
        const SHARED   = 1 << 6;
        /// Do not populate tables now; fault in zeroed frames on demand.
        const DEMAND   = 1 << 7;
        /// Unmanaged direct mapping (MMIO): no frame reclamation.
        const OVERRIDE = 1 << 8;
    }
}

impl MapFlags {
    /// Translate request flags into entry bits. `None` for contradictory
    /// requests.
    pub fn filter(self) -> Option<PageFlags> {
        if !self.intersects(MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC) {
            return None;
        }
        if self.contains(MapFlags::SHARED) && self.contains(MapFlags::OVERRIDE) {
            return None;
        }

        let mut out = PageFlags::PRESENT;
        if self.contains(MapFlags::WRITE) {
            out |= PageFlags::WRITE;
        }
        if self.contains(MapFlags::USER) {
            out |= PageFlags::USER;
        }
        if self.contains(MapFlags::LARGE) {
            out |= PageFlags::LARGE;
        }
        if self.contains(MapFlags::SHARED) {
            out |= PageFlags::SHARED;
        }
        if !self.contains(MapFlags::EXEC) {
            out |= PageFlags::NX;
        }
        if !self.contains(MapFlags::OVERRIDE) {
            out |= PageFlags::MANAGED;
        }

        Some(out)
    }
}

/// One hardware page table (any level).
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [u64; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub fn zero(&mut self) {
        self.entries.fill(0);
    }
}

const fn table_indices(virt: u64) -> (usize, usize, usize, usize) {
    (
        ((virt >> 39) & 0x1FF) as usize,
        ((virt >> 30) & 0x1FF) as usize,
        ((virt >> 21) & 0x1FF) as usize,
        ((virt >> 12) & 0x1FF) as usize,
    )
}

/// Walker over one table hierarchy, addressed by the root's physical
/// address.
pub struct PageMapper {
    root_phys: u64,
}

impl PageMapper {
    /// # Safety
    ///
    /// `root_phys` must be the physical address of a valid top-level table
    /// reachable through the direct window, and the caller must hold the
    /// owning address space's lock for the mapper's lifetime.
    pub unsafe fn new(root_phys: u64) -> Self {
        Self { root_phys }
    }

    pub fn root_phys(&self) -> u64 {
        self.root_phys
    }

    fn table_at(phys: u64) -> *mut PageTable {
        mm::phys_to_virt(phys) as *mut PageTable
    }

    pub fn root(&self) -> *mut PageTable {
        Self::table_at(self.root_phys)
    }

    /// Walk to the table at `level` (4 = root .. 1 = leaf), allocating
    /// missing intermediates when `create` is set. Intermediate entries get
    /// PRESENT|WRITE|USER and access is narrowed at the leaf.
    fn descend(&self, virt: u64, target_level: u8, create: bool) -> Option<*mut PageTable> {
        let (l4, l3, l2, _) = table_indices(virt);
        let path = [l4, l3, l2];

        let mut table = self.root();
        let mut level = 4u8;

        while level > target_level {
            let idx = path[(4 - level) as usize];
            // SAFETY: `table` came from the root or a PRESENT intermediate
            // entry, both reachable through the direct window.
            let entry = unsafe { &mut (*table).entries[idx] };

            if *entry & PageFlags::PRESENT.bits() == 0 {
                if !create {
                    return None;
                }
                let sub = pmm::phys(1);
                *entry = sub | (PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER).bits();
            } else if *entry & PageFlags::LARGE.bits() != 0 {
                // A huge leaf blocks the walk below its level.
                return None;
            }

            table = Self::table_at(*entry & ADDR_MASK);
            level -= 1;
        }

        Some(table)
    }

    /// Install a 4 KiB translation.
    pub fn map_4k(&mut self, virt: u64, phys: u64, flags: PageFlags) {
        let (_, _, _, l1) = table_indices(virt);
        let table = self
            .descend(virt, 1, true)
            .expect("intermediate tables are created on demand");
        // SAFETY: `descend` returned a valid leaf table.
        unsafe {
            (*table).entries[l1] = (phys & ADDR_MASK) | flags.bits();
        }
    }

    /// Install a 2 MiB translation.
    pub fn map_2m(&mut self, virt: u64, phys: u64, flags: PageFlags) {
        let (_, _, l2, _) = table_indices(virt);
        let table = self
            .descend(virt, 2, true)
            .expect("intermediate tables are created on demand");
        // SAFETY: `descend` returned a valid L2 table.
        unsafe {
            (*table).entries[l2] = (phys & ADDR_MASK) | (flags | PageFlags::LARGE).bits();
        }
    }

    /// Read the raw leaf entry covering `virt` (4 KiB granularity).
    pub fn entry_4k(&self, virt: u64) -> Option<u64> {
        let (_, _, _, l1) = table_indices(virt);
        let table = self.descend(virt, 1, false)?;
        // SAFETY: `descend` returned a valid leaf table.
        let entry = unsafe { (*table).entries[l1] };
        (entry & PageFlags::PRESENT.bits() != 0).then_some(entry)
    }

    /// Read the raw L2 entry covering `virt`.
    pub fn entry_2m(&self, virt: u64) -> Option<u64> {
        let (_, _, l2, _) = table_indices(virt);
        let table = self.descend(virt, 2, false)?;
        // SAFETY: `descend` returned a valid L2 table.
        let entry = unsafe { (*table).entries[l2] };
        (entry & PageFlags::PRESENT.bits() != 0).then_some(entry)
    }

    /// Replace the leaf entry covering `virt`, returning the old one.
    pub fn update_4k(&mut self, virt: u64, new_entry: u64) -> Option<u64> {
        let (_, _, _, l1) = table_indices(virt);
        let table = self.descend(virt, 1, false)?;
        // SAFETY: `descend` returned a valid leaf table.
        unsafe {
            let old = (*table).entries[l1];
            (*table).entries[l1] = new_entry;
            Some(old)
        }
    }

    /// Replace the L2 entry covering `virt`, returning the old one.
    pub fn update_2m(&mut self, virt: u64, new_entry: u64) -> Option<u64> {
        let (_, _, l2, _) = table_indices(virt);
        let table = self.descend(virt, 2, false)?;
        // SAFETY: `descend` returned a valid L2 table.
        unsafe {
            let old = (*table).entries[l2];
            (*table).entries[l2] = new_entry;
            Some(old)
        }
    }

    /// Clear the leaf entry covering `virt`, returning the old entry.
    pub fn unmap_4k(&mut self, virt: u64) -> Option<u64> {
        let old = self.entry_4k(virt)?;
        self.update_4k(virt, 0);
        Some(old)
    }

    /// Clear the L2 entry covering `virt`, returning the old entry.
    pub fn unmap_2m(&mut self, virt: u64) -> Option<u64> {
        let old = self.entry_2m(virt)?;
        self.update_2m(virt, 0);
        Some(old)
    }

    /// Physical address backing `virt`, honoring both page sizes.
    pub fn translate(&self, virt: u64) -> Option<u64> {
        if let Some(entry) = self.entry_2m(mm::page_align_down(virt)) {
            if entry & PageFlags::LARGE.bits() != 0 {
                let base = entry & ADDR_MASK & !(mm::PAGE_SIZE_2M as u64 - 1);
                return Some(base + (virt & (mm::PAGE_SIZE_2M as u64 - 1)));
            }
        }

        let entry = self.entry_4k(virt)?;
        Some((entry & ADDR_MASK) + (virt % PAGE_SIZE as u64))
    }

    /// Free every user-half intermediate table frame (L1–L3). Leaf frames
    /// must have been released through the refcount table beforehand; the
    /// kernel half is shared with every other address space and stays.
    pub fn free_user_tables(&mut self) {
        let root = self.root();
        for l4_idx in 0..KERNEL_HALF_START {
            // SAFETY: the root table is valid for the mapper's lifetime.
            let l4_entry = unsafe { (*root).entries[l4_idx] };
            if l4_entry & PageFlags::PRESENT.bits() == 0 {
                continue;
            }

            let l3_phys = l4_entry & ADDR_MASK;
            let l3 = Self::table_at(l3_phys);
            for l3_idx in 0..ENTRIES_PER_TABLE {
                // SAFETY: PRESENT intermediate entries point at tables we
                // allocated.
                let l3_entry = unsafe { (*l3).entries[l3_idx] };
                if l3_entry & PageFlags::PRESENT.bits() == 0
                    || l3_entry & PageFlags::LARGE.bits() != 0
                {
                    continue;
                }

                let l2_phys = l3_entry & ADDR_MASK;
                let l2 = Self::table_at(l2_phys);
                for l2_idx in 0..ENTRIES_PER_TABLE {
                    // SAFETY: as above.
                    let l2_entry = unsafe { (*l2).entries[l2_idx] };
                    if l2_entry & PageFlags::PRESENT.bits() == 0
                        || l2_entry & PageFlags::LARGE.bits() != 0
                    {
                        continue;
                    }
                    pmm::free_phys(l2_entry & ADDR_MASK, 1);
                }
                pmm::free_phys(l2_phys, 1);
            }
            pmm::free_phys(l3_phys, 1);

            // SAFETY: root stays valid; we only clear our own entry.
            unsafe {
                (*root).entries[l4_idx] = 0;
            }
        }
    }
}

/// Invalidate the local TLB entry for one page.
#[inline]
pub fn flush_local(virt: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = virt;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn filter_maps_request_bits() {
        let flags = (MapFlags::READ | MapFlags::WRITE | MapFlags::USER)
            .filter()
            .expect("read/write/user is a valid request");
        assert!(flags.contains(PageFlags::PRESENT));
        assert!(flags.contains(PageFlags::WRITE));
        assert!(flags.contains(PageFlags::USER));
        assert!(flags.contains(PageFlags::NX));
        assert!(flags.contains(PageFlags::MANAGED));
    }

    #[test]
    fn filter_rejects_no_access() {
        assert_eq!(MapFlags::DEMAND.filter(), None);
        assert_eq!((MapFlags::SHARED | MapFlags::OVERRIDE).filter(), None);
    }

    #[test]
    fn exec_clears_nx_and_override_clears_managed() {
        let exec = (MapFlags::READ | MapFlags::EXEC)
            .filter()
            .expect("read/exec is a valid request");
        assert!(!exec.contains(PageFlags::NX));

        let mmio = (MapFlags::READ | MapFlags::WRITE | MapFlags::OVERRIDE)
            .filter()
            .expect("override mapping is a valid request");
        assert!(!mmio.contains(PageFlags::MANAGED));
    }

    #[test]
    fn indices_split_the_address() {
        let (l4, l3, l2, l1) = table_indices(0xFFFF_FFFF_8000_0000);
        assert_eq!((l4, l3, l2, l1), (511, 510, 0, 0));

        let (l4, l3, l2, l1) = table_indices(0x0000_0000_0040_3000);
        assert_eq!((l4, l3, l2, l1), (0, 0, 2, 3));
    }
}
