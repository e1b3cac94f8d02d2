//! Per-process virtual address spaces
//!
//! An [`AddressSpace`] owns a top-level page table, a hole tree of free
//! user ranges and an ordered set of live mappings. Every user page is in
//! exactly one hole or one mapping; the two never overlap. The kernel half
//! of the top-level table (entries 256..512) is cloned by reference from
//! the boot tables and identical everywhere.
//!
//! Mappings come in four flavors: eager anonymous, demand-paged anonymous,
//! callback-backed (file/COW collaborators fault pages in and out), and
//! unmanaged direct translations for MMIO which never touch the refcount
//! table.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        self, hole_tree::HoleTree, page_table, page_table::MapFlags, page_table::PageFlags,
        page_table::PageMapper, pmm, refcount, PAGE_SIZE, PAGE_SIZE_2M,
    },
    sync::IrqSpinlock,
};

/// Fault-driven population hooks for file-backed or otherwise external
/// mappings. `arg` is an opaque cookie for the collaborator.
#[derive(Debug, Clone, Copy)]
pub struct MapCallbacks {
    pub map_in: fn(vaddr: u64, huge: bool, arg: usize) -> bool,
    pub unmap: fn(vaddr: u64, huge: bool, arg: usize) -> bool,
    pub arg: usize,
}

/// One live virtual range.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub base: u64,
    pub len: u64,
    pub flags: MapFlags,
    pub huge: bool,
    /// Populate on fault instead of at map time.
    pub demand: bool,
    /// Direct translation; unmap must not release frames.
    pub unmanaged: bool,
    pub callbacks: Option<MapCallbacks>,
}

impl Mapping {
    pub const fn end(&self) -> u64 {
        self.base + self.len
    }

    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Page granularity of this mapping.
    pub const fn step(&self) -> u64 {
        if self.huge {
            PAGE_SIZE_2M as u64
        } else {
            PAGE_SIZE as u64
        }
    }
}

/// Ordered, non-overlapping set of mappings keyed by base address. Pure
/// bookkeeping: the page tables are updated by the address space around it.
pub struct MappingSet {
    map: BTreeMap<u64, Mapping>,
}

impl MappingSet {
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.map.values()
    }

    /// Does any mapping intersect `[base, base + len)`?
    pub fn overlaps(&self, base: u64, len: u64) -> bool {
        let end = base + len;
        if let Some((_, prev)) = self.map.range(..=base).next_back() {
            if prev.end() > base {
                return true;
            }
        }
        self.map.range(base..end).next().is_some()
    }

    pub fn insert(&mut self, mapping: Mapping) {
        debug_assert!(!self.overlaps(mapping.base, mapping.len));
        self.map.insert(mapping.base, mapping);
    }

    /// Mapping containing `addr`.
    pub fn lookup(&self, addr: u64) -> Option<&Mapping> {
        let (_, candidate) = self.map.range(..=addr).next_back()?;
        candidate.contains(addr).then_some(candidate)
    }

    /// Cut `[base, base + len)` out of the set. Wholly covered mappings are
    /// removed; partially covered ones are split and their remainders kept.
    /// Returns the removed pieces, each carrying its originating mapping's
    /// metadata.
    pub fn remove_range(&mut self, base: u64, len: u64) -> Vec<Mapping> {
        let end = base + len;
        let mut removed = Vec::new();

        // Collect every base that intersects the range, including one that
        // begins before it.
        let mut victims: Vec<u64> = Vec::new();
        if let Some((&b, prev)) = self.map.range(..=base).next_back() {
            if prev.end() > base {
                victims.push(b);
            }
        }
        victims.extend(self.map.range(base..end).map(|(&b, _)| b));
        victims.dedup();

        for b in victims {
            let mapping = self.map.remove(&b).expect("victim base just observed");

            let cut_start = mapping.base.max(base);
            let cut_end = mapping.end().min(end);

            if cut_start > mapping.base {
                self.map.insert(
                    mapping.base,
                    Mapping {
                        len: cut_start - mapping.base,
                        ..mapping
                    },
                );
            }
            if cut_end < mapping.end() {
                self.map.insert(
                    cut_end,
                    Mapping {
                        base: cut_end,
                        len: mapping.end() - cut_end,
                        ..mapping
                    },
                );
            }

            removed.push(Mapping {
                base: cut_start,
                len: cut_end - cut_start,
                ..mapping
            });
        }

        removed
    }
}

impl Default for MappingSet {
    fn default() -> Self {
        Self::new()
    }
}

struct SpaceInner {
    mapper: PageMapper,
    holes: HoleTree,
    mappings: MappingSet,
}

/// See module docs.
pub struct AddressSpace {
    inner: IrqSpinlock<SpaceInner>,
    /// Bumped on every unmap; remote CPUs reload CR3 when they observe a
    /// stale generation on reschedule.
    generation: AtomicU64,
}

static BOOT_SPACE: spin::Once<Arc<AddressSpace>> = spin::Once::new();

/// Wrap the bootloader-built tables as the boot address space. Kernel
/// threads and the idle loops run on it.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init_boot_space() {
    use x86_64::registers::control::Cr3;

    let (frame, _) = Cr3::read();
    let root_phys = frame.start_address().as_u64();

    BOOT_SPACE.call_once(|| {
        // SAFETY: CR3 points at the live boot tables.
        let mapper = unsafe { PageMapper::new(root_phys) };
        Arc::new(AddressSpace {
            inner: IrqSpinlock::new(SpaceInner {
                mapper,
                holes: HoleTree::new(),
                mappings: MappingSet::new(),
            }),
            generation: AtomicU64::new(0),
        })
    });
}

/// The boot (kernel-only) address space.
pub fn boot_space() -> Arc<AddressSpace> {
    BOOT_SPACE
        .get()
        .expect("boot address space used before mm::init")
        .clone()
}

impl AddressSpace {
    /// Fresh user address space: new root table with the kernel half
    /// copied by reference from the boot tables, and one hole spanning all
    /// of user space.
    pub fn new() -> Arc<Self> {
        let root_phys = pmm::phys(1);

        // SAFETY: just allocated, zeroed, exclusively ours.
        let mapper = unsafe { PageMapper::new(root_phys) };

        {
            let boot = boot_space();
            let boot_inner = boot.inner.lock();
            let boot_root = boot_inner.mapper.root();
            let new_root = mapper.root();
            for idx in page_table::KERNEL_HALF_START..page_table::ENTRIES_PER_TABLE {
                // SAFETY: both roots are valid tables; the kernel half is
                // immutable after boot.
                unsafe {
                    (*new_root).entries[idx] = (*boot_root).entries[idx];
                }
            }
        }

        let mut holes = HoleTree::new();
        holes.give_back(mm::USER_BASE, mm::USER_END + 1 - mm::USER_BASE);

        Arc::new(Self {
            inner: IrqSpinlock::new(SpaceInner {
                mapper,
                holes,
                mappings: MappingSet::new(),
            }),
            generation: AtomicU64::new(0),
        })
    }

    /// Physical address of the top-level table (CR3 value).
    pub fn root_phys(&self) -> u64 {
        self.inner.lock().mapper.root_phys()
    }

    /// Merge `[base, base + len)` into the hole tree, coalescing with
    /// exact neighbors. Bring-up paths use this to seed or widen the
    /// allocatable range of a space.
    pub fn create_hole(&self, base: u64, len: usize) {
        self.inner.lock().holes.give_back(base, len as u64);
    }

    /// Current TLB generation; consumed by the reschedule path.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Anonymous mapping. With a hint the range is carved exactly there;
    /// without one the leftmost sufficient hole is used. `DEMAND` defers
    /// population to the fault handler.
    pub fn map(&self, hint: Option<u64>, len: usize, flags: MapFlags) -> KernelResult<u64> {
        self.map_internal(hint, len, flags, None)
    }

    /// As [`map`](Self::map), with fault callbacks: pages are populated by
    /// `callbacks.map_in` and torn down by `callbacks.unmap`.
    pub fn map_with(
        &self,
        hint: Option<u64>,
        len: usize,
        flags: MapFlags,
        callbacks: MapCallbacks,
    ) -> KernelResult<u64> {
        self.map_internal(hint, len, flags, Some(callbacks))
    }

    fn map_internal(
        &self,
        hint: Option<u64>,
        len: usize,
        flags: MapFlags,
        callbacks: Option<MapCallbacks>,
    ) -> KernelResult<u64> {
        let entry_flags = flags.filter().ok_or(KernelError::InvalidArgument)?;
        if flags.contains(MapFlags::OVERRIDE) {
            // Direct mappings go through map_direct with explicit phys.
            return Err(KernelError::InvalidArgument);
        }
        if len == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let step = if flags.contains(MapFlags::LARGE) {
            PAGE_SIZE_2M as u64
        } else {
            PAGE_SIZE as u64
        };
        let len = (len as u64).next_multiple_of(step);

        if flags.contains(MapFlags::FIXED) {
            let Some(base) = hint else {
                return Err(KernelError::InvalidArgument);
            };
            // FIXED replaces whatever is there.
            self.unmap(base, len as usize)?;
        }

        let mut inner = self.inner.lock();

        let base = match hint {
            Some(base) => {
                if base % step != 0 || !inner.holes.carve(base, len) {
                    return Err(KernelError::InvalidAddress { addr: base as usize });
                }
                base
            }
            None => {
                let hole = inner
                    .holes
                    .first_fit(len)
                    .ok_or(KernelError::OutOfVirtualSpace {
                        requested: len as usize,
                    })?;
                let base = hole.base.next_multiple_of(step);
                if base + len > hole.end() || !inner.holes.carve(base, len) {
                    return Err(KernelError::OutOfVirtualSpace {
                        requested: len as usize,
                    });
                }
                base
            }
        };

        let demand = flags.contains(MapFlags::DEMAND) || callbacks.is_some();
        if !demand {
            let huge = flags.contains(MapFlags::LARGE);
            let mut virt = base;
            while virt < base + len {
                if huge {
                    let phys = pmm::phys_aligned(512, 512);
                    inner.mapper.map_2m(virt, phys, entry_flags);
                } else {
                    let phys = pmm::phys(1);
                    inner.mapper.map_4k(virt, phys, entry_flags);
                }
                virt += step;
            }
        }

        inner.mappings.insert(Mapping {
            base,
            len,
            flags,
            huge: flags.contains(MapFlags::LARGE),
            demand,
            unmanaged: false,
            callbacks,
        });

        Ok(base)
    }

    /// Unmanaged direct mapping (MMIO): translations are installed verbatim
    /// and never release frames on unmap. Requires `OVERRIDE`.
    pub fn map_direct(
        &self,
        phys: u64,
        virt: u64,
        len: usize,
        flags: MapFlags,
    ) -> KernelResult<u64> {
        if !flags.contains(MapFlags::OVERRIDE) {
            return Err(KernelError::InvalidArgument);
        }
        let entry_flags = flags.filter().ok_or(KernelError::InvalidArgument)?;

        let huge = flags.contains(MapFlags::LARGE);
        let step = if huge {
            PAGE_SIZE_2M as u64
        } else {
            PAGE_SIZE as u64
        };
        let len = (len as u64).next_multiple_of(step);

        let mut inner = self.inner.lock();

        // User-range direct mappings participate in hole accounting;
        // kernel-half ones (the usual MMIO case) live outside it.
        let in_user = virt >= mm::USER_BASE && virt + len <= mm::USER_END + 1;
        if in_user {
            if inner.mappings.overlaps(virt, len) {
                return Err(KernelError::InvalidAddress { addr: virt as usize });
            }
            if !inner.holes.carve(virt, len) {
                return Err(KernelError::InvalidAddress { addr: virt as usize });
            }
        }

        let mut offset = 0;
        while offset < len {
            if huge {
                inner.mapper.map_2m(virt + offset, phys + offset, entry_flags);
            } else {
                inner.mapper.map_4k(virt + offset, phys + offset, entry_flags);
            }
            offset += step;
        }

        if in_user {
            inner.mappings.insert(Mapping {
                base: virt,
                len,
                flags,
                huge,
                demand: false,
                unmanaged: true,
                callbacks: None,
            });
        }

        Ok(virt)
    }

    /// Tear down every page of `[base, base + len)`: callback-backed pages
    /// are released by their collaborator, managed frames go back through
    /// the refcount table, unmanaged translations are simply cleared. The
    /// range returns to the hole tree.
    pub fn unmap(&self, base: u64, len: usize) -> KernelResult<()> {
        let base = mm::page_align_down(base);
        let len = mm::page_align_up(len as u64);

        let pieces = {
            let mut inner = self.inner.lock();
            let pieces = inner.mappings.remove_range(base, len);

            for piece in &pieces {
                let step = piece.step();
                let mut virt = piece.base;
                while virt < piece.end() {
                    if let Some(cb) = piece.callbacks {
                        // Collaborator owns the frame lifecycle.
                        drop(inner);
                        (cb.unmap)(virt, piece.huge, cb.arg);
                        inner = self.inner.lock();
                    } else {
                        let old = if piece.huge {
                            inner.mapper.unmap_2m(virt)
                        } else {
                            inner.mapper.unmap_4k(virt)
                        };

                        if let Some(entry) = old {
                            if !piece.unmanaged
                                && entry & PageFlags::MANAGED.bits() != 0
                            {
                                let frames = if piece.huge { 512 } else { 1 };
                                release_frames(entry & page_table::ADDR_MASK, frames);
                            }
                        }
                    }

                    page_table::flush_local(virt);
                    virt += step;
                }

                inner.holes.give_back(piece.base, piece.len);
            }

            pieces
        };

        if !pieces.is_empty() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            crate::sched::tlb_shootdown();
        }

        Ok(())
    }

    /// Physical address backing `vaddr`, or `None`.
    pub fn resolve(&self, vaddr: u64) -> Option<u64> {
        self.inner.lock().mapper.translate(vaddr)
    }

    /// Metadata of the mapping containing `vaddr`.
    pub fn mapping_at(&self, vaddr: u64) -> Option<Mapping> {
        self.inner.lock().mappings.lookup(vaddr).copied()
    }

    /// Copy-on-write clone for fork. Managed private pages lose their
    /// write bit on both sides and gain a refcount; SHARED pages keep
    /// writability and gain a refcount; unmanaged translations are copied
    /// verbatim. Demand/callback mappings carry over untouched and fault
    /// in independently.
    pub fn fork(&self) -> KernelResult<Arc<AddressSpace>> {
        let child = AddressSpace::new();

        let mut parent_inner = self.inner.lock();
        let mut child_inner = child.inner.lock();

        let parent_mappings: Vec<Mapping> = parent_inner.mappings.iter().copied().collect();

        for mapping in parent_mappings {
            child_inner.holes.carve(mapping.base, mapping.len);
            child_inner.mappings.insert(mapping);

            let step = mapping.step();
            let mut virt = mapping.base;
            while virt < mapping.end() {
                let entry = if mapping.huge {
                    parent_inner.mapper.entry_2m(virt)
                } else {
                    parent_inner.mapper.entry_4k(virt)
                };

                if let Some(entry) = entry {
                    let phys = entry & page_table::ADDR_MASK;
                    let frames = if mapping.huge { 512 } else { 1 };

                    if mapping.unmanaged {
                        // Same translation, no ownership.
                        install_raw(&mut child_inner.mapper, virt, entry, mapping.huge);
                    } else if mapping.flags.contains(MapFlags::SHARED) {
                        retain_frames(phys, frames);
                        install_raw(&mut child_inner.mapper, virt, entry, mapping.huge);
                    } else {
                        // Private page: read-only on both sides until a
                        // write fault promotes a private copy.
                        let cow_entry = entry & !PageFlags::WRITE.bits();
                        retain_frames(phys, frames);
                        if mapping.huge {
                            parent_inner.mapper.update_2m(virt, cow_entry);
                        } else {
                            parent_inner.mapper.update_4k(virt, cow_entry);
                        }
                        install_raw(&mut child_inner.mapper, virt, cow_entry, mapping.huge);
                        page_table::flush_local(virt);
                    }
                }

                virt += step;
            }
        }

        drop(child_inner);
        drop(parent_inner);

        self.generation.fetch_add(1, Ordering::AcqRel);
        crate::sched::tlb_shootdown();

        Ok(child)
    }

    /// Resolve a page fault at `vaddr`. Returns true when the fault was
    /// satisfied (demand fill, COW promotion, or collaborator map-in) and
    /// the faulting instruction can be retried.
    pub fn handle_fault(&self, vaddr: u64, write: bool, present: bool) -> bool {
        let mut inner = self.inner.lock();

        let Some(mapping) = inner.mappings.lookup(vaddr).copied() else {
            return false;
        };

        let page = if mapping.huge {
            vaddr & !(PAGE_SIZE_2M as u64 - 1)
        } else {
            mm::page_align_down(vaddr)
        };

        // Collaborator-backed: hand the whole business over.
        if let Some(cb) = mapping.callbacks {
            drop(inner);
            return (cb.map_in)(page, mapping.huge, cb.arg);
        }

        if !present {
            // Demand fill with zeroed frames.
            if !mapping.demand {
                return false;
            }
            let entry_flags = match mapping.flags.filter() {
                Some(f) => f,
                None => return false,
            };

            if mapping.huge {
                let phys = pmm::phys_aligned(512, 512);
                inner.mapper.map_2m(page, phys, entry_flags);
            } else {
                let phys = pmm::phys(1);
                inner.mapper.map_4k(page, phys, entry_flags);
            }
            page_table::flush_local(page);
            return true;
        }

        if write {
            // Write to a present page: COW promotion, if the mapping
            // allows writing at all.
            if !mapping.flags.contains(MapFlags::WRITE) {
                return false;
            }

            let entry = if mapping.huge {
                inner.mapper.entry_2m(page)
            } else {
                inner.mapper.entry_4k(page)
            };
            let Some(entry) = entry else {
                return false;
            };
            if entry & PageFlags::WRITE.bits() != 0 {
                // Raced with another thread's promotion.
                page_table::flush_local(page);
                return true;
            }

            let phys = entry & page_table::ADDR_MASK;
            let frames = if mapping.huge { 512 } else { 1 };
            let bytes = frames * PAGE_SIZE;

            if refcount::is_shared(phys) {
                // Still shared: copy into a private frame.
                let new_phys = if mapping.huge {
                    pmm::phys_aligned(512, 512)
                } else {
                    pmm::phys(1)
                };

                // SAFETY: both frames are covered by the direct window.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        mm::phys_to_virt(phys) as *const u8,
                        mm::phys_to_virt(new_phys) as *mut u8,
                        bytes,
                    );
                }

                let new_entry =
                    (entry & !page_table::ADDR_MASK) | new_phys | PageFlags::WRITE.bits();
                if mapping.huge {
                    inner.mapper.update_2m(page, new_entry);
                } else {
                    inner.mapper.update_4k(page, new_entry);
                }
                release_frames(phys, frames);
            } else {
                // Sole owner again: write-enable in place.
                let new_entry = entry | PageFlags::WRITE.bits();
                if mapping.huge {
                    inner.mapper.update_2m(page, new_entry);
                } else {
                    inner.mapper.update_4k(page, new_entry);
                }
            }

            page_table::flush_local(page);
            return true;
        }

        false
    }

    /// Release every user mapping and user-half table frame. Used by exit
    /// and exec; the address space object itself stays usable as an empty
    /// shell until dropped.
    pub fn clear_user(&self) {
        let ranges: Vec<(u64, u64)> = {
            let inner = self.inner.lock();
            inner.mappings.iter().map(|m| (m.base, m.len)).collect()
        };

        for (base, len) in ranges {
            let _ = self.unmap(base, len as usize);
        }

        self.inner.lock().mapper.free_user_tables();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.clear_user();
        let root = self.inner.lock().mapper.root_phys();
        pmm::free_phys(root, 1);
    }
}

fn install_raw(mapper: &mut PageMapper, virt: u64, entry: u64, huge: bool) {
    let flags = PageFlags::from_bits_retain(entry & !page_table::ADDR_MASK);
    let phys = entry & page_table::ADDR_MASK;
    if huge {
        mapper.map_2m(virt, phys, flags);
    } else {
        mapper.map_4k(virt, phys, flags);
    }
}

fn retain_frames(phys: u64, frames: usize) {
    for i in 0..frames {
        refcount::retain(phys + (i * PAGE_SIZE) as u64);
    }
}

fn release_frames(phys: u64, frames: usize) {
    for i in 0..frames {
        refcount::release(phys + (i * PAGE_SIZE) as u64);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn anon(base: u64, len: u64) -> Mapping {
        Mapping {
            base,
            len,
            flags: MapFlags::READ | MapFlags::WRITE | MapFlags::USER,
            huge: false,
            demand: true,
            unmanaged: false,
            callbacks: None,
        }
    }

    #[test]
    fn lookup_finds_containing_mapping() {
        let mut set = MappingSet::new();
        set.insert(anon(0x1000, 0x3000));
        set.insert(anon(0x8000, 0x1000));

        assert_eq!(set.lookup(0x1000).map(|m| m.base), Some(0x1000));
        assert_eq!(set.lookup(0x3FFF).map(|m| m.base), Some(0x1000));
        assert!(set.lookup(0x4000).is_none());
        assert_eq!(set.lookup(0x8000).map(|m| m.base), Some(0x8000));
    }

    #[test]
    fn overlaps_sees_straddling_ranges() {
        let mut set = MappingSet::new();
        set.insert(anon(0x2000, 0x2000));

        assert!(set.overlaps(0x1000, 0x2000));
        assert!(set.overlaps(0x3000, 0x1000));
        assert!(set.overlaps(0x2000, 0x2000));
        assert!(!set.overlaps(0x1000, 0x1000));
        assert!(!set.overlaps(0x4000, 0x1000));
    }

    #[test]
    fn remove_range_deletes_contained_mappings() {
        let mut set = MappingSet::new();
        set.insert(anon(0x1000, 0x1000));
        set.insert(anon(0x3000, 0x1000));

        let removed = set.remove_range(0x0, 0x10000);
        assert_eq!(removed.len(), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn remove_range_splits_partial_overlap() {
        let mut set = MappingSet::new();
        set.insert(anon(0x1000, 0x4000));

        // Cut the middle page out of a four-page mapping.
        let removed = set.remove_range(0x2000, 0x1000);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].base, 0x2000);
        assert_eq!(removed[0].len, 0x1000);

        let left = set.lookup(0x1000).copied().expect("left remainder kept");
        assert_eq!((left.base, left.len), (0x1000, 0x1000));
        let right = set.lookup(0x3000).copied().expect("right remainder kept");
        assert_eq!((right.base, right.len), (0x3000, 0x2000));
        assert!(set.lookup(0x2000).is_none());
    }

    #[test]
    fn remove_range_trims_leading_mapping() {
        let mut set = MappingSet::new();
        set.insert(anon(0x1000, 0x4000));

        // Unmap overlaps the tail only.
        let removed = set.remove_range(0x3000, 0x4000);
        assert_eq!(removed.len(), 1);
        assert_eq!((removed[0].base, removed[0].len), (0x3000, 0x2000));

        let kept = set.lookup(0x1000).copied().expect("head remainder kept");
        assert_eq!((kept.base, kept.len), (0x1000, 0x2000));
    }

    #[test]
    fn mappings_and_holes_stay_disjoint() {
        // Exercise the bookkeeping invariant: every user page sits in
        // exactly one hole or one mapping, never both.
        let mut holes = HoleTree::new();
        let mut set = MappingSet::new();
        holes.give_back(mm::USER_BASE, mm::USER_END + 1 - mm::USER_BASE);
        let total = holes.total_free();

        for (base, len) in [(0x100000u64, 0x4000u64), (0x200000, 0x2000), (0x300000, 0x1000)] {
            assert!(holes.carve(base, len));
            set.insert(anon(base, len));
        }

        for hole in holes.holes() {
            for m in set.iter() {
                assert!(hole.end() <= m.base || m.end() <= hole.base);
            }
        }
        assert_eq!(
            holes.total_free() + set.iter().map(|m| m.len).sum::<u64>(),
            total
        );

        for piece in set.remove_range(0x100000, 0x300000) {
            holes.give_back(piece.base, piece.len);
        }
        assert_eq!(holes.total_free(), total - 0x1000);
    }
}
