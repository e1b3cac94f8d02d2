//! Physical memory manager
//!
//! One bit per 4 KiB frame, set = in use. No freelists, no buddies: every
//! allocation rescans from bit zero for a run of clear bits, which keeps
//! the allocator trivially correct and the bitmap the single source of
//! truth. Guarded by one IRQ-saving spinlock.
//!
//! Invariants: the bits covering the bitmap itself never clear, and frames
//! the bootloader marked non-usable are permanently set.

use crate::{
    mm::{self, PAGE_SIZE},
    sync::IrqSpinlock,
};

/// Fixed-size bitmap over physical frames. Bit set means the frame is in
/// use or not available at all.
pub struct FrameBitmap {
    words: &'static mut [u64],
    nr_pages: usize,
}

impl FrameBitmap {
    /// Wrap `words` as a bitmap covering `nr_pages` frames. All bits start
    /// set; usable ranges are cleared explicitly afterwards.
    pub fn new(words: &'static mut [u64], nr_pages: usize) -> Self {
        words.fill(u64::MAX);
        Self { words, nr_pages }
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    pub fn clear(&mut self, idx: usize) {
        self.words[idx / 64] &= !(1 << (idx % 64));
    }

    #[inline]
    pub fn test(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn set_range(&mut self, start: usize, count: usize) {
        for idx in start..start + count {
            self.set(idx);
        }
    }

    pub fn clear_range(&mut self, start: usize, count: usize) {
        for idx in start..start + count {
            self.clear(idx);
        }
    }

    /// Scan from frame 0 for `count` consecutive clear bits; mark them set
    /// and return the first frame index.
    pub fn find_and_set_run(&mut self, count: usize) -> Option<usize> {
        self.find_and_set_run_aligned(count, 1)
    }

    /// As [`find_and_set_run`](Self::find_and_set_run), but the run must
    /// start on a multiple of `align` frames (huge-page backing).
    pub fn find_and_set_run_aligned(&mut self, count: usize, align: usize) -> Option<usize> {
        if count == 0 || count > self.nr_pages {
            return None;
        }

        let mut run = 0;
        let mut start = 0;

        for idx in 0..self.nr_pages {
            if self.test(idx) {
                run = 0;
                continue;
            }

            if run == 0 {
                if idx % align != 0 {
                    continue;
                }
                start = idx;
            }
            run += 1;

            if run == count {
                self.set_range(start, count);
                return Some(start);
            }
        }

        None
    }

    pub fn free_count(&self) -> usize {
        (0..self.nr_pages).filter(|&idx| !self.test(idx)).count()
    }
}

struct Pmm {
    bitmap: Option<FrameBitmap>,
    nr_usable: usize,
}

static PMM: IrqSpinlock<Pmm> = IrqSpinlock::new(Pmm {
    bitmap: None,
    nr_usable: 0,
});

/// Build the frame bitmap from the boot memory map.
///
/// The bitmap itself is stored in the first usable run large enough to hold
/// it; its own frames are set before the allocator is opened for business.
///
/// # Safety
///
/// Must run once, on the bootstrap CPU, before any allocation, with the
/// direct physical window already mapped.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn init(regions: &bootloader_api::info::MemoryRegions) {
    use bootloader_api::info::MemoryRegionKind;

    let max_end = regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| r.end)
        .max()
        .unwrap_or(0);

    let nr_pages = (max_end as usize) / PAGE_SIZE;
    let map_bytes = nr_pages.div_ceil(8).next_multiple_of(8);
    let map_pages = mm::page_count(map_bytes);

    // Host the bitmap in the first usable region that fits it, above 1 MiB.
    let map_phys = regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .find(|r| r.start >= 0x100000 && (r.end - r.start) as usize >= map_pages * PAGE_SIZE)
        .map(|r| r.start)
        .expect("no usable region can hold the frame bitmap");

    let words = unsafe {
        core::slice::from_raw_parts_mut(mm::phys_to_virt(map_phys) as *mut u64, map_bytes / 8)
    };

    let mut bitmap = FrameBitmap::new(words, nr_pages);

    // Open up the usable ranges, skipping the legacy low megabyte.
    let mut usable = 0usize;
    for region in regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
    {
        let first = (region.start.max(0x100000) as usize) / PAGE_SIZE;
        let last = (region.end as usize) / PAGE_SIZE;
        for idx in first..last.min(nr_pages) {
            bitmap.clear(idx);
            usable += 1;
        }
    }

    // The bitmap's own frames stay set forever.
    let map_first = map_phys as usize / PAGE_SIZE;
    bitmap.set_range(map_first, map_pages);
    usable -= map_pages;

    let mut pmm = PMM.lock();
    pmm.bitmap = Some(bitmap);
    pmm.nr_usable = usable;
}

/// Host-test bring-up: back "physical memory" with a leaked allocation
/// and point the direct window at it, so frame-consuming code paths run
/// under `cargo test`.
#[cfg(all(test, not(target_os = "none")))]
pub fn init_for_tests() {
    static TEST_INIT: spin::Once<()> = spin::Once::new();

    TEST_INIT.call_once(|| {
        const TEST_PAGES: usize = 4096;

        let backing = alloc::vec![0u8; (TEST_PAGES + 1) * PAGE_SIZE].leak();
        let base = (backing.as_ptr() as u64 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        crate::mm::set_phys_offset(base);

        let words = alloc::vec![0u64; TEST_PAGES.div_ceil(64)].leak();
        let mut bitmap = FrameBitmap::new(words, TEST_PAGES);
        // Keep frame 0 reserved so a zero physical address stays invalid.
        bitmap.clear_range(1, TEST_PAGES - 1);

        let mut pmm = PMM.lock();
        pmm.bitmap = Some(bitmap);
        pmm.nr_usable = TEST_PAGES - 1;
    });
}

/// Number of frames tracked by the bitmap.
pub fn nr_pages() -> usize {
    PMM.lock().bitmap.as_ref().map_or(0, FrameBitmap::nr_pages)
}

/// Number of currently free frames.
pub fn free_pages() -> usize {
    PMM.lock().nr_usable
}

fn alloc_frames(count: usize) -> usize {
    let mut pmm = PMM.lock();
    let bitmap = pmm.bitmap.as_mut().expect("PMM used before init");

    let Some(first) = bitmap.find_and_set_run(count) else {
        panic!("PMM: out of physical memory ({count} pages requested)");
    };

    pmm.nr_usable -= count;
    first
}

/// Allocate `count` contiguous zeroed frames; returns the kernel-virtual
/// base through the direct window. Exhaustion is fatal.
pub fn alloc(count: usize) -> u64 {
    let first = alloc_frames(count);
    let virt = mm::phys_to_virt((first * PAGE_SIZE) as u64);

    // SAFETY: the frames were just taken out of the free pool and the
    // direct window covers all of physical memory.
    unsafe {
        core::ptr::write_bytes(virt as *mut u8, 0, count * PAGE_SIZE);
    }

    virt
}

/// As [`alloc`], but returns the physical base address.
pub fn phys(count: usize) -> u64 {
    mm::virt_to_phys(alloc(count))
}

/// Allocate `count` zeroed frames starting on an `align`-frame boundary;
/// returns the physical base. Backs 2 MiB pages (512/512).
pub fn phys_aligned(count: usize, align: usize) -> u64 {
    let first = {
        let mut pmm = PMM.lock();
        let bitmap = pmm.bitmap.as_mut().expect("PMM used before init");

        let Some(first) = bitmap.find_and_set_run_aligned(count, align) else {
            panic!("PMM: out of physical memory ({count} aligned pages requested)");
        };

        pmm.nr_usable -= count;
        first
    };

    let phys = (first * PAGE_SIZE) as u64;
    // SAFETY: frames just left the free pool; direct window covers them.
    unsafe {
        core::ptr::write_bytes(mm::phys_to_virt(phys) as *mut u8, 0, count * PAGE_SIZE);
    }
    phys
}

/// As [`alloc`], but returns a pointer just past the top of the block, for
/// descending stacks.
pub fn stack(count: usize) -> u64 {
    alloc(count) + (count * PAGE_SIZE) as u64
}

/// Return `count` frames starting at the kernel-virtual address `addr` to
/// the free pool.
pub fn free(addr: u64, count: usize) {
    let first = (mm::virt_to_phys(addr) as usize) / PAGE_SIZE;

    let mut pmm = PMM.lock();
    let bitmap = pmm.bitmap.as_mut().expect("PMM used before init");
    bitmap.clear_range(first, count);
    pmm.nr_usable += count;
}

/// Free by physical address.
pub fn free_phys(phys: u64, count: usize) {
    free(mm::phys_to_virt(phys), count);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn bitmap(pages: usize) -> FrameBitmap {
        let words = alloc::vec![0u64; pages.div_ceil(64)].leak();
        let mut map = FrameBitmap::new(words, pages);
        map.clear_range(0, pages);
        map
    }

    #[test]
    fn run_allocation_scans_from_zero() {
        let mut map = bitmap(128);

        assert_eq!(map.find_and_set_run(1), Some(0));
        assert_eq!(map.find_and_set_run(10), Some(1));

        // Free the first frame; the next scan restarts at zero and reuses it.
        map.clear(0);
        assert_eq!(map.find_and_set_run(1), Some(0));
    }

    #[test]
    fn run_allocation_skips_set_bits() {
        let mut map = bitmap(64);
        map.set(2);

        // A 4-frame run cannot use frames 0..2.
        assert_eq!(map.find_and_set_run(4), Some(3));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut map = bitmap(16);
        assert_eq!(map.find_and_set_run(16), Some(0));
        assert_eq!(map.find_and_set_run(1), None);
    }

    #[test]
    fn free_then_realloc_is_bit_identical() {
        let mut map = bitmap(64);
        let first = map.find_and_set_run(8).expect("8 frames fit in 64");
        let snapshot: alloc::vec::Vec<bool> = (0..64).map(|i| map.test(i)).collect();

        map.clear_range(first, 8);
        let again = map.find_and_set_run(8).expect("freed frames reusable");
        assert_eq!(first, again);

        let after: alloc::vec::Vec<bool> = (0..64).map(|i| map.test(i)).collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn reserved_regions_never_allocated() {
        let mut map = bitmap(32);
        // Model a bootloader-reserved range at [4, 8).
        map.set_range(4, 4);

        let got = map.find_and_set_run(8).expect("room above the hole");
        assert_eq!(got, 8);
        for idx in 4..8 {
            assert!(map.test(idx));
        }
    }
}
