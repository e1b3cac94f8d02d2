//! Memory management
//!
//! Layered leaves-first: the physical frame bitmap ([`pmm`]), the per-frame
//! share counts ([`refcount`]), and on top of both the per-process virtual
//! address spaces ([`address_space`]) with their hole and mapping trees,
//! four-level page tables ([`page_table`]) and fault handling
//! ([`page_fault`]).

use core::sync::atomic::{AtomicU64, Ordering};

pub mod address_space;
pub mod heap;
pub mod hole_tree;
pub mod page_fault;
pub mod page_table;
pub mod pmm;
pub mod refcount;
pub mod uaccess;

pub use address_space::{AddressSpace, MapCallbacks, Mapping};
pub use page_table::{MapFlags, PageFlags};

/// Size of a 4 KiB page/frame.
pub const PAGE_SIZE: usize = 4096;
/// Size of a 2 MiB huge page.
pub const PAGE_SIZE_2M: usize = 2 * 1024 * 1024;

/// Base of the kernel image mapping.
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;
/// Default base of the direct physical-memory window. The boot protocol may
/// relocate it; [`phys_offset`] is authoritative after boot.
pub const PHYS_WINDOW: u64 = 0xFFFF_8000_0000_0000;

/// First user address handed out by the VMM; `mmap` hints below this are
/// rejected.
pub const MAP_MIN_ADDR: u64 = 0x8000_0000;
/// Last valid user address (inclusive).
pub const USER_END: u64 = 0x7FFF_FFFF_FFFF;
/// Base of the user hole created in every fresh address space.
pub const USER_BASE: u64 = 0x100000;

/// Default user stack size (demand paged).
pub const USER_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Kernel stack size for every thread, in pages.
pub const KSTACK_PAGES: usize = 4;

/// Round `len` up to whole pages.
pub const fn page_count(len: usize) -> usize {
    (len + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Align an address down to its page base.
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Align an address up to the next page boundary.
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Offset of the direct physical-memory window, set once from boot info.
static PHYS_OFFSET: AtomicU64 = AtomicU64::new(PHYS_WINDOW);

pub fn set_phys_offset(offset: u64) {
    PHYS_OFFSET.store(offset, Ordering::Release);
}

pub fn phys_offset() -> u64 {
    PHYS_OFFSET.load(Ordering::Acquire)
}

/// Kernel-virtual view of a physical address through the direct window.
pub fn phys_to_virt(phys: u64) -> u64 {
    phys_offset() + phys
}

/// Invert [`phys_to_virt`], accepting both the direct window and the kernel
/// image mapping.
pub fn virt_to_phys(virt: u64) -> u64 {
    if virt >= KERNEL_BASE {
        return virt - KERNEL_BASE;
    }

    let offset = phys_offset();
    if virt >= offset {
        return virt - offset;
    }

    virt
}

/// Bring up the memory subsystem from the boot memory map: PMM bitmap,
/// refcount table, kernel heap, boot address space.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(boot_info: &'static bootloader_api::BootInfo) {
    if let bootloader_api::info::Optional::Some(offset) = boot_info.physical_memory_offset {
        set_phys_offset(offset);
    }

    // SAFETY: called once on the bootstrap CPU with the regions the
    // bootloader handed us.
    unsafe { pmm::init(&boot_info.memory_regions) };
    heap::init();
    refcount::init(pmm::nr_pages());
    address_space::init_boot_space();

    log::info!(target: "mm", "free memory: {} KiB", pmm::free_pages() * PAGE_SIZE / 1024);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_count(0), 0);
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(PAGE_SIZE), 1);
        assert_eq!(page_count(PAGE_SIZE + 1), 2);
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
    }
}
