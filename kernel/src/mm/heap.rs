//! Kernel heap
//!
//! `linked_list_allocator` over a PMM-backed region reached through the
//! direct physical window. On the host (unit tests) the crate uses the
//! system allocator instead; see `lib.rs`.

use crate::mm::{page_count, pmm};

/// Kernel heap size (16 MiB).
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Carve the heap out of physical memory and hand it to the allocator.
/// Must run after [`pmm::init`] and before the first `alloc` use.
pub fn init() {
    let base = pmm::alloc(page_count(HEAP_SIZE));

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: the region was just allocated for exclusive heap use and is
    // mapped through the direct window.
    unsafe {
        ALLOCATOR.lock().init(base as *mut u8, HEAP_SIZE);
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = base;
}
