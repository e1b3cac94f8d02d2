//! Page-fault entry point
//!
//! Classifies faults against the current address space's mapping tree.
//! Demand fills, COW promotions and collaborator map-ins are silent;
//! anything unresolvable in user mode injects SIGSEGV into the faulting
//! thread, and in kernel mode is fatal.

use crate::{mm, sched, signal};

/// Architectural error-code bits.
const ERR_PRESENT: u64 = 1 << 0;
const ERR_WRITE: u64 = 1 << 1;
const ERR_USER: u64 = 1 << 2;

/// Handle a page fault at `vaddr` (CR2) with the architectural error code.
/// Returns true when the faulting instruction should be retried.
pub fn handle(vaddr: u64, error_code: u64) -> bool {
    let write = error_code & ERR_WRITE != 0;
    let present = error_code & ERR_PRESENT != 0;
    let user = error_code & ERR_USER != 0;

    let space = sched::current_address_space();
    if space.handle_fault(vaddr, write, present) {
        return true;
    }

    // Kernel touching user memory (copy-in/out) resolves through the same
    // mapping tree above; reaching here means the address is truly bad.
    if !user && vaddr >= mm::phys_offset() {
        panic!(
            "kernel page fault at {:#x} (error {:#x})",
            vaddr, error_code
        );
    }

    if let Some(thread) = sched::current_thread() {
        log::debug!(
            target: "mm",
            "SIGSEGV: tid {} faulted at {:#x} (error {:#x})",
            thread.tid(),
            vaddr,
            error_code
        );
        signal::force_thread_signal(&thread, signal::SIGSEGV);
        return true;
    }

    panic!(
        "unresolvable page fault at {:#x} with no current thread (error {:#x})",
        vaddr, error_code
    );
}
