//! x86_64 architecture support.
//!
//! GDT/TSS, a hand-rolled IDT whose stubs capture the full register frame
//! the scheduler's context switch needs, the local APIC for reschedule
//! IPIs, the legacy PIC + PIT pair for the bootstrap CPU's tick, and the
//! `syscall`/`sysret` entry path.

pub mod apic;
pub mod gdt;
pub mod idt;
pub mod pit;
pub mod syscall;

/// Bootstrap-CPU bring-up, in dependency order. Interrupts stay off until
/// the first context is ready to take them.
#[cfg(target_os = "none")]
pub fn init() {
    gdt::init();
    idt::init();
    apic::init();
    pit::init();
}
