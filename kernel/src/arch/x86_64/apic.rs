//! Local APIC
//!
//! Just enough xAPIC to run the scheduler: identification, EOI, and the
//! ICR writes behind reschedule IPIs (self and all-but-self shorthands).
//! Registers are reached through the direct physical window.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_MASK: u64 = 0xFFFF_F000;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;

const REG_ID: u64 = 0x20;
const REG_EOI: u64 = 0xB0;
const REG_SPURIOUS: u64 = 0xF0;
const REG_ICR_LOW: u64 = 0x300;

/// ICR destination shorthands.
const DEST_SELF: u32 = 0b01 << 18;
const DEST_ALL_BUT_SELF: u32 = 0b11 << 18;

/// Kernel-virtual base of the local APIC window; zero until init.
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

fn reg_read(offset: u64) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        return 0;
    }
    // SAFETY: the APIC window is mapped through the direct window and
    // `offset` is a register defined by the architecture.
    unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
}

fn reg_write(offset: u64, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        return;
    }
    // SAFETY: as reg_read.
    unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) }
}

/// Enable the local APIC on this CPU and record its MMIO window.
pub fn init() {
    // SAFETY: IA32_APIC_BASE is architectural.
    let mut msr = x86_64::registers::model_specific::Msr::new(IA32_APIC_BASE);
    let value = unsafe { msr.read() };
    let phys = value & APIC_BASE_MASK;
    LAPIC_BASE.store(mm::phys_to_virt(phys), Ordering::Release);

    // SAFETY: setting the global-enable bit and the architectural base.
    unsafe { msr.write(value | APIC_GLOBAL_ENABLE) };

    // Software-enable with the spurious vector.
    reg_write(
        REG_SPURIOUS,
        0x100 | crate::arch::SPURIOUS_VECTOR as u32,
    );
}

/// This CPU's local APIC id (0 before init).
pub fn lapic_id() -> u32 {
    reg_read(REG_ID) >> 24
}

pub fn end_of_interrupt() {
    reg_write(REG_EOI, 0);
}

/// Fixed-delivery IPI to every other CPU.
pub fn send_ipi_all_but_self(vector: u8) {
    reg_write(REG_ICR_LOW, DEST_ALL_BUT_SELF | vector as u32);
}

/// Fixed-delivery IPI to ourselves (reschedule kick).
pub fn send_ipi_self(vector: u8) {
    reg_write(REG_ICR_LOW, DEST_SELF | vector as u32);
}
