//! Legacy PIC + PIT: the bootstrap CPU's tick source
//!
//! The 8259 pair is remapped to vectors 32..48 with everything but IRQ0
//! masked; the PIT's channel 0 runs in rate-generator mode at the
//! scheduler tick frequency. Application processors never see IRQ0 — the
//! BSP fans the tick out as reschedule IPIs.

use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::time::TICK_HZ;

const PIT_FREQUENCY: u64 = 1_193_182;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 2 (rate generator).
const PIT_MODE_RATE: u8 = 0x34;

static PICS: Mutex<pic8259::ChainedPics> = Mutex::new(
    // SAFETY: 32/40 are the conventional remap offsets and collide with
    // nothing else in the IDT.
    unsafe { pic8259::ChainedPics::new(32, 40) },
);

/// Remap the PICs, mask everything except the timer line, and start the
/// PIT at `TICK_HZ`.
pub fn init() {
    {
        let mut pics = PICS.lock();
        // SAFETY: bring-up path; the IDT already has gates at the remap
        // offsets.
        unsafe {
            pics.initialize();
            // Bit clear = unmasked; only IRQ0 on the primary PIC.
            pics.write_masks(0xFE, 0xFF);
        }
    }

    let divisor = (PIT_FREQUENCY / TICK_HZ as u64) as u16;
    let mut command: Port<u8> = Port::new(PIT_COMMAND);
    let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0);

    // SAFETY: standard PIT programming sequence on its dedicated ports.
    unsafe {
        command.write(PIT_MODE_RATE);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
}

/// Acknowledge IRQ0.
pub fn end_of_interrupt() {
    // SAFETY: notifying end-of-interrupt for the timer vector only.
    unsafe {
        PICS.lock().notify_end_of_interrupt(crate::arch::TIMER_VECTOR);
    }
}
