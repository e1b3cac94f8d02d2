//! Kernel binary: boot, bring the core up, hand off to the scheduler.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader_api::{config::Mapping, entry_point, BootInfo, BootloaderConfig};
use nyx_kernel::{cache, mm, println, sched, serial};

/// Ask the bootloader for a full physical-memory window at the direct-map
/// base the rest of the kernel assumes.
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::FixedAddress(mm::PHYS_WINDOW));
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init_logging();
    println!("nyx {}", env!("CARGO_PKG_VERSION"));

    nyx_kernel::arch::x86_64::init();
    mm::init(boot_info);
    sched::init();
    cache::init();

    log::info!(target: "boot", "core online; waiting for init to be loaded");

    // The ELF loader collaborator registers itself and starts init from
    // here on; until then this CPU idles on the tick.
    loop {
        nyx_kernel::arch::halt_until_interrupt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
