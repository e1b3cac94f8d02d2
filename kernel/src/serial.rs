//! Serial console (COM1)
//!
//! All kernel output goes over the legacy 16550 UART; the framebuffer and
//! TTY stack are external collaborators. Also hosts the `log` crate sink so
//! `log::info!` and friends end up on the same wire as `println!`.

use core::fmt::{self, Write};

use crate::sync::IrqSpinlock;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const COM1: u16 = 0x3F8;

pub struct SerialPort {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    inner: Option<uart_16550::SerialPort>,
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    inner: Option<()>,
}

impl SerialPort {
    const fn empty() -> Self {
        Self { inner: None }
    }

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    fn ensure_init(&mut self) {
        if self.inner.is_none() {
            // SAFETY: COM1 is the standard ISA debug port; nothing else in
            // the kernel drives it.
            let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
            port.init();
            self.inner = Some(port);
        }
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    fn ensure_init(&mut self) {}
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.ensure_init();
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        if let Some(port) = self.inner.as_mut() {
            port.write_str(s)?;
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = s;
        Ok(())
    }
}

static SERIAL: IrqSpinlock<SerialPort> = IrqSpinlock::new(SerialPort::empty());

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // Ignore write errors; there is nowhere to report them.
    let _ = SERIAL.lock().write_fmt(args);
}

// ---------------------------------------------------------------------------
// log crate sink
// ---------------------------------------------------------------------------

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            _print(format_args!(
                "[{:5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger as the `log` facade backend. Called once from
/// early boot, before anything interesting can be logged.
pub fn init_logging() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}
