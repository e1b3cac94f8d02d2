//! Nyx kernel library
//!
//! The core of a preemptive, SMP, POSIX-flavored kernel for x86-64: the
//! physical and virtual memory managers, the round-robin scheduler with
//! its process model, POSIX signals, the wire/queue/trigger blocking
//! primitives, futexes, and the block cache. Device drivers, the VFS
//! proper, TTYs and the ELF loader are external collaborators that plug
//! into the seams exported here.
//!
//! The crate doubles as a host library so its unit tests run under plain
//! `cargo test`: on non-bare-metal targets it links `std`, uses the
//! system allocator, and stubs the privileged architecture surface.

#![no_std]

extern crate alloc;

// Host target (unit tests): use the system allocator so test code using
// Vec/String works unchanged.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod cache;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod time;

// Re-exports for the binary and integration surface.
pub use error::{Errno, KernelError, KernelResult};
pub use mm::AddressSpace;
pub use process::Process;
pub use sched::task::Thread;
