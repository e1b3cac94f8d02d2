//! Kernel IPC and blocking primitives
//!
//! Three layers: [`Wire`] for single rendezvous with an event number,
//! [`WaitQueue`]/[`Trigger`] for multi-waiter producer/consumer blocking,
//! and [`pipe`] for the POSIX anonymous pipe built on top of wires. All
//! kernel-side sleeping (timers, waitpid, futexes, the block cache) goes
//! through these.

pub mod evtable;
pub mod pipe;
pub mod wait;
pub mod wire;

pub use pipe::Pipe;
pub use wait::{Trigger, WaitQueue};
pub use wire::Wire;
