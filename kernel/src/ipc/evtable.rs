//! Kernel-wide event numbers carried by wire arises.
//!
//! Wires transport a single `i64` event value; these constants are the
//! vocabulary shared by timers, signal delivery, the block cache, and
//! status-change notification.

/// A timer armed against the wire expired.
pub const TIME_WAKE: i64 = 1;
/// A signal became deliverable to the waiting thread.
pub const SIGNAL_WAKE: i64 = 2;
/// Block-cache read request queued (holder-internal).
pub const BLOCK_READ: i64 = 3;
/// Block-cache write request queued (holder-internal).
pub const BLOCK_WRITE: i64 = 4;
/// Block-cache request completed; correlation id in the waker slot.
pub const BLOCK_FIN: i64 = 5;
/// A child process changed status.
pub const STATUS_CHANGE: i64 = 6;
/// Bytes became available in a pipe.
pub const PIPE_DATA: i64 = 7;
/// Space became available in a pipe.
pub const PIPE_SPACE: i64 = 8;
