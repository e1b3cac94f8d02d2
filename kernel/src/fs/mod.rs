//! Filesystem collaborator surface
//!
//! The VFS proper (node lookup, mounts, on-disk formats) is an external
//! collaborator; the kernel core carries only what its own semantics
//! need: the per-process descriptor table with POSIX dup/CLOEXEC behavior
//! ([`fd`]) and the block-device trait the page cache sits in front of
//! ([`blockdev`]).

pub mod blockdev;
pub mod fd;

pub use blockdev::{BlockDevice, RamDisk};
pub use fd::{FdTable, OpenFile};
