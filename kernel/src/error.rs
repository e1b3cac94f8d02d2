//! Kernel error types and POSIX errno values
//!
//! Internal failures travel as [`KernelError`]; at the syscall boundary they
//! are narrowed to an [`Errno`] which the dispatcher returns as `-errno`
//! after stashing it in the calling thread's errno cell.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfVirtualSpace {
        requested: usize,
    },
    InvalidAddress {
        addr: usize,
    },
    UnmappedMemory {
        addr: usize,
    },
    /// Process-related errors
    ProcessNotFound {
        pid: i64,
    },
    ThreadNotFound {
        tid: i64,
    },
    NoChildren,
    /// Wait was interrupted by a signal
    Interrupted,
    /// Operation would block and the caller asked not to
    WouldBlock,
    /// The underlying block device reported an error
    DeviceError {
        code: i32,
    },
    /// Write to a pipe with no readers left
    BrokenPipe,
    /// Permission check failed (signal delivery, setpgid, ...)
    PermissionDenied,
    /// Generic bad argument
    InvalidArgument,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfVirtualSpace { requested } => {
                write!(f, "out of virtual address space ({requested} bytes)")
            }
            Self::InvalidAddress { addr } => write!(f, "invalid address {addr:#x}"),
            Self::UnmappedMemory { addr } => write!(f, "unmapped address {addr:#x}"),
            Self::ProcessNotFound { pid } => write!(f, "no such process {pid}"),
            Self::ThreadNotFound { tid } => write!(f, "no such thread {tid}"),
            Self::NoChildren => write!(f, "no waitable children"),
            Self::Interrupted => write!(f, "interrupted by signal"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::DeviceError { code } => write!(f, "device error {code}"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

/// Result alias used throughout the kernel
pub type KernelResult<T> = Result<T, KernelError>;

/// POSIX errno values, the subset the kernel hands to user space.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Eperm = 1,
    Esrch = 3,
    Eintr = 4,
    Eio = 5,
    Ebadf = 9,
    Echild = 10,
    Eagain = 11,
    Enomem = 12,
    Eacces = 13,
    Efault = 14,
    Eexist = 17,
    Enotdir = 20,
    Einval = 22,
    Emfile = 24,
    Epipe = 32,
    Enosys = 38,
}

impl Errno {
    /// Raw value as stored in the thread errno cell.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfVirtualSpace { .. } => Errno::Enomem,
            KernelError::InvalidAddress { .. } | KernelError::UnmappedMemory { .. } => {
                Errno::Efault
            }
            KernelError::ProcessNotFound { .. } | KernelError::ThreadNotFound { .. } => {
                Errno::Esrch
            }
            KernelError::NoChildren => Errno::Echild,
            KernelError::Interrupted => Errno::Eintr,
            KernelError::WouldBlock => Errno::Eagain,
            KernelError::DeviceError { .. } => Errno::Eio,
            KernelError::BrokenPipe => Errno::Epipe,
            KernelError::PermissionDenied => Errno::Eperm,
            KernelError::InvalidArgument => Errno::Einval,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_posix() {
        assert_eq!(Errno::from(KernelError::Interrupted).as_i32(), 4);
        assert_eq!(Errno::from(KernelError::NoChildren).as_i32(), 10);
        assert_eq!(
            Errno::from(KernelError::UnmappedMemory { addr: 0 }).as_i32(),
            14
        );
        assert_eq!(Errno::from(KernelError::InvalidArgument).as_i32(), 22);
    }
}
