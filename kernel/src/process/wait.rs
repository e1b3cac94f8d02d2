//! Wait statuses and waitpid
//!
//! The status word follows the POSIX bit layout: low seven bits carry a
//! termination signal, bit 7 the core flag, bits 8..16 the exit code;
//! `0x7f` in the low byte means stopped and `0xffff` means continued. Bit
//! 31 is the kernel-internal STATUS_CHANGED latch, set on every status
//! transition and consumed by exactly one waitpid.

use alloc::sync::Arc;

use crate::{
    error::{KernelError, KernelResult},
    process::{exit, Process},
    sched::task::{Pid, Thread},
};
use core::sync::atomic::Ordering;

pub const WNOHANG: usize = 1;
pub const WUNTRACED: usize = 2;
pub const WSTOPPED: usize = 2;
pub const WEXITED: usize = 4;
pub const WCONTINUED: usize = 8;
pub const WNOWAIT: usize = 0x0100_0000;

const WCOREFLAG: i64 = 0x80;

/// Internal latch: a status transition waitpid has not consumed yet.
pub const STATUS_CHANGED: i64 = 1 << 31;

/// How a child's state changed, and the codec to/from the POSIX word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(i32),
    Signaled { sig: i32, core: bool },
    Stopped,
    Continued,
}

impl WaitStatus {
    pub fn encode(self) -> i64 {
        match self {
            Self::Exited(code) => (code as i64 & 0xFF) << 8,
            Self::Signaled { sig, core } => {
                (sig as i64 & 0x7F) | if core { WCOREFLAG } else { 0 }
            }
            Self::Stopped => 0x7F,
            Self::Continued => 0xFFFF,
        }
    }
}

pub fn wexitstatus(status: i64) -> i64 {
    (status & 0xFF00) >> 8
}

pub fn wtermsig(status: i64) -> i64 {
    status & 0x7F
}

pub fn wifexited(status: i64) -> bool {
    wtermsig(status) == 0
}

pub fn wifsignaled(status: i64) -> bool {
    let low = (status & 0x7F) as u8;
    low != 0 && low != 0x7F
}

pub fn wifstopped(status: i64) -> bool {
    status & 0xFF == 0x7F
}

pub fn wifcontinued(status: i64) -> bool {
    status & 0xFFFF == 0xFFFF
}

pub fn wcoredump(status: i64) -> bool {
    status & WCOREFLAG != 0
}

/// Does `child` match the waitpid pid selector?
fn selector_matches(parent: &Arc<Process>, child: &Arc<Process>, pid: Pid) -> bool {
    if pid > 0 {
        child.pid() == pid
    } else if pid == 0 {
        child.pgid() == parent.pgid()
    } else if pid == -1 {
        true
    } else {
        child.pgid() == -pid
    }
}

/// POSIX waitpid. Zombies are reaped synchronously first; otherwise the
/// caller blocks on its wait queue until a child's status changes. Stopped
/// and continued reports are gated on WUNTRACED/WCONTINUED.
pub fn waitpid(
    parent: &Arc<Process>,
    waiter: &Arc<Thread>,
    pid: Pid,
    options: usize,
) -> KernelResult<(i64, Pid)> {
    loop {
        // Zombies first: anything already dead is consumed without
        // blocking.
        let ripe = {
            let mut zombies = parent.zombies.lock();
            let mut found = None;
            for slot in zombies.iter_mut() {
                if slot
                    .as_ref()
                    .is_some_and(|z| selector_matches(parent, z, pid))
                {
                    found = slot.take();
                    break;
                }
            }
            found
        };

        if let Some(zombie) = ripe {
            let status = zombie.status.load(Ordering::Acquire) & !STATUS_CHANGED;
            let zpid = zombie.pid();
            exit::reap_process(&zombie);
            return Ok((status, zpid));
        }

        // ECHILD when no qualifying child can ever report.
        let has_candidate = parent
            .children
            .lock()
            .iter()
            .flatten()
            .any(|c| selector_matches(parent, c, pid));
        if !has_candidate {
            return Err(KernelError::NoChildren);
        }

        if options & WNOHANG != 0 {
            return Ok((0, 0));
        }

        // Block until some child's status trigger arises our queue.
        let waker = parent.waitq.block(waiter)?;
        let Some(waker) = waker else {
            continue;
        };
        let Some(child) = waker.process() else {
            continue;
        };

        if !selector_matches(parent, &child, pid) {
            continue;
        }

        let status = child.status.load(Ordering::Acquire);
        if status & STATUS_CHANGED == 0 {
            // Already consumed by a sibling waiter.
            continue;
        }

        let bare = status & !STATUS_CHANGED;

        if wifstopped(bare) && options & WUNTRACED == 0 {
            continue;
        }
        if wifcontinued(bare) && options & WCONTINUED == 0 {
            continue;
        }

        // Consume the latch.
        child.status.store(bare, Ordering::Release);

        let cpid = child.pid();
        if wifexited(bare) || wifsignaled(bare) {
            // Terminal status: detach the zombie and reap it.
            let mut zombies = parent.zombies.lock();
            for slot in zombies.iter_mut() {
                if slot.as_ref().is_some_and(|z| Arc::ptr_eq(z, &child)) {
                    *slot = None;
                }
            }
            drop(zombies);
            exit::reap_process(&child);
        }

        return Ok((bare, cpid));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn exit_status_round_trips() {
        let status = WaitStatus::Exited(7).encode();
        assert!(wifexited(status));
        assert!(!wifsignaled(status));
        assert!(!wifstopped(status));
        assert_eq!(wexitstatus(status), 7);
    }

    #[test]
    fn signal_status_round_trips() {
        let status = WaitStatus::Signaled {
            sig: crate::signal::SIGKILL,
            core: false,
        }
        .encode();
        assert!(wifsignaled(status));
        assert!(!wifexited(status));
        assert_eq!(wtermsig(status), crate::signal::SIGKILL as i64);
        assert!(!wcoredump(status));

        let with_core = WaitStatus::Signaled {
            sig: crate::signal::SIGSEGV,
            core: true,
        }
        .encode();
        assert!(wifsignaled(with_core));
        assert!(wcoredump(with_core));
        assert_eq!(wtermsig(with_core), crate::signal::SIGSEGV as i64);
    }

    #[test]
    fn stop_and_continue_markers() {
        let stopped = WaitStatus::Stopped.encode();
        assert!(wifstopped(stopped));
        assert!(!wifsignaled(stopped));
        assert!(!wifexited(stopped));

        let continued = WaitStatus::Continued.encode();
        assert!(wifcontinued(continued));
        assert!(!wifstopped(continued));
    }

    #[test]
    fn status_changed_is_outside_posix_bits() {
        for status in [
            WaitStatus::Exited(255).encode(),
            WaitStatus::Signaled {
                sig: 31,
                core: true,
            }
            .encode(),
            WaitStatus::Stopped.encode(),
            WaitStatus::Continued.encode(),
        ] {
            assert_eq!(status & STATUS_CHANGED, 0);
        }
    }
}
