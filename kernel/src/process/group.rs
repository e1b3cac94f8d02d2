//! Process groups and sessions
//!
//! Identity only: a group is the set of processes sharing a pgid, a
//! session the set of groups sharing a sid. Leadership is immutable
//! because the leader's pid *is* the id. The session table additionally
//! carries the controlling-terminal slot, which the TTY layer (an
//! external collaborator) fills in.

use alloc::{collections::BTreeMap, sync::Arc};

use crate::{
    error::{KernelError, KernelResult},
    process::{table, Process},
    sched::task::Pid,
    sync::IrqSpinlock,
};

struct SessionInfo {
    leader: Pid,
    /// Controlling terminal handle, owned by the TTY collaborator.
    controlling_tty: Option<usize>,
}

static SESSIONS: IrqSpinlock<BTreeMap<Pid, SessionInfo>> = IrqSpinlock::new(BTreeMap::new());

/// setpgid(2): move `target` (self or a not-yet-exec'd child of `caller`)
/// into group `pgid`. `pgid == 0` means the target's own pid.
pub fn setpgid(caller: &Arc<Process>, target_pid: Pid, pgid: Pid) -> KernelResult<()> {
    let target = if target_pid == 0 || target_pid == caller.pid() {
        caller.clone()
    } else {
        let child = table::get(target_pid)
            .ok_or(KernelError::ProcessNotFound { pid: target_pid })?;
        if child.ppid() != caller.pid() {
            return Err(KernelError::PermissionDenied);
        }
        if child.did_exec.load(core::sync::atomic::Ordering::Acquire) {
            return Err(KernelError::PermissionDenied);
        }
        child
    };

    // A session leader cannot move out of its group.
    if target.pid() == target.sid() {
        return Err(KernelError::PermissionDenied);
    }

    let new_pgid = if pgid == 0 { target.pid() } else { pgid };

    // Joining an existing group requires it to live in the same session.
    if new_pgid != target.pid() {
        let peers = table::processes_in_group(new_pgid);
        let same_session = peers.iter().any(|p| p.sid() == target.sid());
        if !same_session {
            return Err(KernelError::PermissionDenied);
        }
    }

    target.set_pgid(new_pgid);
    Ok(())
}

pub fn getpgid(pid: Pid) -> KernelResult<Pid> {
    if pid == 0 {
        return crate::process::current()
            .map(|p| p.pgid())
            .ok_or(KernelError::InvalidArgument);
    }
    table::get(pid)
        .map(|p| p.pgid())
        .ok_or(KernelError::ProcessNotFound { pid })
}

/// setsid(2): detach into a fresh session (and group) led by the caller.
/// Fails for processes that already lead a group.
pub fn setsid(caller: &Arc<Process>) -> KernelResult<Pid> {
    let pid = caller.pid();

    if caller.pgid() == pid {
        return Err(KernelError::PermissionDenied);
    }

    caller.set_pgid(pid);
    caller.set_sid(pid);
    SESSIONS.lock().insert(
        pid,
        SessionInfo {
            leader: pid,
            controlling_tty: None,
        },
    );

    Ok(pid)
}

pub fn getsid(pid: Pid) -> KernelResult<Pid> {
    if pid == 0 {
        return crate::process::current()
            .map(|p| p.sid())
            .ok_or(KernelError::InvalidArgument);
    }
    table::get(pid)
        .map(|p| p.sid())
        .ok_or(KernelError::ProcessNotFound { pid })
}

/// TTY collaborator hook: attach a controlling terminal to a session.
pub fn set_controlling_tty(sid: Pid, tty: usize) -> KernelResult<()> {
    let mut sessions = SESSIONS.lock();
    match sessions.get_mut(&sid) {
        Some(session) => {
            session.controlling_tty = Some(tty);
            Ok(())
        }
        None if table::processes_in_session(sid).iter().any(|p| p.pid() == sid) => {
            sessions.insert(
                sid,
                SessionInfo {
                    leader: sid,
                    controlling_tty: Some(tty),
                },
            );
            Ok(())
        }
        None => Err(KernelError::ProcessNotFound { pid: sid }),
    }
}

pub fn controlling_tty(sid: Pid) -> Option<usize> {
    SESSIONS.lock().get(&sid).and_then(|s| s.controlling_tty)
}

/// Drop session bookkeeping when its leader is reaped.
pub fn forget_session(sid: Pid) {
    let mut sessions = SESSIONS.lock();
    if sessions.get(&sid).is_some_and(|s| s.leader == sid) {
        sessions.remove(&sid);
    }
}
