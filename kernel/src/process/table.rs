//! Global process table
//!
//! Pids are table indices, assigned once at registration and cleared on
//! reap. Group and session queries scan the table; membership is the
//! pgid/sid fields on each process, leadership is pid equality.

use alloc::{sync::Arc, vec::Vec};

use crate::{process::Process, sched::task::Pid, sync::IrqSpinlock};

static PROCESSES: IrqSpinlock<Vec<Option<Arc<Process>>>> = IrqSpinlock::new(Vec::new());

/// Register a process and assign its pid (and initial pgid/sid).
pub fn insert(proc: &Arc<Process>) -> Pid {
    let mut table = PROCESSES.lock();
    let pid = table.len() as Pid;
    proc.set_pid(pid);
    table.push(Some(proc.clone()));
    pid
}

/// Clear a reaped process's slot.
pub fn remove(pid: Pid) {
    let mut table = PROCESSES.lock();
    if let Some(slot) = table.get_mut(pid as usize) {
        *slot = None;
    }
}

pub fn get(pid: Pid) -> Option<Arc<Process>> {
    if pid < 0 {
        return None;
    }
    PROCESSES.lock().get(pid as usize)?.clone()
}

/// Every live process in group `pgid`.
pub fn processes_in_group(pgid: Pid) -> Vec<Arc<Process>> {
    PROCESSES
        .lock()
        .iter()
        .flatten()
        .filter(|p| p.pgid() == pgid)
        .cloned()
        .collect()
}

/// Every live process in session `sid`.
pub fn processes_in_session(sid: Pid) -> Vec<Arc<Process>> {
    PROCESSES
        .lock()
        .iter()
        .flatten()
        .filter(|p| p.sid() == sid)
        .cloned()
        .collect()
}

pub fn live_count() -> usize {
    PROCESSES.lock().iter().flatten().count()
}
