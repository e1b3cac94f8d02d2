//! fork(2)
//!
//! The child gets a copy-on-write clone of the address space, a deep copy
//! of the fd table, the parent's signal actions and the calling thread's
//! signal mask, and exactly one thread: a register-level copy of the
//! caller that resumes in user mode with rax = 0. The child's status
//! trigger is attached to the parent's wait queue.

use alloc::sync::Arc;

use crate::{
    error::KernelResult,
    process::{table, Process},
    sched::{self, task::Thread},
};
use core::sync::atomic::Ordering;

/// Fork `parent`; `caller` must be the thread executing the syscall (its
/// saved user frame seeds the child's only thread).
pub fn fork_process(parent: &Arc<Process>, caller: &Arc<Thread>) -> KernelResult<Arc<Process>> {
    let space = parent.address_space().fork()?;

    let child = Process::new(parent.name.lock().clone(), space.clone());

    child.set_parent(parent);
    *child.fds.lock() = parent.fds.lock().duplicate();
    *child.cwd.lock() = parent.cwd.lock().clone();
    *child.env.lock() = parent.env.lock().clone();
    child.copy_sigactions_from(parent);
    child
        .sigenter_rip
        .store(parent.sigenter_rip.load(Ordering::Acquire), Ordering::Release);

    let (real, effective) = parent.uids();
    child.set_uids(real, effective);

    // Register first so pid/pgid/sid exist, then inherit group identity.
    table::insert(&child);
    child.set_pgid(parent.pgid());
    child.set_sid(parent.sid());

    // One thread: the caller, re-homed onto the child space. rax = 0 is
    // the child's fork return value.
    let thread = caller.fork_onto(space);
    thread.ctx.lock().regs.rax = 0;
    child.add_thread(&thread);
    child.set_main_thread(&thread);
    sched::insert_thread(&thread);

    // Status changes flow to the parent's waitpid.
    child.notify_status.add(parent.waitq.clone());
    parent.children.lock().push(Some(child.clone()));

    log::debug!(
        target: "process",
        "fork: {} -> {}",
        parent.pid(),
        child.pid()
    );

    Ok(child)
}
