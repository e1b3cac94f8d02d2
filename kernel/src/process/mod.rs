//! Processes: the POSIX process model on top of the scheduler
//!
//! A [`Process`] owns its threads, its address space, its file table and
//! its signal dispositions. Parent/child linkage runs through the process
//! table; exit/wait notification goes over each process's wait queue and
//! status trigger. Groups and sessions are thin identity layers over the
//! table.

use alloc::sync::Arc;

pub mod env;
pub mod exec;
pub mod exit;
pub mod fork;
pub mod group;
pub mod pcb;
pub mod table;
pub mod wait;

pub use env::ProcessEnv;
pub use pcb::Process;
pub use wait::{WaitStatus, STATUS_CHANGED};

/// The process owning the thread running on this CPU.
pub fn current() -> Option<Arc<Process>> {
    crate::sched::current_process()
}

/// Create a registered single-threaded user process entering at `entry`
/// with `stack` as its initial rsp. The boot path uses this for init once
/// the loader collaborator has populated `space`.
pub fn create_process(
    name: alloc::string::String,
    space: Arc<crate::mm::AddressSpace>,
    entry: u64,
    stack: u64,
) -> Arc<Process> {
    let proc = Process::new(name, space.clone());
    table::insert(&proc);

    let thread = crate::sched::task::Thread::new_user(entry, stack, space);
    proc.add_thread(&thread);
    proc.set_main_thread(&thread);
    crate::sched::insert_thread(&thread);

    proc
}
