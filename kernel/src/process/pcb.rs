//! The process structure
//!
//! Everything a process owns, in one place. Hot identity fields are
//! atomics; composite state sits behind per-field IRQ spinlocks so the
//! scheduler, signal delivery and syscalls can touch disjoint parts
//! without a giant lock. The lock order within a process is: `threads` <
//! signal state < thread signal contexts.

use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::{
    fs::fd::FdTable,
    ipc::{Trigger, WaitQueue},
    mm::AddressSpace,
    process::{env::ProcessEnv, wait::WaitStatus, STATUS_CHANGED},
    sched::{
        self,
        task::{Pid, Thread, ThreadState},
    },
    signal::{self, ProcSignalContext, SigAction, SIGNAL_MAX},
    sync::IrqSpinlock,
};

pub struct Process {
    pid: AtomicI64,
    ppid: AtomicI64,
    pgid: AtomicI64,
    sid: AtomicI64,

    pub name: IrqSpinlock<String>,

    space: IrqSpinlock<Arc<AddressSpace>>,

    pub threads: IrqSpinlock<Vec<Option<Arc<Thread>>>>,
    main_thread: IrqSpinlock<Option<Arc<Thread>>>,

    parent: IrqSpinlock<Weak<Process>>,
    pub children: IrqSpinlock<Vec<Option<Arc<Process>>>>,
    pub zombies: IrqSpinlock<Vec<Option<Arc<Process>>>>,

    pub fds: IrqSpinlock<FdTable>,
    pub cwd: IrqSpinlock<String>,

    real_uid: AtomicU64,
    effective_uid: AtomicU64,
    saved_gid: AtomicU64,

    pub did_exec: AtomicBool,

    /// Userspace signal-entry stub registered via `sigenter`.
    pub sigenter_rip: AtomicU64,
    sigactions: IrqSpinlock<[SigAction; SIGNAL_MAX as usize]>,
    pub sig_pending: ProcSignalContext,

    /// Parents block here; children's status triggers point at it.
    pub waitq: Arc<WaitQueue>,
    /// Arisen whenever this process's `status` changes.
    pub notify_status: Arc<Trigger>,
    /// POSIX wait status plus the STATUS_CHANGED latch.
    pub status: AtomicI64,

    pub env: IrqSpinlock<ProcessEnv>,
}

impl Process {
    /// Build a process shell around an address space. The caller attaches
    /// threads and registers the process in the table.
    pub fn new(name: String, space: Arc<AddressSpace>) -> Arc<Self> {
        Arc::new(Self {
            pid: AtomicI64::new(-1),
            ppid: AtomicI64::new(0),
            pgid: AtomicI64::new(0),
            sid: AtomicI64::new(0),
            name: IrqSpinlock::new(name),
            space: IrqSpinlock::new(space),
            threads: IrqSpinlock::new(Vec::new()),
            main_thread: IrqSpinlock::new(None),
            parent: IrqSpinlock::new(Weak::new()),
            children: IrqSpinlock::new(Vec::new()),
            zombies: IrqSpinlock::new(Vec::new()),
            fds: IrqSpinlock::new(FdTable::new()),
            cwd: IrqSpinlock::new(String::from("/")),
            real_uid: AtomicU64::new(0),
            effective_uid: AtomicU64::new(0),
            saved_gid: AtomicU64::new(0),
            did_exec: AtomicBool::new(false),
            sigenter_rip: AtomicU64::new(0),
            sigactions: IrqSpinlock::new([SigAction::default_action(); SIGNAL_MAX as usize]),
            sig_pending: ProcSignalContext::new(),
            waitq: Arc::new(WaitQueue::new()),
            notify_status: Trigger::new(),
            status: AtomicI64::new(WaitStatus::Continued.encode()),
            env: IrqSpinlock::new(ProcessEnv::new()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid.load(Ordering::Acquire)
    }

    pub(super) fn set_pid(&self, pid: Pid) {
        self.pid.store(pid, Ordering::Release);
        self.pgid.store(pid, Ordering::Release);
        self.sid.store(pid, Ordering::Release);
    }

    pub fn ppid(&self) -> Pid {
        self.ppid.load(Ordering::Acquire)
    }

    pub fn set_ppid(&self, ppid: Pid) {
        self.ppid.store(ppid, Ordering::Release);
    }

    pub fn pgid(&self) -> Pid {
        self.pgid.load(Ordering::Acquire)
    }

    pub fn set_pgid(&self, pgid: Pid) {
        self.pgid.store(pgid, Ordering::Release);
    }

    pub fn sid(&self) -> Pid {
        self.sid.load(Ordering::Acquire)
    }

    pub fn set_sid(&self, sid: Pid) {
        self.sid.store(sid, Ordering::Release);
    }

    /// (real, effective) uids.
    pub fn uids(&self) -> (u64, u64) {
        (
            self.real_uid.load(Ordering::Acquire),
            self.effective_uid.load(Ordering::Acquire),
        )
    }

    pub fn set_uids(&self, real: u64, effective: u64) {
        self.real_uid.store(real, Ordering::Release);
        self.effective_uid.store(effective, Ordering::Release);
    }

    pub fn saved_gid(&self) -> u64 {
        self.saved_gid.load(Ordering::Acquire)
    }

    pub fn address_space(&self) -> Arc<AddressSpace> {
        self.space.lock().clone()
    }

    /// Replace the address space (exec) on the process and all surviving
    /// threads.
    pub fn set_address_space(&self, space: Arc<AddressSpace>) {
        *self.space.lock() = space.clone();
        for thread in self.threads.lock().iter().flatten() {
            thread.set_address_space(space.clone());
        }
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub fn set_parent(&self, parent: &Arc<Process>) {
        *self.parent.lock() = Arc::downgrade(parent);
        self.set_ppid(parent.pid());
    }

    /// Adopt `thread` into this process.
    pub fn add_thread(self: &Arc<Self>, thread: &Arc<Thread>) {
        thread.attach_process(self);
        self.threads.lock().push(Some(thread.clone()));
    }

    pub fn set_main_thread(&self, thread: &Arc<Thread>) {
        *self.main_thread.lock() = Some(thread.clone());
    }

    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.main_thread.lock().clone()
    }

    /// Drop every thread reference (final reap).
    pub fn clear_threads(&self) {
        self.threads.lock().clear();
        *self.main_thread.lock() = None;
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().iter().flatten().count()
    }

    pub fn sigaction(&self, sig: i32) -> SigAction {
        self.sigactions.lock()[(sig - 1) as usize]
    }

    pub fn set_sigaction(&self, sig: i32, action: SigAction) {
        self.sigactions.lock()[(sig - 1) as usize] = action;
    }

    pub fn copy_sigactions_from(&self, other: &Process) {
        *self.sigactions.lock() = *other.sigactions.lock();
    }

    /// Reset every caught signal to its default action (exec). Ignored
    /// dispositions survive.
    pub fn reset_caught_sigactions(&self) {
        let mut actions = self.sigactions.lock();
        for action in actions.iter_mut() {
            if !action.is_ignore() {
                *action = SigAction::default_action();
            }
        }
    }

    /// Publish a new wait status and wake anyone waiting on it.
    pub fn set_status(&self, status: i64) {
        self.status
            .store(status | STATUS_CHANGED, Ordering::Release);
        self.notify_status.arise(self.main_thread());
    }

    /// Stop the whole process (default action of stop signals): every
    /// runnable thread goes Blocked carrying the stop marker, the parent
    /// learns via SIGCHLD + WSTOPPED. Threads already parked on a wire or
    /// queue keep their own block; the stop does not own it and SIGCONT
    /// must not wake it.
    ///
    /// The calling thread never waits on its own CPU slot (the slot only
    /// clears when it is swapped out, which cannot happen while it spins
    /// here); after the status is published, it parks itself on its
    /// return-to-user path.
    pub fn suspend(self: &Arc<Self>) {
        let current = sched::current_thread();

        let threads: Vec<Arc<Thread>> = self.threads.lock().iter().flatten().cloned().collect();
        for thread in threads {
            match thread.state() {
                ThreadState::Dead | ThreadState::Blocked => continue,
                _ => {}
            }

            thread.set_sig_stopped(true);
            thread.set_state(ThreadState::Blocked);

            if !current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &thread)) {
                sched::wait_off_cpu(&thread);
            }
        }

        self.set_status(WaitStatus::Stopped.encode());
        if let Some(parent) = self.parent() {
            let _ = signal::send_process(None, &parent, signal::SIGCHLD, None);
        }
    }

    /// Undo a stop (SIGCONT): ready exactly the threads the stop parked.
    pub fn cont(self: &Arc<Self>) {
        let threads: Vec<Arc<Thread>> = self.threads.lock().iter().flatten().cloned().collect();
        for thread in threads {
            if thread.take_sig_stopped() && thread.state() == ThreadState::Blocked {
                thread.set_state(ThreadState::Ready);
            }
        }

        self.set_status(WaitStatus::Continued.encode());
        if let Some(parent) = self.parent() {
            let _ = signal::send_process(None, &parent, signal::SIGCHLD, None);
        }
    }

    /// Index of `child` in the children list.
    pub fn find_child(&self, child: &Arc<Process>) -> Option<usize> {
        self.children
            .lock()
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, child)))
    }

    pub fn has_children(&self) -> bool {
        self.children.lock().iter().flatten().next().is_some()
            || self.zombies.lock().iter().flatten().next().is_some()
    }
}
