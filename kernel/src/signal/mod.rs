//! POSIX signals: numbers, actions, and per-thread/per-process state
//!
//! Signal flow is a three-stage pipeline: generation puts a bit in the
//! process-pending set, issue moves it to a chosen thread's pending set,
//! and dispatch delivers it on that thread's next return to user mode.
//! The mechanics of issue/dispatch live in [`delivery`]; this module holds
//! the vocabulary and the state containers.

use alloc::sync::Arc;

use crate::{
    ipc::Wire,
    sched::task::{FxArea, RegFrame},
    sync::IrqSpinlock,
};

pub mod delivery;

pub use delivery::{
    do_kill, force_thread_signal, process_signals, send_group, send_process, sigreturn,
    wait_signal,
};

// ---------------------------------------------------------------------------
// Signal numbers
// ---------------------------------------------------------------------------

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGSTKFLT: i32 = 16;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGXCPU: i32 = 24;
pub const SIGXFSZ: i32 = 25;
pub const SIGVTALRM: i32 = 26;
pub const SIGPROF: i32 = 27;
pub const SIGWINCH: i32 = 28;
pub const SIGIO: i32 = 29;
pub const SIGPWR: i32 = 30;
pub const SIGSYS: i32 = 31;

/// One past the largest signal number.
pub const SIGNAL_MAX: i32 = 32;

/// Bit for `sig` in a [`SigSet`].
pub const fn sigmask(sig: i32) -> u64 {
    1u64 << (sig - 1)
}

pub type SigSet = u64;

/// Signals that can never be caught, blocked, or ignored.
pub const UNMASKABLE: SigSet = sigmask(SIGKILL) | sigmask(SIGSTOP);

pub fn is_valid(sig: i32) -> bool {
    sig >= 1 && sig < SIGNAL_MAX
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// `sa_handler` sentinel: default action.
pub const SIG_DFL: usize = 0;
/// `sa_handler` sentinel: ignore.
pub const SIG_IGN: usize = 1;
/// `sa_handler` sentinel: error return.
pub const SIG_ERR: usize = usize::MAX;

pub const SA_NOCLDSTOP: u32 = 1;
pub const SA_NOCLDWAIT: u32 = 2;
pub const SA_SIGINFO: u32 = 4;
pub const SA_RESTORER: u32 = 0x0400_0000;
pub const SA_ONSTACK: u32 = 0x0800_0000;
pub const SA_RESTART: u32 = 0x1000_0000;
pub const SA_NODEFER: u32 = 0x4000_0000;
pub const SA_RESETHAND: u32 = 0x8000_0000;

/// How `sigprocmask` combines the new set.
pub const SIG_BLOCK: usize = 0;
pub const SIG_UNBLOCK: usize = 1;
pub const SIG_SETMASK: usize = 2;

/// Mirrors the userspace `struct sigaction` layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: usize,
    pub mask: SigSet,
    pub flags: u32,
    pub restorer: usize,
}

impl SigAction {
    pub const fn default_action() -> Self {
        Self {
            handler: SIG_DFL,
            mask: 0,
            flags: 0,
            restorer: 0,
        }
    }

    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    pub fn is_ignore(&self) -> bool {
        self.handler == SIG_IGN
    }
}

impl Default for SigAction {
    fn default() -> Self {
        Self::default_action()
    }
}

/// Information accompanying a queued signal, in the POSIX `siginfo_t`
/// shape user space expects.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_code: i32,
    pub si_errno: i32,
    pub si_pid: i64,
    pub si_uid: u64,
    pub si_addr: u64,
    pub si_status: i32,
    pub si_value: u64,
}

impl SigInfo {
    pub fn user(sig: i32, sender_pid: i64, sender_uid: u64) -> Self {
        Self {
            si_signo: sig,
            si_pid: sender_pid,
            si_uid: sender_uid,
            ..Self::default()
        }
    }
}

/// The context snapshot exposed to user handlers and consumed by
/// `sigreturn`. Handler modifications to `regs` survive the return trip.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UContext {
    pub flags: u64,
    /// Previous context (user pointer), for nested deliveries.
    pub prev: u64,
    /// Base of the signal user stack this context runs on.
    pub stack: u64,
    pub regs: RegFrame,
    pub fx_area: FxArea,
    /// Thread mask at delivery, restored by sigreturn.
    pub sigmask: SigSet,
}

impl UContext {
    pub const fn zeroed() -> Self {
        Self {
            flags: 0,
            prev: 0,
            stack: 0,
            regs: RegFrame::zeroed(),
            fx_area: FxArea::zeroed(),
            sigmask: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thread signal context
// ---------------------------------------------------------------------------

/// At most one queued instance per (thread, signum).
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalSlot {
    pub signum: i32,
    pub info: Option<SigInfo>,
}

struct SigInner {
    mask: SigSet,
    pending: SigSet,
    delivered: SigSet,
    slots: [SignalSlot; SIGNAL_MAX as usize],
}

/// Per-thread mask/pending/delivered sets plus the wire `sigsuspend` and
/// `pause` sleep on.
pub struct SignalContext {
    inner: IrqSpinlock<SigInner>,
    pub wire: Arc<Wire>,
}

impl SignalContext {
    pub fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(SigInner {
                mask: 0,
                pending: 0,
                delivered: 0,
                slots: [SignalSlot::default(); SIGNAL_MAX as usize],
            }),
            wire: Arc::new(Wire::new()),
        }
    }

    pub fn mask(&self) -> SigSet {
        self.inner.lock().mask
    }

    /// Replace the mask; SIGKILL/SIGSTOP are silently stripped.
    pub fn set_mask(&self, mask: SigSet) {
        self.inner.lock().mask = mask & !UNMASKABLE;
    }

    /// `sigprocmask` with `how`; returns the previous mask.
    pub fn change_mask(&self, how: usize, set: SigSet) -> Option<SigSet> {
        let mut inner = self.inner.lock();
        let old = inner.mask;

        match how {
            SIG_BLOCK => inner.mask |= set,
            SIG_UNBLOCK => inner.mask &= !set,
            SIG_SETMASK => inner.mask = set,
            _ => return None,
        }

        inner.mask &= !UNMASKABLE;
        Some(old)
    }

    pub fn pending(&self) -> SigSet {
        self.inner.lock().pending
    }

    /// Queue `sig` on this thread. Keeps the earlier siginfo if the signal
    /// is already pending.
    pub fn push(&self, sig: i32, info: Option<SigInfo>) {
        let mut inner = self.inner.lock();
        let bit = sigmask(sig);
        if inner.pending & bit == 0 {
            inner.pending |= bit;
            inner.slots[(sig - 1) as usize] = SignalSlot { signum: sig, info };
        }
    }

    /// Take `sig` off the pending set, returning its queued slot.
    pub fn take(&self, sig: i32) -> Option<SignalSlot> {
        let mut inner = self.inner.lock();
        let bit = sigmask(sig);
        if inner.pending & bit == 0 {
            return None;
        }
        inner.pending &= !bit;
        Some(inner.slots[(sig - 1) as usize])
    }

    pub fn clear_pending(&self, sig: i32) {
        self.inner.lock().pending &= !sigmask(sig);
    }

    /// A signal the thread's mask currently allows is pending.
    pub fn has_deliverable(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending & !inner.mask != 0
    }

    pub fn mark_delivered(&self, sig: i32) {
        self.inner.lock().delivered |= sigmask(sig);
    }

    /// Clear and report membership of `sig` in the delivered set.
    pub fn take_delivered(&self, set: SigSet) -> Option<i32> {
        let mut inner = self.inner.lock();
        for sig in 1..SIGNAL_MAX {
            let bit = sigmask(sig);
            if set & bit != 0 && inner.delivered & bit != 0 {
                inner.delivered &= !bit;
                return Some(sig);
            }
        }
        None
    }

    /// Forget delivered history for `set` (entry to `wait_signal`).
    pub fn reset_delivered(&self, set: SigSet) {
        self.inner.lock().delivered &= !set;
    }

    pub fn copy_mask_from(&self, other: &SignalContext) {
        self.set_mask(other.mask());
    }
}

impl Default for SignalContext {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-process signal state
// ---------------------------------------------------------------------------

/// Process-level pending set; bits (and their siginfo) move to a thread at
/// issue time.
pub struct ProcSignalContext {
    inner: IrqSpinlock<ProcSigInner>,
}

struct ProcSigInner {
    pending: SigSet,
    infos: [Option<SigInfo>; SIGNAL_MAX as usize],
}

impl ProcSignalContext {
    pub fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(ProcSigInner {
                pending: 0,
                infos: [None; SIGNAL_MAX as usize],
            }),
        }
    }

    pub fn pending(&self) -> SigSet {
        self.inner.lock().pending
    }

    pub fn push(&self, sig: i32, info: Option<SigInfo>) {
        let mut inner = self.inner.lock();
        let bit = sigmask(sig);
        if inner.pending & bit == 0 {
            inner.pending |= bit;
            inner.infos[(sig - 1) as usize] = info;
        }
    }

    pub fn clear(&self, sig: i32) {
        self.inner.lock().pending &= !sigmask(sig);
    }

    /// Atomically move `sig` out of the process set (issue step).
    pub fn take(&self, sig: i32) -> Option<Option<SigInfo>> {
        let mut inner = self.inner.lock();
        let bit = sigmask(sig);
        if inner.pending & bit == 0 {
            return None;
        }
        inner.pending &= !bit;
        Some(inner.infos[(sig - 1) as usize].take())
    }
}

impl Default for ProcSignalContext {
    fn default() -> Self {
        Self::new()
    }
}

/// What an uncaught signal does to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    /// Terminate with the core flag in the wait status.
    Core,
    Ignore,
    Stop,
    Continue,
}

pub fn default_action(sig: i32) -> DefaultAction {
    match sig {
        SIGCHLD | SIGURG | SIGWINCH | SIGIO | SIGPWR => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGXCPU | SIGXFSZ
        | SIGSYS => DefaultAction::Core,
        _ => DefaultAction::Terminate,
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn kill_and_stop_cannot_be_masked() {
        let ctx = SignalContext::new();
        ctx.set_mask(u64::MAX);
        assert_eq!(ctx.mask() & UNMASKABLE, 0);
        assert_ne!(ctx.mask() & sigmask(SIGUSR1), 0);
    }

    #[test]
    fn change_mask_round_trips() {
        let ctx = SignalContext::new();
        let set = sigmask(SIGUSR1) | sigmask(SIGTERM);

        let old = ctx.change_mask(SIG_SETMASK, set).expect("SETMASK is valid");
        assert_eq!(old, 0);
        assert_eq!(ctx.mask(), set);

        // SETMASK back to the saved value restores the original mask.
        let old = ctx.change_mask(SIG_SETMASK, old).expect("SETMASK is valid");
        assert_eq!(old, set);
        assert_eq!(ctx.mask(), 0);
    }

    #[test]
    fn block_and_unblock_compose() {
        let ctx = SignalContext::new();
        ctx.change_mask(SIG_BLOCK, sigmask(SIGUSR1)).unwrap();
        ctx.change_mask(SIG_BLOCK, sigmask(SIGUSR2)).unwrap();
        assert_eq!(ctx.mask(), sigmask(SIGUSR1) | sigmask(SIGUSR2));

        ctx.change_mask(SIG_UNBLOCK, sigmask(SIGUSR1)).unwrap();
        assert_eq!(ctx.mask(), sigmask(SIGUSR2));
    }

    #[test]
    fn push_is_level_triggered_per_signum() {
        let ctx = SignalContext::new();
        ctx.push(SIGUSR1, Some(SigInfo::user(SIGUSR1, 7, 0)));
        ctx.push(SIGUSR1, Some(SigInfo::user(SIGUSR1, 8, 0)));

        let slot = ctx.take(SIGUSR1).expect("signal was pending");
        assert_eq!(slot.info.expect("siginfo queued").si_pid, 7);
        assert!(ctx.take(SIGUSR1).is_none());
    }

    #[test]
    fn deliverable_respects_mask() {
        let ctx = SignalContext::new();
        ctx.set_mask(sigmask(SIGUSR1));
        ctx.push(SIGUSR1, None);
        assert!(!ctx.has_deliverable());

        ctx.push(SIGTERM, None);
        assert!(ctx.has_deliverable());
    }

    #[test]
    fn default_actions_match_posix() {
        assert_eq!(default_action(SIGCHLD), DefaultAction::Ignore);
        assert_eq!(default_action(SIGSTOP), DefaultAction::Stop);
        assert_eq!(default_action(SIGCONT), DefaultAction::Continue);
        assert_eq!(default_action(SIGSEGV), DefaultAction::Core);
        assert_eq!(default_action(SIGTERM), DefaultAction::Terminate);
    }

    #[test]
    fn process_pending_take_is_exclusive() {
        let ctx = ProcSignalContext::new();
        ctx.push(SIGINT, Some(SigInfo::user(SIGINT, 3, 0)));
        let info = ctx.take(SIGINT).expect("pending bit set");
        assert_eq!(info.expect("info carried").si_pid, 3);
        assert!(ctx.take(SIGINT).is_none());
    }
}
