//! Thread model
//!
//! A [`Thread`] is the unit of scheduling: a saved register image, an
//! FXSAVE area, four stacks (normal and signal, kernel and user), a signal
//! context and a handful of state flags. Threads are shared as `Arc`s
//! between the global thread table, their owning process, and whatever
//! wires they are blocked on; hot state lives in atomics, the register
//! context under an IRQ spinlock.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};

use crate::{
    mm::{self, AddressSpace},
    process::Process,
    signal::{SignalContext, UContext},
    sync::IrqSpinlock,
};

pub type Tid = i64;
pub type Pid = i64;

/// Thread run states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable, waiting to be picked.
    Ready = 0,
    /// On a CPU right now.
    Running = 1,
    /// Voluntarily sleeping (usleep).
    Sleep = 2,
    /// Parked on a wire or queue.
    Blocked = 3,
    /// Gone; table slot awaiting reap.
    Dead = 4,
    /// Runnable, but sitting in an interruptible wait loop.
    Wait = 5,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Sleep,
            3 => Self::Blocked,
            4 => Self::Dead,
            _ => Self::Wait,
        }
    }
}

/// Privilege the thread runs at between kernel entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Kernel,
    User,
}

/// Saved general-purpose register image plus the control state the context
/// switch carries across (segment selectors, CR3, SSE control words).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub ss: u64,
    pub cs: u64,
    /// User FS base (TLS pointer).
    pub fs: u64,
    /// User GS base.
    pub gs: u64,
    pub rflags: u64,
    pub cr3: u64,
    pub mxcsr: u32,
    pub fcw: u16,
}

/// Power-on rflags (IF set) and SSE control defaults.
const DEFAULT_RFLAGS: u64 = 0x202;
const DEFAULT_MXCSR: u32 = 0x1F80;
const DEFAULT_FCW: u16 = 0x33F;

impl RegFrame {
    pub const fn zeroed() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            ss: 0,
            cs: 0,
            fs: 0,
            gs: 0,
            rflags: DEFAULT_RFLAGS,
            cr3: 0,
            mxcsr: DEFAULT_MXCSR,
            fcw: DEFAULT_FCW,
        }
    }

    /// Defaults for a ring-0 thread.
    pub fn kernel_defaults() -> Self {
        Self {
            cs: crate::arch::KERNEL_CS as u64,
            ss: crate::arch::KERNEL_SS as u64,
            ..Self::zeroed()
        }
    }

    /// Defaults for a ring-3 thread.
    pub fn user_defaults() -> Self {
        Self {
            cs: crate::arch::USER_CS as u64,
            ss: crate::arch::USER_SS as u64,
            ..Self::zeroed()
        }
    }
}

/// 512-byte FXSAVE/FXRSTOR area, 16-byte aligned as the instructions
/// demand.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FxArea(pub [u8; 512]);

impl FxArea {
    pub const fn zeroed() -> Self {
        Self([0; 512])
    }
}

/// Mutable scheduling context: everything the context switch saves and
/// restores. One lock per thread; contended only while the thread is
/// off-CPU.
pub struct ThreadContext {
    pub regs: RegFrame,
    pub fx_area: FxArea,
    /// Snapshot taken when a user signal handler is dispatched.
    pub ucontext: UContext,
    pub kstack: u64,
    pub ustack: u64,
    /// Alternate stacks swapped in for the duration of a signal handler.
    pub sig_kstack: u64,
    pub sig_ustack: u64,
}

/// See module docs.
pub struct Thread {
    tid: AtomicI64,
    pid: AtomicI64,
    state: AtomicU8,
    /// CPU currently running this thread, -1 when off-CPU.
    pub cpu: AtomicI64,
    pub privilege: Privilege,

    /// Thread is inside a syscall; signal dispatch must wait.
    pub in_syscall: AtomicBool,
    /// A user signal handler is live; no further dispatch until sigreturn.
    pub dispatch_ready: AtomicBool,
    /// An issued signal could not be dispatched yet.
    pub pending_signal: AtomicBool,

    /// Blocked in a signal-interruptible wait.
    interruptible: AtomicBool,
    /// The wait was torn down by a signal.
    interrupted: AtomicBool,
    /// Blocked by a stop signal; SIGCONT readies exactly these threads.
    sig_stopped: AtomicBool,
    /// A syscall handler replaced the saved user context wholesale (exec,
    /// sigreturn); the dispatcher must not re-sync it from the live frame.
    ctx_rewritten: AtomicBool,

    errno: AtomicI32,

    /// TSC accounting.
    pub started: AtomicU64,
    pub stopped: AtomicU64,
    pub uptime: AtomicU64,

    pub ctx: IrqSpinlock<ThreadContext>,
    pub sig: SignalContext,

    /// Owning process; weak, the process outlives its threads and clears
    /// table slots on kill.
    proc: IrqSpinlock<Weak<Process>>,
    /// Address space the thread runs on (the process's, or the boot space
    /// for kernel threads). `None` only for threads that never ran.
    space: IrqSpinlock<Option<Arc<AddressSpace>>>,
}

impl Thread {
    /// Build a kernel thread that starts at `entry` on a fresh kernel
    /// stack.
    pub fn new_kernel(entry: fn()) -> Arc<Self> {
        let kstack = mm::pmm::stack(mm::KSTACK_PAGES);
        let mut regs = RegFrame::kernel_defaults();
        regs.rip = entry as usize as u64;
        regs.rsp = kstack;

        Self::from_parts(regs, Privilege::Kernel, mm::address_space::boot_space(), kstack)
    }

    /// Build a user thread entering at `rip` with `rsp`, on `space`.
    pub fn new_user(rip: u64, rsp: u64, space: Arc<AddressSpace>) -> Arc<Self> {
        let kstack = mm::pmm::stack(mm::KSTACK_PAGES);
        let mut regs = RegFrame::user_defaults();
        regs.rip = rip;
        regs.rsp = rsp;

        let thread = Self::from_parts(regs, Privilege::User, space, kstack);
        thread.ctx.lock().ustack = rsp;
        thread
    }

    fn from_parts(
        mut regs: RegFrame,
        privilege: Privilege,
        space: Arc<AddressSpace>,
        kstack: u64,
    ) -> Arc<Self> {
        regs.cr3 = space.root_phys();
        let sig_kstack = mm::pmm::stack(mm::KSTACK_PAGES);

        Arc::new(Self {
            tid: AtomicI64::new(-1),
            pid: AtomicI64::new(-1),
            state: AtomicU8::new(ThreadState::Ready as u8),
            cpu: AtomicI64::new(-1),
            privilege,
            in_syscall: AtomicBool::new(false),
            dispatch_ready: AtomicBool::new(false),
            pending_signal: AtomicBool::new(false),
            interruptible: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            sig_stopped: AtomicBool::new(false),
            ctx_rewritten: AtomicBool::new(false),
            errno: AtomicI32::new(0),
            started: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
            uptime: AtomicU64::new(0),
            ctx: IrqSpinlock::new(ThreadContext {
                regs,
                fx_area: FxArea::zeroed(),
                ucontext: UContext::zeroed(),
                kstack,
                ustack: 0,
                sig_kstack,
                sig_ustack: 0,
            }),
            sig: SignalContext::new(),
            proc: IrqSpinlock::new(Weak::new()),
            space: IrqSpinlock::new(Some(space)),
        })
    }

    /// Bare thread for scheduler unit tests: no stacks, no address space.
    #[cfg(all(test, not(target_os = "none")))]
    pub fn test_thread() -> Arc<Self> {
        Arc::new(Self {
            tid: AtomicI64::new(-1),
            pid: AtomicI64::new(-1),
            state: AtomicU8::new(ThreadState::Ready as u8),
            cpu: AtomicI64::new(-1),
            privilege: Privilege::Kernel,
            in_syscall: AtomicBool::new(false),
            dispatch_ready: AtomicBool::new(false),
            pending_signal: AtomicBool::new(false),
            interruptible: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            sig_stopped: AtomicBool::new(false),
            ctx_rewritten: AtomicBool::new(false),
            errno: AtomicI32::new(0),
            started: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
            uptime: AtomicU64::new(0),
            ctx: IrqSpinlock::new(ThreadContext {
                regs: RegFrame::zeroed(),
                fx_area: FxArea::zeroed(),
                ucontext: UContext::zeroed(),
                kstack: 0,
                ustack: 0,
                sig_kstack: 0,
                sig_ustack: 0,
            }),
            sig: SignalContext::new(),
            proc: IrqSpinlock::new(Weak::new()),
            space: IrqSpinlock::new(None),
        })
    }

    /// Clone for fork: same registers and FPU state as `self`, fresh
    /// kernel stacks, `space` as the address space.
    pub fn fork_onto(&self, space: Arc<AddressSpace>) -> Arc<Self> {
        let (regs, fx_area, ustack, sig_ustack) = {
            let src = self.ctx.lock();
            let mut regs = src.regs;
            regs.cr3 = space.root_phys();
            (regs, src.fx_area.clone(), src.ustack, src.sig_ustack)
        };

        let child = Arc::new(Self {
            tid: AtomicI64::new(-1),
            pid: AtomicI64::new(-1),
            state: AtomicU8::new(ThreadState::Ready as u8),
            cpu: AtomicI64::new(-1),
            privilege: self.privilege,
            in_syscall: AtomicBool::new(false),
            dispatch_ready: AtomicBool::new(false),
            pending_signal: AtomicBool::new(false),
            interruptible: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            sig_stopped: AtomicBool::new(false),
            ctx_rewritten: AtomicBool::new(false),
            errno: AtomicI32::new(0),
            started: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
            uptime: AtomicU64::new(0),
            ctx: IrqSpinlock::new(ThreadContext {
                regs,
                fx_area,
                ucontext: UContext::zeroed(),
                kstack: mm::pmm::stack(mm::KSTACK_PAGES),
                ustack,
                sig_kstack: mm::pmm::stack(mm::KSTACK_PAGES),
                sig_ustack,
            }),
            sig: SignalContext::new(),
            proc: IrqSpinlock::new(Weak::new()),
            space: IrqSpinlock::new(Some(space)),
        });

        child.sig.copy_mask_from(&self.sig);
        child
    }

    pub fn tid(&self) -> Tid {
        self.tid.load(Ordering::Acquire)
    }

    pub fn set_tid(&self, tid: Tid) {
        self.tid.store(tid, Ordering::Release);
    }

    pub fn pid(&self) -> Pid {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: Pid) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_user(&self) -> bool {
        self.privilege == Privilege::User
    }

    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::Acquire)
    }

    pub fn set_errno(&self, errno: i32) {
        self.errno.store(errno, Ordering::Release);
    }

    pub fn set_interruptible(&self, value: bool) {
        self.interruptible.store(value, Ordering::Release);
    }

    pub fn is_interruptible(&self) -> bool {
        self.interruptible.load(Ordering::Acquire)
    }

    /// Called by signal delivery: abort an interruptible wait.
    pub fn interrupt(&self) {
        if self.is_interruptible() {
            self.interrupted.store(true, Ordering::Release);
            self.set_state(ThreadState::Ready);
        }
    }

    /// Consume the interruption flag.
    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Mark this thread as parked by a stop signal.
    pub fn set_sig_stopped(&self, value: bool) {
        self.sig_stopped.store(value, Ordering::Release);
    }

    /// Consume the stop marker (SIGCONT wakes only marked threads).
    pub fn take_sig_stopped(&self) -> bool {
        self.sig_stopped.swap(false, Ordering::AcqRel)
    }

    /// The saved user context was replaced wholesale this syscall.
    pub fn mark_ctx_rewritten(&self) {
        self.ctx_rewritten.store(true, Ordering::Release);
    }

    /// Consume the rewrite marker.
    pub fn take_ctx_rewritten(&self) -> bool {
        self.ctx_rewritten.swap(false, Ordering::AcqRel)
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.proc.lock().upgrade()
    }

    pub fn attach_process(&self, proc: &Arc<Process>) {
        *self.proc.lock() = Arc::downgrade(proc);
        self.set_pid(proc.pid());
    }

    pub fn detach_process(&self) {
        *self.proc.lock() = Weak::new();
    }

    pub fn address_space(&self) -> Arc<AddressSpace> {
        self.space
            .lock()
            .clone()
            .unwrap_or_else(mm::address_space::boot_space)
    }

    /// Swap in a new address space (exec) and refresh the saved CR3.
    pub fn set_address_space(&self, space: Arc<AddressSpace>) {
        let root = space.root_phys();
        *self.space.lock() = Some(space);
        self.ctx.lock().regs.cr3 = root;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ThreadState::Ready,
            ThreadState::Running,
            ThreadState::Sleep,
            ThreadState::Blocked,
            ThreadState::Dead,
            ThreadState::Wait,
        ] {
            assert_eq!(ThreadState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn default_frames_carry_sse_defaults() {
        let regs = RegFrame::zeroed();
        assert_eq!(regs.rflags, 0x202);
        assert_eq!(regs.mxcsr, 0x1F80);
        assert_eq!(regs.fcw, 0x33F);
    }

    #[test]
    fn fx_area_is_16_byte_aligned() {
        assert_eq!(core::mem::align_of::<FxArea>(), 16);
        assert_eq!(core::mem::size_of::<FxArea>(), 512);
    }

    #[test]
    fn stop_and_rewrite_markers_are_consumed_once() {
        let t = Thread::test_thread();

        assert!(!t.take_sig_stopped());
        t.set_sig_stopped(true);
        assert!(t.take_sig_stopped());
        assert!(!t.take_sig_stopped());

        assert!(!t.take_ctx_rewritten());
        t.mark_ctx_rewritten();
        assert!(t.take_ctx_rewritten());
        assert!(!t.take_ctx_rewritten());
    }
}
