//! Signal issue and dispatch
//!
//! Issue runs before every return to user mode and on every reschedule of
//! a user thread: process-pending bits move to a thread whose mask admits
//! them, preferring one parked in an interruptible wait. Dispatch then
//! delivers each unmasked thread-pending signal: default actions act on
//! the whole process, user handlers get a ucontext snapshot, a fresh
//! demand-paged signal stack, and a trampoline that re-enters the kernel
//! via `sigreturn`.

use alloc::sync::Arc;

use super::{
    default_action, is_valid, sigmask, DefaultAction, SigInfo, SigSet, SignalSlot, UContext,
    SIGCONT, SIGKILL, SIGNAL_MAX, SIGSTOP, SA_SIGINFO,
};
use crate::{
    error::{KernelError, KernelResult},
    ipc::evtable,
    mm::{self, uaccess, MapFlags},
    process::{self, Process},
    sched::task::{Thread, ThreadState},
    time::Timespec,
};
use core::sync::atomic::Ordering;

/// A sender may signal a target when root, or when their real/effective
/// uids intersect.
pub fn check_perms(sender: &Arc<Process>, target: &Arc<Process>) -> bool {
    let (s_real, s_eff) = sender.uids();
    if s_real == 0 || s_eff == 0 {
        return true;
    }

    let (t_real, t_eff) = target.uids();
    s_real == t_real || s_real == t_eff || s_eff == t_real || s_eff == t_eff
}

/// Generate `sig` for `target`. `sender` is `None` for kernel-internal
/// sources (faults, timers, the tick path). Returns Ok(()) even when the
/// signal is discarded as ignored, matching POSIX kill semantics.
pub fn send_process(
    sender: Option<&Arc<Process>>,
    target: &Arc<Process>,
    sig: i32,
    info: Option<SigInfo>,
) -> KernelResult<()> {
    if sig == 0 {
        // Permission probe only.
        if let Some(sender) = sender {
            if !check_perms(sender, target) {
                return Err(KernelError::PermissionDenied);
            }
        }
        return Ok(());
    }

    if !is_valid(sig) {
        return Err(KernelError::InvalidArgument);
    }

    if let Some(sender) = sender {
        if !check_perms(sender, target) {
            return Err(KernelError::PermissionDenied);
        }
    }

    // Ignored signals are discarded at generation; KILL and STOP cannot be
    // ignored.
    if sig != SIGKILL && sig != SIGSTOP {
        let action = target.sigaction(sig);
        if action.is_ignore() {
            return Ok(());
        }
        if action.is_default() && default_action(sig) == DefaultAction::Ignore {
            return Ok(());
        }
    }

    // Continue acts immediately, even without a dispatch cycle.
    if sig == SIGCONT {
        target.cont();
    }

    target.sig_pending.push(sig, info);
    issue_signals(target);
    wake_interruptible(target);

    Ok(())
}

/// Signal every member of process group `pgid`.
pub fn send_group(sender: Option<&Arc<Process>>, pgid: i64, sig: i32) -> KernelResult<()> {
    let members = process::table::processes_in_group(pgid);
    if members.is_empty() {
        return Err(KernelError::ProcessNotFound { pid: pgid });
    }

    for member in members {
        // Per-member permission failures do not abort the group send.
        let _ = send_process(sender, &member, sig, None);
    }
    Ok(())
}

/// `kill(2)` pid dispatch: positive pids name a process, 0 and -1 the
/// sender's group, below -1 the group `-pid`.
pub fn do_kill(pid: i64, sig: i32) -> KernelResult<()> {
    let sender = process::current().ok_or(KernelError::InvalidArgument)?;
    let info = SigInfo::user(sig, sender.pid(), sender.uids().0);

    if pid > 0 {
        let target =
            process::table::get(pid).ok_or(KernelError::ProcessNotFound { pid })?;
        send_process(Some(&sender), &target, sig, Some(info))
    } else if pid == 0 || pid == -1 {
        send_group(Some(&sender), sender.pgid(), sig)
    } else {
        send_group(Some(&sender), -pid, sig)
    }
}

/// Inject `sig` straight into a thread's pending set, bypassing the
/// process stage. Used for synchronous faults (SIGSEGV/SIGILL/SIGFPE)
/// where the faulting thread must be the one that dies.
pub fn force_thread_signal(thread: &Arc<Thread>, sig: i32) {
    thread.sig.push(
        sig,
        Some(SigInfo {
            si_signo: sig,
            ..SigInfo::default()
        }),
    );
    thread.pending_signal.store(true, Ordering::Release);
    thread.interrupt();
}

/// Move process-pending bits onto threads able to take them.
pub fn issue_signals(proc: &Arc<Process>) {
    for sig in 1..SIGNAL_MAX {
        if proc.sig_pending.pending() & sigmask(sig) == 0 {
            continue;
        }

        let Some(thread) = pick_thread_for_signal(proc, sig) else {
            // Every thread masks it; the bit stays process-pending.
            continue;
        };

        if let Some(info) = proc.sig_pending.take(sig) {
            thread.sig.push(sig, info);
            thread.pending_signal.store(true, Ordering::Release);
        }
    }
}

/// Prefer a thread sleeping interruptibly; fall back to any live thread
/// whose mask admits the signal. KILL and STOP ignore masks.
fn pick_thread_for_signal(proc: &Arc<Process>, sig: i32) -> Option<Arc<Thread>> {
    let unmaskable = sig == SIGKILL || sig == SIGSTOP;
    let threads = proc.threads.lock();

    let admits = |thread: &Arc<Thread>| {
        thread.state() != ThreadState::Dead
            && (unmaskable || thread.sig.mask() & sigmask(sig) == 0)
    };

    threads
        .iter()
        .flatten()
        .find(|t| t.is_interruptible() && admits(t))
        .or_else(|| threads.iter().flatten().find(|t| admits(t)))
        .cloned()
}

/// Kick threads out of interruptible waits once they hold a deliverable
/// signal.
fn wake_interruptible(proc: &Arc<Process>) {
    let threads: alloc::vec::Vec<Arc<Thread>> =
        proc.threads.lock().iter().flatten().cloned().collect();

    for thread in threads {
        if thread.is_interruptible() && thread.sig.has_deliverable() {
            thread.interrupt();
            thread.sig.wire.arise(evtable::SIGNAL_WAKE);
        }
    }
}

/// Issue + dispatch for one thread; the reschedule path calls this just
/// before resuming a user thread.
pub fn process_signals(proc: &Arc<Process>, thread: &Arc<Thread>) {
    issue_signals(proc);
    dispatch_signals(proc, thread);
}

/// Deliver the first dispatchable thread-pending signal, if the thread is
/// in a state to take one.
pub fn dispatch_signals(proc: &Arc<Process>, thread: &Arc<Thread>) {
    if thread.state() == ThreadState::Dead
        || thread.dispatch_ready.load(Ordering::Acquire)
        || thread.in_syscall.load(Ordering::Acquire)
    {
        if thread.sig.has_deliverable() {
            thread.pending_signal.store(true, Ordering::Release);
        }
        return;
    }

    for sig in 1..SIGNAL_MAX {
        let bit = sigmask(sig);
        if thread.sig.pending() & bit == 0 {
            continue;
        }
        if sig != SIGKILL && sig != SIGSTOP && thread.sig.mask() & bit != 0 {
            continue;
        }

        let Some(slot) = thread.sig.take(sig) else {
            continue;
        };
        thread.pending_signal.store(false, Ordering::Release);

        let action = proc.sigaction(sig);

        if action.is_ignore() && sig != SIGKILL && sig != SIGSTOP {
            continue;
        }

        if action.is_default() || sig == SIGKILL || sig == SIGSTOP {
            match default_action(sig) {
                DefaultAction::Ignore => continue,
                DefaultAction::Continue => continue,
                DefaultAction::Stop => {
                    thread.sig.mark_delivered(sig);
                    proc.suspend();
                    return;
                }
                DefaultAction::Terminate => {
                    deliver_default_exit(thread, sig, false);
                    return;
                }
                DefaultAction::Core => {
                    deliver_default_exit(thread, sig, true);
                    return;
                }
            }
        }

        deliver_user_handler(proc, thread, sig, slot, action);
        thread.sig.mark_delivered(sig);
        thread.sig.wire.arise(evtable::SIGNAL_WAKE);
        return;
    }
}

/// Thunk a fatally-signaled thread resumes into: runs in kernel mode on
/// the signal kernel stack and takes the whole process down.
extern "C" fn fatal_signal_entry(encoded: u64) -> ! {
    process::exit::exit_current_status(encoded as i64);
}

/// Arrange for the thread to exit with `sig`'s wait-status upon resume:
/// build a minimal kernel frame on the signal kernel stack and swap it in.
fn deliver_default_exit(thread: &Arc<Thread>, sig: i32, core: bool) {
    let status = process::wait::WaitStatus::Signaled { sig, core }.encode();

    let mut guard = thread.ctx.lock();
    let ctx = &mut *guard;

    ctx.regs.rip = fatal_signal_entry as usize as u64;
    ctx.regs.rdi = status as u64;
    ctx.regs.rsp = ctx.sig_kstack;
    ctx.regs.cs = crate::arch::KERNEL_CS as u64;
    ctx.regs.ss = crate::arch::KERNEL_SS as u64;

    core::mem::swap(&mut ctx.kstack, &mut ctx.sig_kstack);
    drop(guard);

    thread.dispatch_ready.store(true, Ordering::Release);
    thread.sig.mark_delivered(sig);
}

/// Hand the signal to a registered user handler. The thread resumes at the
/// process's sigenter stub with the handler address in rax, signum in rdi
/// and, for SA_SIGINFO, siginfo/ucontext pointers in rsi/rdx; the stub
/// calls the handler and re-enters the kernel via `sigreturn`.
fn deliver_user_handler(
    proc: &Arc<Process>,
    thread: &Arc<Thread>,
    sig: i32,
    slot: SignalSlot,
    action: super::SigAction,
) {
    let sigenter = proc.sigenter_rip.load(Ordering::Acquire);
    if sigenter == 0 {
        // No userspace trampoline registered; treat as fatal.
        deliver_default_exit(thread, sig, false);
        return;
    }

    let space = thread.address_space();
    let Ok(stack_base) = space.map(
        None,
        mm::USER_STACK_SIZE,
        MapFlags::READ | MapFlags::WRITE | MapFlags::USER | MapFlags::DEMAND,
    ) else {
        deliver_default_exit(thread, sig, false);
        return;
    };
    let stack_top = stack_base + mm::USER_STACK_SIZE as u64;

    let mut guard = thread.ctx.lock();
    let ctx = &mut *guard;

    // Snapshot the interrupted context; sigreturn restores it verbatim.
    ctx.ucontext = UContext {
        flags: 0,
        prev: 0,
        stack: stack_base,
        regs: ctx.regs,
        fx_area: ctx.fx_area.clone(),
        sigmask: thread.sig.mask(),
    };

    // Materialize siginfo and the user-visible ucontext on the signal
    // stack.
    let info = slot.info.unwrap_or(SigInfo {
        si_signo: sig,
        ..SigInfo::default()
    });

    let mut sp = stack_top;
    sp = (sp - core::mem::size_of::<UContext>() as u64) & !0xF;
    let uctx_ptr = sp;
    sp = (sp - core::mem::size_of::<SigInfo>() as u64) & !0xF;
    let info_ptr = sp;

    if uaccess::write_val(&space, uctx_ptr, &ctx.ucontext).is_err()
        || uaccess::write_val(&space, info_ptr, &info).is_err()
    {
        drop(guard);
        let _ = space.unmap(stack_base, mm::USER_STACK_SIZE);
        deliver_default_exit(thread, sig, false);
        return;
    }

    // Entry frame for the sigenter stub.
    sp &= !0xF;
    sp -= 8;
    ctx.regs.rip = sigenter;
    ctx.regs.rsp = sp;
    ctx.regs.rax = action.handler as u64;
    ctx.regs.rdi = sig as u64;
    if action.flags & SA_SIGINFO != 0 {
        ctx.regs.rsi = info_ptr;
        ctx.regs.rdx = uctx_ptr;
    } else {
        ctx.regs.rsi = 0;
        ctx.regs.rdx = 0;
    }

    // Handler runs with the signal blocked unless SA_NODEFER.
    let mut handler_mask = thread.sig.mask() | action.mask;
    if action.flags & super::SA_NODEFER == 0 {
        handler_mask |= sigmask(sig);
    }
    thread.sig.set_mask(handler_mask);

    if action.flags & super::SA_RESETHAND != 0 {
        proc.set_sigaction(sig, super::SigAction::default_action());
    }

    // Swap in the signal stacks for the handler's lifetime.
    core::mem::swap(&mut ctx.kstack, &mut ctx.sig_kstack);
    ctx.sig_ustack = ctx.ustack;
    ctx.ustack = sp;

    drop(guard);
    thread.dispatch_ready.store(true, Ordering::Release);
}

/// `sigreturn`: restore the saved ucontext, release the signal stack, swap
/// the stacks back and reopen dispatch. Returns nothing; the restored
/// frame (including rax) is what resumes.
pub fn sigreturn(thread: &Arc<Thread>) {
    let (stack, restored_mask) = {
        let mut guard = thread.ctx.lock();
        let ctx = &mut *guard;
        let uctx = ctx.ucontext;

        let mut regs = uctx.regs;
        // Never trust the snapshot for privileged selectors.
        regs.cs = crate::arch::USER_CS as u64;
        regs.ss = crate::arch::USER_SS as u64;
        ctx.regs = regs;
        ctx.fx_area = uctx.fx_area;

        core::mem::swap(&mut ctx.kstack, &mut ctx.sig_kstack);
        ctx.ustack = ctx.sig_ustack;

        (uctx.stack, uctx.sigmask)
    };

    thread.sig.set_mask(restored_mask);

    if stack != 0 {
        let _ = thread.address_space().unmap(stack, mm::USER_STACK_SIZE);
    }

    thread.dispatch_ready.store(false, Ordering::Release);
}

/// Sleep until any signal in `set` has been delivered to this thread
/// (sigsuspend-style). A timeout turns into `WouldBlock`.
pub fn wait_signal(
    thread: &Arc<Thread>,
    set: SigSet,
    timeout: Option<Timespec>,
) -> KernelResult<i32> {
    thread.sig.reset_delivered(set);

    loop {
        if let Some(sig) = thread.sig.take_delivered(set) {
            return Ok(sig);
        }

        let (event, _) = thread
            .sig
            .wire
            .clone()
            .wait(evtable::SIGNAL_WAKE, true, timeout)?;
        if event == evtable::TIME_WAKE {
            return Err(KernelError::WouldBlock);
        }
    }
}
