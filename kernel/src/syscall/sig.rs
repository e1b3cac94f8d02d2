//! Signal system calls

use alloc::sync::Arc;

use crate::{
    error::Errno,
    ipc::evtable,
    mm::uaccess,
    sched::task::Thread,
    signal::{self, SigAction, SigSet},
    syscall::{validate_user_range, SyscallResult},
};
use core::sync::atomic::Ordering;

/// sigenter(rip): register the userspace signal-entry stub all handler
/// deliveries route through.
pub fn sys_sigenter(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let proc = thread.process().ok_or(Errno::Esrch)?;
    proc.sigenter_rip.store(args[0] as u64, Ordering::Release);
    Ok(0)
}

pub fn sys_sigaction(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (sig, act_ptr, old_ptr) = (args[0] as i32, args[1] as u64, args[2] as u64);

    if !signal::is_valid(sig) || sig == signal::SIGKILL || sig == signal::SIGSTOP {
        return Err(Errno::Einval);
    }

    let proc = thread.process().ok_or(Errno::Esrch)?;
    let space = thread.address_space();

    if old_ptr != 0 {
        validate_user_range(old_ptr, core::mem::size_of::<SigAction>())?;
        let old = proc.sigaction(sig);
        uaccess::write_val(&space, old_ptr, &old).map_err(Errno::from)?;
    }

    if act_ptr != 0 {
        validate_user_range(act_ptr, core::mem::size_of::<SigAction>())?;
        let mut act: SigAction = uaccess::read_val(&space, act_ptr).map_err(Errno::from)?;
        act.mask &= !signal::UNMASKABLE;
        proc.set_sigaction(sig, act);

        // Installing SIG_IGN discards a pending instance.
        if act.is_ignore() {
            proc.sig_pending.clear(sig);
            thread.sig.clear_pending(sig);
        }
    }

    Ok(0)
}

pub fn sys_sigpending(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    validate_user_range(args[0] as u64, core::mem::size_of::<SigSet>())?;

    let pending = thread.sig.pending();
    let space = thread.address_space();
    uaccess::write_val(&space, args[0] as u64, &pending).map_err(Errno::from)?;
    Ok(0)
}

pub fn sys_sigprocmask(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (how, set_ptr, old_ptr) = (args[0], args[1] as u64, args[2] as u64);
    let space = thread.address_space();

    let old = thread.sig.mask();

    if set_ptr != 0 {
        validate_user_range(set_ptr, core::mem::size_of::<SigSet>())?;
        let set: SigSet = uaccess::read_val(&space, set_ptr).map_err(Errno::from)?;
        thread.sig.change_mask(how, set).ok_or(Errno::Einval)?;
    }

    if old_ptr != 0 {
        validate_user_range(old_ptr, core::mem::size_of::<SigSet>())?;
        uaccess::write_val(&space, old_ptr, &old).map_err(Errno::from)?;
    }

    Ok(0)
}

pub fn sys_kill(args: [usize; 6]) -> SyscallResult {
    let (pid, sig) = (args[0] as i64, args[1] as i32);

    if sig != 0 && !signal::is_valid(sig) {
        return Err(Errno::Einval);
    }

    signal::do_kill(pid, sig).map_err(Errno::from)?;
    Ok(0)
}

/// pause(2): sleep until any signal is delivered; always returns EINTR.
pub fn sys_pause(thread: &Arc<Thread>) -> SyscallResult {
    loop {
        match thread.sig.wire.clone().wait(evtable::SIGNAL_WAKE, true, None) {
            Err(_) => return Err(Errno::Eintr),
            Ok(_) => {
                if thread.sig.has_deliverable() {
                    return Err(Errno::Eintr);
                }
            }
        }
    }
}

/// sigsuspend(2): swap in a temporary mask and wait for a delivery.
pub fn sys_sigsuspend(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    validate_user_range(args[0] as u64, core::mem::size_of::<SigSet>())?;

    let space = thread.address_space();
    let mask: SigSet = uaccess::read_val(&space, args[0] as u64).map_err(Errno::from)?;

    let old = thread.sig.mask();
    thread.sig.set_mask(mask);

    let _ = thread.sig.wire.clone().wait(evtable::SIGNAL_WAKE, true, None);

    thread.sig.set_mask(old);

    Err(Errno::Eintr)
}

pub fn sys_sigreturn(thread: &Arc<Thread>) -> SyscallResult {
    signal::sigreturn(thread);
    // The saved context is the restored ucontext now (rax included); the
    // dispatcher must neither re-sync it from the trampoline's frame nor
    // clobber its rax with a return value.
    thread.mark_ctx_rewritten();
    Ok(thread.ctx.lock().regs.rax as usize)
}
