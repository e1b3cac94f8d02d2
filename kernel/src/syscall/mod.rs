//! System call interface
//!
//! Entry comes from the architecture's `syscall` stub with the saved user
//! frame; the dispatcher stashes it in the calling thread's context, runs
//! the handler, writes the result (or `-1` + thread errno), lets the
//! signal pipeline run, and reloads the — possibly rewritten — context
//! into the frame for the return to user mode.

#![allow(dead_code)]

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::{
    arch::IrqFrame,
    error::Errno,
    sched::{
        self,
        task::{Thread, ThreadState},
    },
    signal,
};

mod filesystem;
mod memory;
mod process;
mod sig;
mod time;
mod userptr;

pub use userptr::validate_user_range;

/// System call numbers, in the published ABI order.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Openat = 0,
    Close = 1,
    Read = 2,
    Write = 3,
    Lseek = 4,
    Dup2 = 5,
    Mmap = 6,
    Munmap = 7,
    SetFsBase = 8,
    SetGsBase = 9,
    GetFsBase = 10,
    GetGsBase = 11,
    Exit = 12,
    Getpid = 13,
    Gettid = 14,
    Getppid = 15,
    Fcntl = 16,
    Lstatat = 17,
    Ioctl = 18,
    Fork = 19,
    Exec = 20,
    Futex = 21,
    Waitpid = 22,
    Readdir = 23,
    Getcwd = 24,
    Chdir = 25,
    Pipe = 26,
    Sigenter = 27,
    Sigaction = 28,
    Sigpending = 29,
    Sigprocmask = 30,
    Kill = 31,
    Setpgid = 32,
    Getpgid = 33,
    Setsid = 34,
    Getsid = 35,
    Pause = 36,
    Sigsuspend = 37,
    Sigreturn = 38,
    Unlinkat = 39,
    Renameat = 40,
    Mkdirat = 41,
    Usleep = 42,
    ClockGettime = 43,
    ClockGet = 44,
    Linkat = 45,
    UserLog = 46,
}

impl Syscall {
    fn from_usize(nr: usize) -> Option<Self> {
        if nr > Syscall::UserLog as usize {
            return None;
        }
        // SAFETY: contiguous repr(usize) enum, bounds just checked.
        Some(unsafe { core::mem::transmute::<usize, Syscall>(nr) })
    }
}

/// Result type for handlers: a non-negative value for rax, or an errno.
pub type SyscallResult = Result<usize, Errno>;

/// Dispatcher, called from the architecture entry stub.
///
/// # Safety contract (upheld by the stub)
///
/// `frame` points at a live, fully populated frame on this thread's
/// kernel stack.
pub extern "C" fn syscall_dispatch(frame: &mut IrqFrame) {
    let Some(thread) = sched::current_thread() else {
        frame.rax = (-1i64) as u64;
        return;
    };

    thread.in_syscall.store(true, Ordering::Release);

    // The saved user state is the source of truth from here on: fork
    // clones it, exec and sigreturn rewrite it.
    {
        let mut ctx = thread.ctx.lock();
        frame.save_into(&mut ctx.regs);
    }

    let nr = frame.rax as usize;
    let args = [
        frame.rdi as usize,
        frame.rsi as usize,
        frame.rdx as usize,
        frame.r10 as usize,
        frame.r8 as usize,
        frame.r9 as usize,
    ];

    let result = dispatch(nr, args, &thread);

    let rax = match result {
        Ok(value) => value as u64,
        Err(errno) => {
            thread.set_errno(errno.as_i32());
            (-1i64) as u64
        }
    };

    // Return-to-user is a dispatch point: re-sync the saved image, run
    // the signal pipeline, reload the (possibly rewritten) image, and
    // park before sysret when a stop signal landed on this thread.
    loop {
        {
            let mut ctx = thread.ctx.lock();
            // The live frame is authoritative: the entry-time snapshot
            // goes stale whenever the handler blocked and this thread was
            // swapped while sleeping. exec and sigreturn replace the
            // snapshot wholesale (rax included) and skip the re-sync.
            if !thread.take_ctx_rewritten() {
                frame.save_into(&mut ctx.regs);
                ctx.regs.rax = rax;
            }
        }

        thread.in_syscall.store(false, Ordering::Release);

        if let Some(proc) = thread.process() {
            signal::process_signals(&proc, &thread);
        }

        {
            let ctx = thread.ctx.lock();
            frame.load_from(&ctx.regs);
        }

        if thread.state() != ThreadState::Blocked {
            break;
        }

        // A stop signal parked this thread during dispatch: yield the CPU
        // here instead of completing the return to user mode, and take
        // another dispatch pass once continued. Dispatch stays latched
        // off while parked so the saved kernel context is never treated
        // as an interruptible user frame.
        thread.in_syscall.store(true, Ordering::Release);
        while thread.state() == ThreadState::Blocked {
            sched::retick();
        }
    }
}

fn dispatch(nr: usize, args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let Some(call) = Syscall::from_usize(nr) else {
        log::debug!(target: "syscall", "unknown syscall {} from tid {}", nr, thread.tid());
        return Err(Errno::Enosys);
    };

    match call {
        Syscall::Openat => filesystem::sys_openat(args),
        Syscall::Close => filesystem::sys_close(args),
        Syscall::Read => filesystem::sys_read(args, thread),
        Syscall::Write => filesystem::sys_write(args, thread),
        Syscall::Lseek => filesystem::sys_lseek(args),
        Syscall::Dup2 => filesystem::sys_dup2(args),
        Syscall::Fcntl => filesystem::sys_fcntl(args),
        Syscall::Ioctl => filesystem::sys_ioctl(args),
        Syscall::Pipe => filesystem::sys_pipe(args, thread),
        Syscall::Getcwd => filesystem::sys_getcwd(args, thread),
        Syscall::Chdir => filesystem::sys_chdir(args, thread),
        Syscall::Lstatat
        | Syscall::Readdir
        | Syscall::Unlinkat
        | Syscall::Renameat
        | Syscall::Mkdirat
        | Syscall::Linkat => Err(Errno::Enosys),

        Syscall::Mmap => memory::sys_mmap(args, thread),
        Syscall::Munmap => memory::sys_munmap(args, thread),
        Syscall::SetFsBase => memory::sys_set_fs_base(args, thread),
        Syscall::GetFsBase => memory::sys_get_fs_base(thread),
        Syscall::SetGsBase => memory::sys_set_gs_base(args, thread),
        Syscall::GetGsBase => memory::sys_get_gs_base(thread),

        Syscall::Exit => process::sys_exit(args),
        Syscall::Getpid => process::sys_getpid(thread),
        Syscall::Gettid => process::sys_gettid(thread),
        Syscall::Getppid => process::sys_getppid(thread),
        Syscall::Fork => process::sys_fork(thread),
        Syscall::Exec => process::sys_exec(args, thread),
        Syscall::Futex => process::sys_futex(args, thread),
        Syscall::Waitpid => process::sys_waitpid(args, thread),
        Syscall::Setpgid => process::sys_setpgid(args),
        Syscall::Getpgid => process::sys_getpgid(args),
        Syscall::Setsid => process::sys_setsid(),
        Syscall::Getsid => process::sys_getsid(args),

        Syscall::Sigenter => sig::sys_sigenter(args, thread),
        Syscall::Sigaction => sig::sys_sigaction(args, thread),
        Syscall::Sigpending => sig::sys_sigpending(args, thread),
        Syscall::Sigprocmask => sig::sys_sigprocmask(args, thread),
        Syscall::Kill => sig::sys_kill(args),
        Syscall::Pause => sig::sys_pause(thread),
        Syscall::Sigsuspend => sig::sys_sigsuspend(args, thread),
        Syscall::Sigreturn => sig::sys_sigreturn(thread),

        Syscall::Usleep => time::sys_usleep(args),
        Syscall::ClockGettime => time::sys_clock_gettime(args, thread),
        Syscall::ClockGet => time::sys_clock_get(args),

        Syscall::UserLog => sys_user_log(args, thread),
    }
}

/// user_log: write a userspace string to the kernel log.
fn sys_user_log(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let len = args[1].min(512);
    validate_user_range(args[0] as u64, len)?;

    let space = thread.address_space();
    let mut buf = alloc::vec![0u8; len];
    crate::mm::uaccess::copy_from_user(&space, args[0] as u64, &mut buf)
        .map_err(Errno::from)?;

    if let Ok(message) = core::str::from_utf8(&buf) {
        log::info!(target: "user", "{}", message.trim_end());
    }
    Ok(0)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_are_stable() {
        assert_eq!(Syscall::from_usize(0), Some(Syscall::Openat));
        assert_eq!(Syscall::from_usize(19), Some(Syscall::Fork));
        assert_eq!(Syscall::from_usize(21), Some(Syscall::Futex));
        assert_eq!(Syscall::from_usize(38), Some(Syscall::Sigreturn));
        assert_eq!(Syscall::from_usize(46), Some(Syscall::UserLog));
        assert_eq!(Syscall::from_usize(47), None);
    }
}
