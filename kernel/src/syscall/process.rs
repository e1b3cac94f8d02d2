//! Process management system calls

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::{
    error::Errno,
    mm::uaccess,
    process::{self, exec, exit, fork, group, wait},
    sched::{self, futex, task::Thread},
    syscall::{validate_user_range, SyscallResult},
    time::Timespec,
};

/// Longest path / argument string accepted from user space.
const MAX_STR: usize = 4096;
/// Most argv/envp entries accepted.
const MAX_ARGS: usize = 256;

pub fn sys_exit(args: [usize; 6]) -> SyscallResult {
    exit::exit_current(args[0] as i32);
}

pub fn sys_getpid(thread: &Arc<Thread>) -> SyscallResult {
    Ok(thread.pid().max(0) as usize)
}

pub fn sys_gettid(thread: &Arc<Thread>) -> SyscallResult {
    Ok(thread.tid().max(0) as usize)
}

pub fn sys_getppid(thread: &Arc<Thread>) -> SyscallResult {
    let proc = thread.process().ok_or(Errno::Esrch)?;
    Ok(proc.ppid().max(0) as usize)
}

pub fn sys_fork(thread: &Arc<Thread>) -> SyscallResult {
    let proc = thread.process().ok_or(Errno::Esrch)?;
    let child = fork::fork_process(&proc, thread).map_err(Errno::from)?;
    Ok(child.pid() as usize)
}

/// Read a NULL-terminated array of user string pointers.
fn read_string_vec(thread: &Arc<Thread>, array: u64) -> Result<Vec<String>, Errno> {
    let space = thread.address_space();
    let mut out = Vec::new();

    if array == 0 {
        return Ok(out);
    }

    for i in 0..MAX_ARGS as u64 {
        let ptr: u64 = uaccess::read_val(&space, array + i * 8).map_err(Errno::from)?;
        if ptr == 0 {
            return Ok(out);
        }
        out.push(uaccess::read_cstring(&space, ptr, MAX_STR).map_err(Errno::from)?);
    }

    Err(Errno::Einval)
}

pub fn sys_exec(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let proc = thread.process().ok_or(Errno::Esrch)?;
    let space = thread.address_space();

    validate_user_range(args[0] as u64, 1)?;
    let path = uaccess::read_cstring(&space, args[0] as u64, MAX_STR).map_err(Errno::from)?;
    let argv = read_string_vec(thread, args[1] as u64)?;
    let envp = read_string_vec(thread, args[2] as u64)?;

    exec::execve(&proc, thread, &path, argv, envp).map_err(Errno::from)?;

    // The saved context now holds the fresh image; the dispatcher must
    // not re-sync it from the pre-exec frame.
    thread.mark_ctx_rewritten();
    Ok(0)
}

pub fn sys_futex(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (uaddr, op, expected, timeout_ptr) = (args[0], args[1], args[2] as u32, args[3]);

    let timeout = if timeout_ptr != 0 {
        validate_user_range(timeout_ptr as u64, core::mem::size_of::<Timespec>())?;
        let spec: Timespec =
            uaccess::read_val(&thread.address_space(), timeout_ptr as u64).map_err(Errno::from)?;
        Some(spec)
    } else {
        None
    };

    futex::do_futex(uaddr as u64, op, expected, timeout)
        .map_err(Errno::from)
}

pub fn sys_waitpid(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (pid, status_ptr, options) = (args[0] as i64, args[1], args[2]);
    let proc = thread.process().ok_or(Errno::Esrch)?;

    let (status, child_pid) = wait::waitpid(&proc, thread, pid, options).map_err(Errno::from)?;

    if status_ptr != 0 {
        validate_user_range(status_ptr as u64, 4)?;
        uaccess::write_val(&thread.address_space(), status_ptr as u64, &(status as i32))
            .map_err(Errno::from)?;
    }

    Ok(child_pid.max(0) as usize)
}

pub fn sys_setpgid(args: [usize; 6]) -> SyscallResult {
    let caller = process::current().ok_or(Errno::Esrch)?;
    group::setpgid(&caller, args[0] as i64, args[1] as i64).map_err(Errno::from)?;
    Ok(0)
}

pub fn sys_getpgid(args: [usize; 6]) -> SyscallResult {
    group::getpgid(args[0] as i64)
        .map(|pgid| pgid as usize)
        .map_err(Errno::from)
}

pub fn sys_setsid() -> SyscallResult {
    let caller = process::current().ok_or(Errno::Esrch)?;
    group::setsid(&caller)
        .map(|sid| sid as usize)
        .map_err(Errno::from)
}

pub fn sys_getsid(args: [usize; 6]) -> SyscallResult {
    group::getsid(args[0] as i64)
        .map(|sid| sid as usize)
        .map_err(Errno::from)
}

/// Timeouts and elapsed sleeps return through here so usleep lives next
/// to its siblings.
pub fn do_usleep(us: u64) -> SyscallResult {
    match sched::sleep_interruptible(Timespec::from_us(us as i64)) {
        Ok(()) => Ok(0),
        Err(err) => Err(Errno::from(err)),
    }
}
