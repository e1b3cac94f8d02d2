//! Time management system calls

use alloc::sync::Arc;

use crate::{
    error::Errno,
    mm::uaccess,
    sched::task::Thread,
    syscall::{process::do_usleep, validate_user_range, SyscallResult},
    time::{self, Timespec, MILLIS_PER_SEC, NANOS_PER_MILLI},
};

pub fn sys_usleep(args: [usize; 6]) -> SyscallResult {
    do_usleep(args[0] as u64)
}

pub fn sys_clock_gettime(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (clock, spec_ptr) = (args[0], args[1] as u64);
    validate_user_range(spec_ptr, core::mem::size_of::<Timespec>())?;

    let spec = time::get_clock(clock).ok_or(Errno::Einval)?;
    let space = thread.address_space();
    uaccess::write_val(&space, spec_ptr, &spec).map_err(Errno::from)?;
    Ok(0)
}

/// clock_get: the clock's value in whole milliseconds, in rax.
pub fn sys_clock_get(args: [usize; 6]) -> SyscallResult {
    let spec = time::get_clock(args[0]).ok_or(Errno::Einval)?;
    let ms = spec.tv_sec * MILLIS_PER_SEC + spec.tv_nsec / NANOS_PER_MILLI;
    Ok(ms as usize)
}
