//! Memory management system calls

use alloc::sync::Arc;

use crate::{
    error::Errno,
    mm::{self, MapFlags},
    sched::task::Thread,
    syscall::SyscallResult,
};

// mmap prot bits.
const PROT_READ: usize = 1;
const PROT_WRITE: usize = 2;
const PROT_EXEC: usize = 4;

// mmap flags.
const MAP_SHARED: usize = 0x01;
const MAP_PRIVATE: usize = 0x02;
const MAP_FIXED: usize = 0x10;
const MAP_ANONYMOUS: usize = 0x20;

/// mmap(hint, len, prot, flags, fd, offset). Anonymous mappings only; the
/// file-backed path belongs to the VFS collaborator, which maps through
/// the callback interface instead.
pub fn sys_mmap(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (hint, len, prot, flags) = (args[0] as u64, args[1], args[2], args[3]);

    if len == 0 {
        return Err(Errno::Einval);
    }
    if flags & MAP_ANONYMOUS == 0 {
        return Err(Errno::Enosys);
    }
    if flags & MAP_SHARED != 0 && flags & MAP_PRIVATE != 0 {
        return Err(Errno::Einval);
    }

    // Hints at or below the floor, unaligned, or beyond the user ceiling
    // are invalid.
    if hint != 0 {
        if hint <= mm::MAP_MIN_ADDR || hint % mm::PAGE_SIZE as u64 != 0 {
            return Err(Errno::Einval);
        }
        let end = hint.checked_add(len as u64).ok_or(Errno::Einval)?;
        if end > mm::USER_END + 1 {
            return Err(Errno::Einval);
        }
    }

    let mut map_flags = MapFlags::USER | MapFlags::DEMAND;
    if prot & PROT_READ != 0 {
        map_flags |= MapFlags::READ;
    }
    if prot & PROT_WRITE != 0 {
        map_flags |= MapFlags::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        map_flags |= MapFlags::EXEC;
    }
    if flags & MAP_SHARED != 0 {
        map_flags |= MapFlags::SHARED;
    }
    if flags & MAP_FIXED != 0 {
        map_flags |= MapFlags::FIXED;
    }

    let space = thread.address_space();
    let hint = (hint != 0).then_some(hint);

    space
        .map(hint, len, map_flags)
        .map(|base| base as usize)
        .map_err(Errno::from)
}

pub fn sys_munmap(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (addr, len) = (args[0] as u64, args[1]);

    if addr % mm::PAGE_SIZE as u64 != 0 || len == 0 {
        return Err(Errno::Einval);
    }

    thread
        .address_space()
        .unmap(addr, len)
        .map(|_| 0)
        .map_err(Errno::from)
}

pub fn sys_set_fs_base(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    thread.ctx.lock().regs.fs = args[0] as u64;
    crate::arch::set_fs_base(args[0] as u64);
    Ok(0)
}

pub fn sys_get_fs_base(thread: &Arc<Thread>) -> SyscallResult {
    Ok(thread.ctx.lock().regs.fs as usize)
}

pub fn sys_set_gs_base(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    thread.ctx.lock().regs.gs = args[0] as u64;
    crate::arch::set_user_gs_base(args[0] as u64);
    Ok(0)
}

pub fn sys_get_gs_base(thread: &Arc<Thread>) -> SyscallResult {
    Ok(thread.ctx.lock().regs.gs as usize)
}
