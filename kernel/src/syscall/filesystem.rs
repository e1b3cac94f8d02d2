//! Descriptor-level system calls
//!
//! Everything that works on the fd table lives here; path resolution
//! belongs to the VFS collaborator and its absence surfaces as ENOSYS
//! from the dispatcher.

use alloc::sync::Arc;

use crate::{
    error::Errno,
    fs::fd::{self, OpenFile},
    ipc::Pipe,
    mm::uaccess,
    process,
    sched::task::Thread,
    syscall::{validate_user_range, SyscallResult},
};

/// Read/write buffers are chunked through a bounce buffer of this size.
const IO_CHUNK: usize = 4096;

pub fn sys_openat(_args: [usize; 6]) -> SyscallResult {
    // Path lookup is the VFS collaborator's.
    Err(Errno::Enosys)
}

pub fn sys_close(args: [usize; 6]) -> SyscallResult {
    let proc = process::current().ok_or(Errno::Esrch)?;
    proc.fds.lock().close(args[0]).map_err(|_| Errno::Ebadf)?;
    Ok(0)
}

pub fn sys_read(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (fd, buf, len) = (args[0], args[1] as u64, args[2]);
    if len == 0 {
        return Ok(0);
    }
    validate_user_range(buf, len)?;

    let proc = thread.process().ok_or(Errno::Esrch)?;
    let file = proc.fds.lock().file(fd).map_err(|_| Errno::Ebadf)?;
    let space = thread.address_space();

    let mut bounce = [0u8; IO_CHUNK];
    let mut done = 0usize;
    while done < len {
        let chunk = IO_CHUNK.min(len - done);
        let n = file.read(&mut bounce[..chunk]).map_err(Errno::from)?;
        if n == 0 {
            break;
        }
        uaccess::copy_to_user(&space, buf + done as u64, &bounce[..n]).map_err(Errno::from)?;
        done += n;
        if n < chunk {
            break;
        }
    }

    Ok(done)
}

pub fn sys_write(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (fd, buf, len) = (args[0], args[1] as u64, args[2]);
    if len == 0 {
        return Ok(0);
    }
    validate_user_range(buf, len)?;

    let proc = thread.process().ok_or(Errno::Esrch)?;
    let file = proc.fds.lock().file(fd).map_err(|_| Errno::Ebadf)?;
    let space = thread.address_space();

    let mut bounce = [0u8; IO_CHUNK];
    let mut done = 0usize;
    while done < len {
        let chunk = IO_CHUNK.min(len - done);
        uaccess::copy_from_user(&space, buf + done as u64, &mut bounce[..chunk])
            .map_err(Errno::from)?;
        let n = match file.write(&bounce[..chunk]) {
            Ok(n) => n,
            Err(crate::error::KernelError::BrokenPipe) => {
                // POSIX: EPIPE is paired with SIGPIPE to the writer.
                crate::signal::force_thread_signal(thread, crate::signal::SIGPIPE);
                return Err(Errno::Epipe);
            }
            Err(err) => return Err(Errno::from(err)),
        };
        done += n;
        if n < chunk {
            break;
        }
    }

    Ok(done)
}

pub fn sys_lseek(args: [usize; 6]) -> SyscallResult {
    const SEEK_SET: usize = 0;
    const SEEK_CUR: usize = 1;
    const SEEK_END: usize = 2;

    let (fd, offset, whence) = (args[0], args[1] as i64, args[2]);
    let proc = process::current().ok_or(Errno::Esrch)?;
    let file = proc.fds.lock().file(fd).map_err(|_| Errno::Ebadf)?;

    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => file.offset() as i64,
        SEEK_END => file.size() as i64,
        _ => return Err(Errno::Einval),
    };

    let target = base.checked_add(offset).ok_or(Errno::Einval)?;
    if target < 0 {
        return Err(Errno::Einval);
    }

    file.seek(target as u64)
        .map(|pos| pos as usize)
        .map_err(Errno::from)
}

pub fn sys_dup2(args: [usize; 6]) -> SyscallResult {
    let proc = process::current().ok_or(Errno::Esrch)?;
    let result = proc
        .fds
        .lock()
        .dup2(args[0], args[1])
        .map_err(|_| Errno::Ebadf);
    result
}

pub fn sys_fcntl(args: [usize; 6]) -> SyscallResult {
    let (fd, cmd, arg) = (args[0], args[1], args[2]);
    let proc = process::current().ok_or(Errno::Esrch)?;
    let mut fds = proc.fds.lock();

    match cmd {
        fd::F_DUPFD => {
            let file = fds.file(fd).map_err(|_| Errno::Ebadf)?;
            fds.insert_from(file, arg).map_err(Errno::from)
        }
        fd::F_GETFD => {
            let cloexec = fds.cloexec(fd).map_err(|_| Errno::Ebadf)?;
            Ok(if cloexec { fd::FD_CLOEXEC } else { 0 })
        }
        fd::F_SETFD => {
            fds.set_cloexec(fd, arg & fd::FD_CLOEXEC != 0)
                .map_err(|_| Errno::Ebadf)?;
            Ok(0)
        }
        _ => Err(Errno::Einval),
    }
}

pub fn sys_ioctl(args: [usize; 6]) -> SyscallResult {
    let (fd, request, arg) = (args[0], args[1] as u64, args[2] as u64);
    let proc = process::current().ok_or(Errno::Esrch)?;
    let file = proc.fds.lock().file(fd).map_err(|_| Errno::Ebadf)?;
    file.ioctl(request, arg).map_err(Errno::from)
}

/// pipe(fds[2]): read end first, write end second.
pub fn sys_pipe(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    validate_user_range(args[0] as u64, 8)?;

    let proc = thread.process().ok_or(Errno::Esrch)?;
    let pipe = Pipe::new();

    let (read_fd, write_fd) = {
        let mut fds = proc.fds.lock();
        let read_fd = fds
            .insert(OpenFile::pipe_reader(pipe.clone()))
            .map_err(|_| Errno::Emfile)?;
        let write_fd = match fds.insert(OpenFile::pipe_writer(pipe.clone())) {
            Ok(fd) => fd,
            Err(_) => {
                let _ = fds.close(read_fd);
                return Err(Errno::Emfile);
            }
        };
        (read_fd, write_fd)
    };

    let space = thread.address_space();
    let pair = [read_fd as i32, write_fd as i32];
    uaccess::write_val(&space, args[0] as u64, &pair).map_err(Errno::from)?;

    Ok(0)
}

pub fn sys_getcwd(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    let (buf, size) = (args[0] as u64, args[1]);
    let proc = thread.process().ok_or(Errno::Esrch)?;
    let cwd = proc.cwd.lock().clone();

    if cwd.len() + 1 > size {
        return Err(Errno::Einval);
    }
    validate_user_range(buf, cwd.len() + 1)?;

    let space = thread.address_space();
    uaccess::copy_to_user(&space, buf, cwd.as_bytes()).map_err(Errno::from)?;
    uaccess::write_val(&space, buf + cwd.len() as u64, &0u8).map_err(Errno::from)?;

    Ok(cwd.len())
}

pub fn sys_chdir(args: [usize; 6], thread: &Arc<Thread>) -> SyscallResult {
    validate_user_range(args[0] as u64, 1)?;
    let proc = thread.process().ok_or(Errno::Esrch)?;
    let space = thread.address_space();

    let path = uaccess::read_cstring(&space, args[0] as u64, 4096).map_err(Errno::from)?;
    if path.is_empty() {
        return Err(Errno::Einval);
    }

    // Path validation is the VFS collaborator's; the kernel records it.
    *proc.cwd.lock() = path;
    Ok(0)
}
