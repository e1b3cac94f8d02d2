//! File descriptor tables
//!
//! POSIX descriptor semantics without the VFS: descriptors index open
//! file descriptions (shared across dup and fork), each entry carries the
//! CLOEXEC bit, and pipe ends count their readers/writers through the
//! open-file Drop. Real file nodes come from the VFS collaborator and
//! plug in through [`FileKind::External`].

use alloc::{sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    ipc::Pipe,
};

/// fcntl commands the kernel core implements.
pub const F_DUPFD: usize = 0;
pub const F_GETFD: usize = 1;
pub const F_SETFD: usize = 2;
/// The CLOEXEC descriptor flag (fcntl FD_CLOEXEC).
pub const FD_CLOEXEC: usize = 1;

/// Hard cap on descriptors per process.
pub const MAX_FDS: usize = 256;

/// External file operations, provided by the VFS collaborator.
pub trait ExternalFile: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize>;
    fn ioctl(&self, _request: u64, _arg: u64) -> KernelResult<usize> {
        Err(KernelError::InvalidArgument)
    }
    fn size(&self) -> u64 {
        0
    }
}

enum FileKind {
    PipeReader(Arc<Pipe>),
    PipeWriter(Arc<Pipe>),
    External(Arc<dyn ExternalFile>),
    /// Always-empty sink (the fallback for collaborator-less boots).
    Null,
}

/// One open file description, shared by every descriptor that dup'd it.
pub struct OpenFile {
    kind: FileKind,
    offset: crate::sync::IrqSpinlock<u64>,
}

impl OpenFile {
    pub fn pipe_reader(pipe: Arc<Pipe>) -> Arc<Self> {
        Arc::new(Self {
            kind: FileKind::PipeReader(pipe),
            offset: crate::sync::IrqSpinlock::new(0),
        })
    }

    pub fn pipe_writer(pipe: Arc<Pipe>) -> Arc<Self> {
        Arc::new(Self {
            kind: FileKind::PipeWriter(pipe),
            offset: crate::sync::IrqSpinlock::new(0),
        })
    }

    pub fn external(file: Arc<dyn ExternalFile>) -> Arc<Self> {
        Arc::new(Self {
            kind: FileKind::External(file),
            offset: crate::sync::IrqSpinlock::new(0),
        })
    }

    pub fn null() -> Arc<Self> {
        Arc::new(Self {
            kind: FileKind::Null,
            offset: crate::sync::IrqSpinlock::new(0),
        })
    }

    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &self.kind {
            FileKind::PipeReader(pipe) => pipe.read(buf),
            FileKind::PipeWriter(_) => Err(KernelError::InvalidArgument),
            FileKind::External(file) => {
                let mut offset = self.offset.lock();
                let n = file.read(*offset, buf)?;
                *offset += n as u64;
                Ok(n)
            }
            FileKind::Null => Ok(0),
        }
    }

    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &self.kind {
            FileKind::PipeReader(_) => Err(KernelError::InvalidArgument),
            FileKind::PipeWriter(pipe) => pipe.write(buf),
            FileKind::External(file) => {
                let mut offset = self.offset.lock();
                let n = file.write(*offset, buf)?;
                *offset += n as u64;
                Ok(n)
            }
            FileKind::Null => Ok(buf.len()),
        }
    }

    /// lseek on the shared description offset.
    pub fn seek(&self, pos: u64) -> KernelResult<u64> {
        match &self.kind {
            FileKind::External(_) | FileKind::Null => {
                *self.offset.lock() = pos;
                Ok(pos)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            FileKind::External(file) => file.size(),
            _ => 0,
        }
    }

    pub fn ioctl(&self, request: u64, arg: u64) -> KernelResult<usize> {
        match &self.kind {
            FileKind::External(file) => file.ioctl(request, arg),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        match &self.kind {
            FileKind::PipeReader(pipe) => pipe.drop_reader(),
            FileKind::PipeWriter(pipe) => pipe.drop_writer(),
            _ => {}
        }
    }
}

#[derive(Clone)]
pub struct FdEntry {
    pub file: Arc<OpenFile>,
    pub cloexec: bool,
}

/// Per-process descriptor table.
pub struct FdTable {
    entries: Vec<Option<FdEntry>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Install `file` at the lowest free descriptor.
    pub fn insert(&mut self, file: Arc<OpenFile>) -> KernelResult<usize> {
        self.insert_from(file, 0)
    }

    /// Install at the lowest free descriptor >= `min` (F_DUPFD).
    pub fn insert_from(&mut self, file: Arc<OpenFile>, min: usize) -> KernelResult<usize> {
        for fd in min..self.entries.len() {
            if self.entries[fd].is_none() {
                self.entries[fd] = Some(FdEntry {
                    file,
                    cloexec: false,
                });
                return Ok(fd);
            }
        }

        let fd = self.entries.len().max(min);
        if fd >= MAX_FDS {
            return Err(KernelError::InvalidArgument);
        }
        self.entries.resize_with(fd + 1, || None);
        self.entries[fd] = Some(FdEntry {
            file,
            cloexec: false,
        });
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> Option<&FdEntry> {
        self.entries.get(fd)?.as_ref()
    }

    pub fn file(&self, fd: usize) -> KernelResult<Arc<OpenFile>> {
        self.get(fd)
            .map(|entry| entry.file.clone())
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn close(&mut self, fd: usize) -> KernelResult<()> {
        match self.entries.get_mut(fd) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// dup2: `new` silently closes first; the description is shared.
    pub fn dup2(&mut self, old: usize, new: usize) -> KernelResult<usize> {
        if new >= MAX_FDS {
            return Err(KernelError::InvalidArgument);
        }
        let entry = self
            .get(old)
            .cloned()
            .ok_or(KernelError::InvalidArgument)?;

        if old == new {
            return Ok(new);
        }

        if new >= self.entries.len() {
            self.entries.resize_with(new + 1, || None);
        }
        self.entries[new] = Some(FdEntry {
            file: entry.file,
            cloexec: false,
        });
        Ok(new)
    }

    pub fn set_cloexec(&mut self, fd: usize, value: bool) -> KernelResult<()> {
        match self.entries.get_mut(fd) {
            Some(Some(entry)) => {
                entry.cloexec = value;
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub fn cloexec(&self, fd: usize) -> KernelResult<bool> {
        self.get(fd)
            .map(|entry| entry.cloexec)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Close everything marked CLOEXEC (exec).
    pub fn close_cloexec(&mut self) {
        for slot in self.entries.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.cloexec) {
                *slot = None;
            }
        }
    }

    /// Deep copy for fork: descriptors are copied, open file descriptions
    /// stay shared.
    pub fn duplicate(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn open_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn insert_uses_lowest_free_slot() {
        let mut table = FdTable::new();
        let a = table.insert(OpenFile::null()).expect("table empty");
        let b = table.insert(OpenFile::null()).expect("room left");
        assert_eq!((a, b), (0, 1));

        table.close(0).expect("fd 0 open");
        let c = table.insert(OpenFile::null()).expect("slot 0 free again");
        assert_eq!(c, 0);
    }

    #[test]
    fn dup2_shares_the_description() {
        let mut table = FdTable::new();
        let fd = table.insert(OpenFile::null()).expect("table empty");
        let dup = table.dup2(fd, 7).expect("7 in range");
        assert_eq!(dup, 7);

        let orig = table.file(fd).expect("original still open");
        let copy = table.file(7).expect("dup open");
        assert!(Arc::ptr_eq(&orig, &copy));
    }

    #[test]
    fn cloexec_closes_on_exec_only() {
        let mut table = FdTable::new();
        let keep = table.insert(OpenFile::null()).expect("table empty");
        let lose = table.insert(OpenFile::null()).expect("room left");
        table.set_cloexec(lose, true).expect("fd open");

        table.close_cloexec();
        assert!(table.get(keep).is_some());
        assert!(table.get(lose).is_none());
    }

    #[test]
    fn duplicate_preserves_cloexec_flags() {
        let mut table = FdTable::new();
        let fd = table.insert(OpenFile::null()).expect("table empty");
        table.set_cloexec(fd, true).expect("fd open");

        let copy = table.duplicate();
        assert!(copy.cloexec(fd).expect("fd copied"));
    }

    #[test]
    fn pipe_ends_close_through_fd_drop() {
        let pipe = Pipe::new();
        let mut table = FdTable::new();
        let r = table
            .insert(OpenFile::pipe_reader(pipe.clone()))
            .expect("table empty");
        let _w = table
            .insert(OpenFile::pipe_writer(pipe.clone()))
            .expect("room left");

        // Write then drain; nothing blocks while both ends are open.
        pipe.write(b"ab").expect("space available");
        let mut buf = [0u8; 2];
        table
            .file(r)
            .expect("reader open")
            .read(&mut buf)
            .expect("data available");
        assert_eq!(&buf, b"ab");

        // Closing the last reader fd lets writers observe broken pipe.
        table.close(r).expect("reader open");
        assert!(pipe.write(b"x").is_err());
    }
}
