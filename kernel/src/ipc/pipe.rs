//! Anonymous pipes
//!
//! A bounded byte ring with a wire on each side: readers sleep on
//! `PIPE_DATA`, writers on `PIPE_SPACE`. End-of-file and broken-pipe
//! semantics follow POSIX: zero readers makes writes fail, zero writers
//! makes an empty read return 0.

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    ipc::{evtable, Wire},
    sync::IrqSpinlock,
};

/// Capacity of the in-kernel pipe buffer (matches PIPE_BUF * 16).
const PIPE_CAPACITY: usize = 65536;

pub struct Pipe {
    buf: IrqSpinlock<VecDeque<u8>>,
    data_wire: Arc<Wire>,
    space_wire: Arc<Wire>,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

impl Pipe {
    /// Create a pipe with one reader and one writer reference, matching the
    /// two descriptors `pipe(2)` hands out.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buf: IrqSpinlock::new(VecDeque::new()),
            data_wire: Arc::new(Wire::new()),
            space_wire: Arc::new(Wire::new()),
            readers: AtomicUsize::new(1),
            writers: AtomicUsize::new(1),
        })
    }

    pub fn add_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_writer(&self) {
        self.writers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn drop_reader(&self) {
        if self.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Writers blocked on a full pipe must observe EPIPE.
            self.space_wire.arise(evtable::PIPE_SPACE);
        }
    }

    pub fn drop_writer(&self) {
        if self.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Readers blocked on an empty pipe must observe EOF.
            self.data_wire.arise(evtable::PIPE_DATA);
        }
    }

    /// Read up to `out.len()` bytes, blocking while the pipe is empty and
    /// writers remain. Returns 0 at end-of-file.
    pub fn read(&self, out: &mut [u8]) -> KernelResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            {
                let mut buf = self.buf.lock();
                if !buf.is_empty() {
                    let n = out.len().min(buf.len());
                    for slot in out.iter_mut().take(n) {
                        *slot = buf.pop_front().unwrap_or(0);
                    }
                    drop(buf);
                    self.space_wire.arise(evtable::PIPE_SPACE);
                    return Ok(n);
                }
            }

            if self.writers.load(Ordering::Acquire) == 0 {
                return Ok(0);
            }

            self.data_wire
                .wait(evtable::PIPE_DATA, true, None)
                .map(|_| ())?;
        }
    }

    /// Write all of `data`, blocking while the pipe is full and readers
    /// remain.
    pub fn write(&self, data: &[u8]) -> KernelResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        while written < data.len() {
            if self.readers.load(Ordering::Acquire) == 0 {
                // Caller turns this into EPIPE + SIGPIPE.
                return Err(KernelError::BrokenPipe);
            }

            {
                let mut buf = self.buf.lock();
                let room = PIPE_CAPACITY - buf.len();
                if room > 0 {
                    let n = room.min(data.len() - written);
                    buf.extend(&data[written..written + n]);
                    written += n;
                    drop(buf);
                    self.data_wire.arise(evtable::PIPE_DATA);
                    continue;
                }
            }

            self.space_wire
                .wait(evtable::PIPE_SPACE, true, None)
                .map(|_| ())?;
        }

        Ok(written)
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }
}
