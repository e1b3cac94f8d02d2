//! Block cache
//!
//! One [`Holder`] per block device: a radix tree mapping page-aligned
//! device offsets to cached frames, a dirty set, and a request queue
//! drained by a single kernel-wide sync thread. Resident pages are served
//! in place (writes mark the page dirty); misses enqueue a request and
//! suspend the caller on the holder's wire until the worker posts
//! `BLOCK_FIN`. Device errors travel back on the request without
//! poisoning the tree.

use alloc::{collections::BTreeSet, collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    fs::BlockDevice,
    ipc::{evtable, Wire},
    mm::{pmm, PAGE_SIZE},
    sched,
    sync::IrqSpinlock,
    time::Timespec,
};

pub mod radix;

use radix::RadixTree;

/// One page-sized span of a larger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Page-aligned device offset.
    pub page: u64,
    /// Offset of the span within its page.
    pub page_offset: usize,
    /// Offset of the span within the caller's buffer.
    pub buf_offset: usize,
    pub len: usize,
}

/// Split `[offset, offset + len)` into page-bounded spans.
pub fn spans(offset: u64, len: usize) -> Vec<Span> {
    let mut out = Vec::new();
    let mut headway = 0usize;

    while headway < len {
        let addr = offset + headway as u64;
        let page = addr & !(PAGE_SIZE as u64 - 1);
        let page_offset = (addr - page) as usize;
        let chunk = (PAGE_SIZE - page_offset).min(len - headway);

        out.push(Span {
            page,
            page_offset,
            buf_offset: headway,
            len: chunk,
        });
        headway += chunk;
    }

    out
}

/// Raw caller-buffer pointer carried across to the sync thread. The
/// requester stays blocked (uninterruptibly) until `done`, so the buffer
/// outlives the request.
struct BufPtr(*mut u8);

// SAFETY: see BufPtr docs; the pointer is only dereferenced while the
// issuing thread is parked on the request.
unsafe impl Send for BufPtr {}
unsafe impl Sync for BufPtr {}

struct IoRequest {
    span: Span,
    buffer: BufPtr,
    /// true = write to the device side.
    rw: bool,
    error: AtomicI32,
    done: AtomicBool,
    id: u64,
}

struct HolderInner {
    /// page-aligned device offset -> kernel-virtual frame address.
    pages: RadixTree,
    dirty: BTreeSet<u64>,
    requests: VecDeque<Arc<IoRequest>>,
    pending_reads: usize,
    pending_writes: usize,
}

/// Per-device page cache; see module docs.
pub struct Holder {
    device: Arc<dyn BlockDevice>,
    inner: IrqSpinlock<HolderInner>,
    wire: Arc<Wire>,
    syncing: AtomicBool,
    next_id: AtomicU64,
}

impl Holder {
    fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            inner: IrqSpinlock::new(HolderInner {
                pages: RadixTree::new(),
                dirty: BTreeSet::new(),
                requests: VecDeque::new(),
                pending_reads: 0,
                pending_writes: 0,
            }),
            wire: Arc::new(Wire::new()),
            syncing: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        })
    }

    /// Read `buf.len()` bytes at byte `offset` through the cache.
    pub fn read(self: &Arc<Self>, buf: &mut [u8], offset: u64) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.request_io(buf.as_mut_ptr(), offset, buf.len(), false)?;
        Ok(buf.len())
    }

    /// Write `buf` at byte `offset` through the cache.
    pub fn write(self: &Arc<Self>, buf: &[u8], offset: u64) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.request_io(buf.as_ptr() as *mut u8, offset, buf.len(), true)?;
        Ok(buf.len())
    }

    /// Split into page spans and satisfy each: resident pages in place,
    /// misses via the sync thread.
    fn request_io(
        self: &Arc<Self>,
        buffer: *mut u8,
        offset: u64,
        len: usize,
        rw: bool,
    ) -> KernelResult<()> {
        for span in spans(offset, len) {
            self.request_page(buffer, span, rw)?;
        }
        Ok(())
    }

    fn request_page(self: &Arc<Self>, buffer: *mut u8, span: Span, rw: bool) -> KernelResult<()> {
        debug_assert!(span.page_offset + span.len <= PAGE_SIZE);

        // Fast path: page resident.
        {
            let mut inner = self.inner.lock();
            if let Some(frame) = inner.pages.get(span.page) {
                // SAFETY: frame is a live cache page; buffer is valid for
                // the caller's request per request_io's contract.
                unsafe {
                    let page_ptr = frame as *mut u8;
                    if rw {
                        core::ptr::copy_nonoverlapping(
                            buffer.add(span.buf_offset),
                            page_ptr.add(span.page_offset),
                            span.len,
                        );
                    } else {
                        core::ptr::copy_nonoverlapping(
                            page_ptr.add(span.page_offset),
                            buffer.add(span.buf_offset),
                            span.len,
                        );
                    }
                }
                if rw {
                    inner.dirty.insert(span.page);
                }
                return Ok(());
            }
        }

        // Miss: hand the span to the sync thread and wait for BLOCK_FIN.
        let request = Arc::new(IoRequest {
            span,
            buffer: BufPtr(buffer),
            rw,
            error: AtomicI32::new(0),
            done: AtomicBool::new(false),
            id: self.next_id.fetch_add(1, Ordering::AcqRel),
        });

        {
            let mut inner = self.inner.lock();
            inner.requests.push_back(request.clone());
            if rw {
                inner.pending_writes += 1;
            } else {
                inner.pending_reads += 1;
            }
        }

        while !request.done.load(Ordering::Acquire) {
            if sched::current_thread().is_none() {
                // Pre-scheduler (or host-test) path: service inline.
                self.service_pending();
                continue;
            }
            // Signals are deferred: the buffer must stay owned until the
            // worker is done with it.
            let _ = self.wire.wait(evtable::BLOCK_FIN, false, None)?;
        }

        let error = request.error.load(Ordering::Acquire);
        if error < 0 {
            return Err(KernelError::DeviceError { code: error });
        }
        Ok(())
    }

    /// Fetch the page at `offset` into the cache, or return the resident
    /// frame. Failed reads do not install anything.
    fn page_in(&self, offset: u64) -> Result<u64, i32> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.pages.get(offset) {
            return Ok(frame);
        }

        let frame = pmm::alloc(1);
        // SAFETY: freshly allocated frame, page-sized.
        let page_buf =
            unsafe { core::slice::from_raw_parts_mut(frame as *mut u8, PAGE_SIZE) };

        match self.device.read_bytes(offset, page_buf) {
            Ok(()) => {
                inner.pages.insert(offset, frame);
                Ok(frame)
            }
            Err(KernelError::DeviceError { code }) => {
                pmm::free(frame, 1);
                Err(code)
            }
            Err(_) => {
                pmm::free(frame, 1);
                Err(-5)
            }
        }
    }

    /// Write the cached page at `offset` back to the device.
    fn flush_page(&self, offset: u64) -> Result<(), i32> {
        let frame = {
            let inner = self.inner.lock();
            inner.pages.get(offset)
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        // SAFETY: cached frames stay alive until free_pages.
        let page_buf = unsafe { core::slice::from_raw_parts(frame as *const u8, PAGE_SIZE) };
        match self.device.write_bytes(offset, page_buf) {
            Ok(()) => {
                self.inner.lock().dirty.remove(&offset);
                Ok(())
            }
            Err(KernelError::DeviceError { code }) => Err(code),
            Err(_) => Err(-5),
        }
    }

    fn pop_request(&self) -> Option<Arc<IoRequest>> {
        let mut inner = self.inner.lock();
        let request = inner.requests.pop_front()?;
        if request.rw {
            inner.pending_writes -= 1;
        } else {
            inner.pending_reads -= 1;
        }
        Some(request)
    }

    /// One worker step: complete a queued request. Both directions begin
    /// with a page-in (writes are read-modify-write of the covering page).
    fn service(&self, request: &IoRequest) {
        let span = request.span;

        match self.page_in(span.page) {
            Err(code) => request.error.store(code, Ordering::Release),
            Ok(frame) => {
                // SAFETY: frame is a live cache page; the requester is
                // parked, keeping its buffer alive.
                unsafe {
                    let page_ptr = frame as *mut u8;
                    if request.rw {
                        core::ptr::copy_nonoverlapping(
                            request.buffer.0.add(span.buf_offset),
                            page_ptr.add(span.page_offset),
                            span.len,
                        );
                    } else {
                        core::ptr::copy_nonoverlapping(
                            page_ptr.add(span.page_offset),
                            request.buffer.0.add(span.buf_offset),
                            span.len,
                        );
                    }
                }

                if request.rw {
                    // Write-back of the modified page; an error reaches the
                    // requester, the cached copy stays authoritative.
                    if let Err(code) = self.flush_page(span.page) {
                        request.error.store(code, Ordering::Release);
                    }
                }
            }
        }

        log::trace!(
            target: "cache",
            "{}: request {} done (page {:#x}, rw {})",
            self.device.name(),
            request.id,
            span.page,
            request.rw
        );

        request.done.store(true, Ordering::Release);
        self.wire.arise(evtable::BLOCK_FIN);
    }

    /// Drain this holder's queue (worker loop body).
    pub fn service_pending(&self) -> usize {
        let mut serviced = 0;
        while let Some(request) = self.pop_request() {
            self.service(&request);
            serviced += 1;
        }
        serviced
    }

    /// Flush every dirty page to the device.
    pub fn sync_pages(&self) -> KernelResult<usize> {
        let dirty: Vec<u64> = self.inner.lock().dirty.iter().copied().collect();
        let count = dirty.len();
        for offset in dirty {
            self.flush_page(offset)
                .map_err(|code| KernelError::DeviceError { code })?;
        }
        Ok(count)
    }

    /// Flush dirty pages, then drop every cached frame.
    pub fn free_pages(&self) -> KernelResult<usize> {
        self.sync_pages()?;

        let mut inner = self.inner.lock();
        let entries = inner.pages.entries();
        let count = entries.len();
        for (offset, frame) in entries {
            inner.pages.remove(offset);
            pmm::free(frame, 1);
        }
        Ok(count)
    }

    /// Detach this holder from the sync loop (unmount path).
    pub fn halt_syncing(&self) {
        self.syncing.store(false, Ordering::Release);
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn dirty_pages(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    pub fn pending_requests(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending_reads + inner.pending_writes
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }
}

// ---------------------------------------------------------------------------
// Sync worker
// ---------------------------------------------------------------------------

static CACHES: IrqSpinlock<Vec<Arc<Holder>>> = IrqSpinlock::new(Vec::new());
static SYNCING: AtomicBool = AtomicBool::new(true);

/// Create (and register) the cache holder for a block device.
pub fn create_cache(device: Arc<dyn BlockDevice>) -> Arc<Holder> {
    let holder = Holder::new(device);
    CACHES.lock().push(holder.clone());
    holder
}

/// Stop the sync loop for shutdown; outstanding dirty pages are flushed
/// one last time.
pub fn halt_sync() {
    SYNCING.store(false, Ordering::Release);
}

/// Body of the sync thread: drain every holder's queue, flush dirty
/// pages, sleep briefly when idle.
pub fn sync_worker() {
    while SYNCING.load(Ordering::Acquire) {
        let holders: Vec<Arc<Holder>> = CACHES.lock().clone();

        let mut serviced = 0;
        for holder in &holders {
            if !holder.syncing.load(Ordering::Acquire) {
                continue;
            }
            serviced += holder.service_pending();
            let _ = holder.sync_pages();
        }

        if serviced == 0 {
            sched::sleep(Timespec::from_ms(10));
        }
    }

    for holder in CACHES.lock().iter() {
        let _ = holder.sync_pages();
    }
}

/// Spawn the sync thread at boot.
pub fn init() {
    let thread = crate::sched::task::Thread::new_kernel(sync_worker_entry);
    crate::sched::insert_thread(&thread);
}

fn sync_worker_entry() {
    sync_worker();
    loop {
        sched::retick();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::RamDisk;
    use alloc::string::String;

    /// RamDisk wrapper counting device-level reads.
    struct CountingDisk {
        disk: RamDisk,
        reads: AtomicU64,
    }

    impl CountingDisk {
        fn new(pages: u64) -> Self {
            Self {
                disk: RamDisk::new(String::from("count0"), 512, pages * 8),
                reads: AtomicU64::new(0),
            }
        }
    }

    impl BlockDevice for CountingDisk {
        fn name(&self) -> &str {
            self.disk.name()
        }

        fn block_size(&self) -> usize {
            self.disk.block_size()
        }

        fn block_count(&self) -> u64 {
            self.disk.block_count()
        }

        fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> KernelResult<()> {
            self.reads.fetch_add(1, Ordering::AcqRel);
            self.disk.read_bytes(offset, buf)
        }

        fn write_bytes(&self, offset: u64, buf: &[u8]) -> KernelResult<()> {
            self.disk.write_bytes(offset, buf)
        }
    }

    #[test]
    fn spans_split_on_page_boundaries() {
        // 8 KiB starting mid-page covers three pages.
        let got = spans(0x1234, 8192);
        assert_eq!(got.len(), 3);

        assert_eq!(got[0].page, 0x1000);
        assert_eq!(got[0].page_offset, 0x234);
        assert_eq!(got[0].len, PAGE_SIZE - 0x234);
        assert_eq!(got[0].buf_offset, 0);

        assert_eq!(got[1].page, 0x2000);
        assert_eq!(got[1].page_offset, 0);
        assert_eq!(got[1].len, PAGE_SIZE);

        assert_eq!(got[2].page, 0x3000);
        assert_eq!(got[2].len, 8192 - got[0].len - PAGE_SIZE);

        let total: usize = got.iter().map(|s| s.len).sum();
        assert_eq!(total, 8192);
    }

    #[test]
    fn spans_of_zero_length_are_empty() {
        assert!(spans(0x1000, 0).is_empty());
    }

    #[test]
    fn write_then_read_round_trips_with_one_device_read_per_page() {
        pmm::init_for_tests();

        let disk = Arc::new(CountingDisk::new(16));
        let holder = create_cache(disk.clone());

        let pattern: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        holder
            .write(&pattern, 0x1234)
            .expect("write within the disk");

        let mut back = alloc::vec![0u8; 8192];
        holder
            .read(&mut back, 0x1234)
            .expect("read within the disk");
        assert_eq!(back, pattern);

        // Three covering pages, each fetched exactly once; the read was
        // served entirely from cache.
        assert_eq!(disk.reads.load(Ordering::Acquire), 3);
        assert_eq!(holder.resident_pages(), 3);
    }

    #[test]
    fn resident_writes_mark_dirty_and_sync_flushes() {
        pmm::init_for_tests();

        let disk = Arc::new(RamDisk::new(String::from("ram1"), 512, 64));
        let holder = create_cache(disk.clone());

        // Populate the page, then dirty it with a resident write.
        holder.write(b"first", 0x2000).expect("write in range");
        holder.write(b"second", 0x2000).expect("write in range");
        assert_eq!(holder.dirty_pages(), 1);

        let flushed = holder.sync_pages().expect("device healthy");
        assert_eq!(flushed, 1);
        assert_eq!(holder.dirty_pages(), 0);

        let mut direct = [0u8; 6];
        disk.read_bytes(0x2000, &mut direct).expect("in range");
        assert_eq!(&direct, b"second");
    }

    #[test]
    fn device_errors_reach_the_caller_without_poisoning() {
        pmm::init_for_tests();

        let disk = Arc::new(RamDisk::new(String::from("ram2"), 512, 8));
        let holder = create_cache(disk);

        // Past the end of the 4 KiB device.
        let mut buf = [0u8; 16];
        let err = holder.read(&mut buf, 0x10_0000).expect_err("read off the end");
        assert!(matches!(err, KernelError::DeviceError { .. }));
        assert_eq!(holder.resident_pages(), 0);
    }

    #[test]
    fn free_pages_returns_frames() {
        pmm::init_for_tests();

        let disk = Arc::new(RamDisk::new(String::from("ram3"), 512, 64));
        let holder = create_cache(disk);

        holder.write(b"data", 0).expect("write in range");
        assert_eq!(holder.resident_pages(), 1);

        let dropped = holder.free_pages().expect("flush succeeds");
        assert_eq!(dropped, 1);
        assert_eq!(holder.resident_pages(), 0);
        assert_eq!(holder.dirty_pages(), 0);
    }
}
