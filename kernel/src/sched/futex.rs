//! Futexes keyed on physical addresses
//!
//! The user virtual address is resolved through the caller's address
//! space, so the same shared frame mapped at different addresses (or in
//! different processes) aliases to one futex. Records are created lazily
//! on the first WAIT and destroyed by WAKE.

use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicI32, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    ipc::{Trigger, WaitQueue},
    mm, sched,
    sync::IrqSpinlock,
    time::Timespec,
};

pub const FUTEX_WAIT: usize = 0;
pub const FUTEX_WAKE: usize = 1;

struct Futex {
    /// 1 while armed; cleared by wake so woken waiters can leave the loop.
    locked: AtomicI32,
    waitq: Arc<WaitQueue>,
    trigger: Arc<Trigger>,
}

impl Futex {
    fn new() -> Arc<Self> {
        let waitq = Arc::new(WaitQueue::new());
        let trigger = Trigger::new();
        trigger.add(waitq.clone());
        Arc::new(Self {
            locked: AtomicI32::new(0),
            waitq,
            trigger,
        })
    }
}

static FUTEX_TABLE: IrqSpinlock<BTreeMap<u64, Arc<Futex>>> = IrqSpinlock::new(BTreeMap::new());

/// Resolve `vaddr` in the current address space to the physical futex key.
fn resolve_key(vaddr: u64) -> KernelResult<u64> {
    if vaddr % 4 != 0 {
        return Err(KernelError::InvalidArgument);
    }

    let space = sched::current_address_space();
    space
        .resolve(vaddr)
        .ok_or(KernelError::UnmappedMemory {
            addr: vaddr as usize,
        })
}

/// Read the futex word through the direct physical window.
fn read_word(paddr: u64) -> u32 {
    // SAFETY: paddr came from a live translation and the direct window
    // covers all of physical memory.
    unsafe { core::ptr::read_volatile(mm::phys_to_virt(paddr) as *const u32) }
}

/// FUTEX_WAIT: block until a wake on the same physical word, provided the
/// word still holds `expected`. A timeout wakes with no waker recorded.
pub fn wait(vaddr: u64, expected: u32, timeout: Option<Timespec>) -> KernelResult<()> {
    let thread = sched::current_thread().ok_or(KernelError::InvalidArgument)?;
    let paddr = resolve_key(vaddr)?;

    if read_word(paddr) != expected {
        return Err(KernelError::WouldBlock);
    }

    let futex = {
        let mut table = FUTEX_TABLE.lock();
        table.entry(paddr).or_insert_with(Futex::new).clone()
    };

    if let Some(spec) = timeout {
        futex.waitq.set_timer(spec);
    }

    futex.locked.store(1, Ordering::Release);
    loop {
        if futex.locked.load(Ordering::Acquire) == 0 {
            return Ok(());
        }

        let waker = futex.waitq.block(&thread)?;
        if waker.is_none() && futex.locked.load(Ordering::Acquire) != 0 {
            // Timer fired before any wake.
            return Err(KernelError::WouldBlock);
        }
    }
}

/// FUTEX_WAKE: wake every waiter on the word and drop the record.
pub fn wake(vaddr: u64) -> KernelResult<usize> {
    let paddr = resolve_key(vaddr)?;

    let futex = FUTEX_TABLE.lock().remove(&paddr);
    let Some(futex) = futex else {
        return Ok(0);
    };

    let woken = futex.waitq.waiter_count();
    futex.locked.store(0, Ordering::Release);
    futex.trigger.arise(sched::current_thread());
    Ok(woken)
}

/// Entry point used by the futex syscall.
pub fn do_futex(
    vaddr: u64,
    op: usize,
    expected: u32,
    timeout: Option<Timespec>,
) -> KernelResult<usize> {
    match op {
        FUTEX_WAIT => wait(vaddr, expected, timeout).map(|_| 0),
        FUTEX_WAKE => wake(vaddr),
        _ => Err(KernelError::InvalidArgument),
    }
}
