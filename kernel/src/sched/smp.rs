//! Per-CPU scheduler state
//!
//! One [`CpuLocal`] per hardware CPU: the running thread, the idle thread,
//! the stashed kernel/user stack pointers the syscall entry swaps through,
//! and the last TLB generation observed per address space. Each CPU only
//! writes its own slot; cross-CPU reads are for kill/stop synchronization.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::{sched::task::Thread, sync::IrqSpinlock};

/// Upper bound on supported CPUs.
pub const MAX_CPUS: usize = 16;

pub struct CpuLocal {
    pub online: AtomicBool,
    /// Kernel stack the syscall entry switches to.
    pub kstack: AtomicU64,
    /// User stack stashed across the syscall entry.
    pub ustack: AtomicU64,
    pub idle_tid: AtomicI64,
    pub current: IrqSpinlock<Option<Arc<Thread>>>,
    /// Last TLB generation this CPU observed for its active space.
    pub seen_generation: AtomicU64,
}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
            kstack: AtomicU64::new(0),
            ustack: AtomicU64::new(0),
            idle_tid: AtomicI64::new(-1),
            current: IrqSpinlock::new(None),
            seen_generation: AtomicU64::new(0),
        }
    }
}

static CPUS: [CpuLocal; MAX_CPUS] = [const { CpuLocal::new() }; MAX_CPUS];

/// Identifier of the CPU we are running on.
pub fn current_cpu_id() -> usize {
    crate::arch::cpu_id().min(MAX_CPUS - 1)
}

/// This CPU's local block.
pub fn cpu_local() -> &'static CpuLocal {
    &CPUS[current_cpu_id()]
}

pub fn per_cpu(cpu: usize) -> Option<&'static CpuLocal> {
    CPUS.get(cpu)
}

/// Mark this CPU online (bootstrap and AP bring-up).
pub fn mark_online() {
    cpu_local().online.store(true, Ordering::Release);
}

pub fn online_cpus() -> impl Iterator<Item = (usize, &'static CpuLocal)> {
    CPUS.iter()
        .enumerate()
        .filter(|(_, cpu)| cpu.online.load(Ordering::Acquire))
}
