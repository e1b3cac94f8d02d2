//! Scheduler
//!
//! Priority-free round-robin over one global thread table. Each reschedule
//! starts scanning just past the outgoing thread's tid and takes the first
//! Ready or Wait thread it finds, falling back to the per-CPU idle thread.
//! Preemption arrives as a timer IPI: the bootstrap CPU's tick advances the
//! clocks and timers, kicks every other CPU, then reschedules itself.
//!
//! The thread table's lock doubles as the scheduler lock and is the
//! outermost lock of the kernel hierarchy.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

pub mod futex;
pub mod smp;
pub mod task;

use task::{Thread, ThreadState, Tid};

use crate::{
    arch,
    ipc::{evtable, Wire},
    mm::AddressSpace,
    process::Process,
    sync::IrqSpinlock,
    time::Timespec,
};

/// Global thread table, indexed by tid. Slots of dead threads are cleared
/// on reap and reused by growth only; tids are never recycled within a
/// slot's lifetime.
static THREADS: IrqSpinlock<Vec<Option<Arc<Thread>>>> = IrqSpinlock::new(Vec::new());

/// Register a thread and hand it its tid. The thread becomes visible to
/// the picker immediately.
pub fn insert_thread(thread: &Arc<Thread>) -> Tid {
    let mut threads = THREADS.lock();
    let tid = threads.len() as Tid;
    thread.set_tid(tid);
    threads.push(Some(thread.clone()));
    tid
}

/// Drop a thread's table slot.
pub fn remove_thread(tid: Tid) {
    let mut threads = THREADS.lock();
    if let Some(slot) = threads.get_mut(tid as usize) {
        *slot = None;
    }
}

pub fn thread_by_tid(tid: Tid) -> Option<Arc<Thread>> {
    if tid < 0 {
        return None;
    }
    THREADS.lock().get(tid as usize)?.clone()
}

/// The thread running on this CPU.
pub fn current_thread() -> Option<Arc<Thread>> {
    smp::cpu_local().current.lock().clone()
}

/// The process owning the running thread.
pub fn current_process() -> Option<Arc<Process>> {
    current_thread().and_then(|t| t.process())
}

/// Address space of the running thread (boot space when nothing runs yet).
pub fn current_address_space() -> Arc<AddressSpace> {
    match current_thread() {
        Some(thread) => thread.address_space(),
        None => crate::mm::address_space::boot_space(),
    }
}

/// Circular scan from `after + 1`, claiming the first Ready/Wait thread by
/// marking it Running under the table lock.
fn pick_and_claim(after: Tid) -> Option<Arc<Thread>> {
    let threads = THREADS.lock();
    let len = threads.len() as i64;
    if len == 0 {
        return None;
    }

    let idle_tid = smp::cpu_local().idle_tid.load(Ordering::Acquire);
    let start = after + 1;

    for offset in 0..len {
        let tid = (start + offset).rem_euclid(len);
        if tid == idle_tid {
            continue;
        }

        if let Some(Some(candidate)) = threads.get(tid as usize) {
            match candidate.state() {
                ThreadState::Ready | ThreadState::Wait => {
                    candidate.set_state(ThreadState::Running);
                    return Some(candidate.clone());
                }
                _ => {}
            }
        }
    }

    None
}

/// Idle loop for CPUs with nothing to run.
fn idle_main() {
    loop {
        arch::halt_until_interrupt();
    }
}

/// Create and register this CPU's idle thread.
pub fn init_idle() {
    let idle = Thread::new_kernel(idle_main);
    idle.set_state(ThreadState::Blocked);
    let tid = insert_thread(&idle);

    let cpu = smp::cpu_local();
    cpu.idle_tid.store(tid, Ordering::Release);
    *cpu.current.lock() = Some(idle);
    smp::mark_online();
}

/// Bootstrap-CPU scheduler init: syscall MSRs, SSE, idle thread.
pub fn init() {
    arch::init_sse();
    arch::init_syscalls();
    init_idle();
}

/// Application-processor init.
pub fn init_ap() {
    arch::init_syscalls();
    init_idle();
}

/// Save the outgoing thread's context from the interrupt frame, pick the
/// next runnable thread, dispatch its pending signals, and load it. The
/// whole path runs with interrupts off.
pub fn swap_task(frame: &mut arch::IrqFrame) {
    let cpu = smp::cpu_local();
    let outgoing = cpu.current.lock().clone();

    let mut after = -1;
    if let Some(ref current) = outgoing {
        after = current.tid();

        {
            let mut ctx = current.ctx.lock();
            frame.save_into(&mut ctx.regs);
            arch::save_fx(&mut ctx.fx_area);
            ctx.regs.mxcsr = arch::get_mxcsr();
            ctx.regs.fcw = arch::get_fcw();
            ctx.regs.cr3 = arch::read_cr3();
            ctx.kstack = cpu.kstack.load(Ordering::Acquire);
            ctx.ustack = cpu.ustack.load(Ordering::Acquire);
        }

        let now = arch::read_tsc();
        let started = current.started.load(Ordering::Acquire);
        current.stopped.store(now, Ordering::Release);
        current
            .uptime
            .fetch_add(now.saturating_sub(started), Ordering::AcqRel);

        current.cpu.store(-1, Ordering::Release);
        if current.state() == ThreadState::Running
            && current.tid() != cpu.idle_tid.load(Ordering::Acquire)
        {
            current.set_state(ThreadState::Ready);
        }
    }

    // Pick a thread, then let the signal pipeline run against it. A
    // dispatch can take the claimed thread out of the running state again
    // (a stop signal blocks the whole process), in which case the claim
    // is void and the picker runs once more, scanning on past it.
    let next = 'pick: loop {
        let candidate = match pick_and_claim(after) {
            Some(next) => next,
            None => {
                // Nothing runnable: if the outgoing thread may keep
                // running, let it; otherwise fall back to idle.
                match outgoing {
                    Some(ref current)
                        if current.state() == ThreadState::Ready
                            || current.state() == ThreadState::Running =>
                    {
                        current.set_state(ThreadState::Running);
                        current.clone()
                    }
                    _ => {
                        let idle_tid = cpu.idle_tid.load(Ordering::Acquire);
                        match thread_by_tid(idle_tid) {
                            Some(idle) => break 'pick idle,
                            None => return,
                        }
                    }
                }
            }
        };

        if !candidate.is_user() {
            break 'pick candidate;
        }

        // Signals are issued and dispatched on the way back to user mode.
        if let Some(proc) = candidate.process() {
            crate::signal::process_signals(&proc, &candidate);
        }

        if candidate.state() == ThreadState::Running {
            break 'pick candidate;
        }

        after = candidate.tid();
    };

    {
        let ctx = next.ctx.lock();
        frame.load_from(&ctx.regs);
        arch::load_fx(&ctx.fx_area);
        arch::set_mxcsr(ctx.regs.mxcsr);
        arch::set_fcw(ctx.regs.fcw);

        cpu.kstack.store(ctx.kstack, Ordering::Release);
        cpu.ustack.store(ctx.ustack, Ordering::Release);
        arch::set_kernel_stacks(ctx.kstack);
        if next.is_user() {
            arch::set_fs_base(ctx.regs.fs);
            arch::set_user_gs_base(ctx.regs.gs);
        }

        // Reload CR3 when switching spaces, or when a remote unmap bumped
        // the space's generation since this CPU last looked.
        let space = next.address_space();
        let generation = space.generation();
        if arch::read_cr3() != ctx.regs.cr3
            || cpu.seen_generation.swap(generation, Ordering::AcqRel) != generation
        {
            arch::write_cr3(ctx.regs.cr3);
        }
    }

    next.cpu.store(smp::current_cpu_id() as i64, Ordering::Release);
    next.started.store(arch::read_tsc(), Ordering::Release);
    *cpu.current.lock() = Some(next);
}

/// Timer tick on the bootstrap CPU: advance clocks and timers, kick every
/// other CPU, reschedule locally.
pub fn tick_bsp(frame: &mut arch::IrqFrame) {
    crate::time::tick();
    send_ipis();
    swap_task(frame);
}

/// Reschedule IPI handler on application processors.
pub fn tick_ap(frame: &mut arch::IrqFrame) {
    swap_task(frame);
}

/// Ask every other online CPU to reschedule.
pub fn send_ipis() {
    arch::broadcast_reschedule();
}

/// Yield the CPU after putting oneself to sleep: triggers a local
/// reschedule and returns once this thread is picked again.
pub fn retick() {
    arch::reschedule_self();
}

/// Cross-CPU TLB shootdown after an unmap: every CPU reloads CR3 at its
/// next reschedule, which the IPI forces immediately.
pub fn tlb_shootdown() {
    send_ipis();
}

/// Spin until `thread` is off every CPU, kicking its CPU with reschedule
/// IPIs. Callers must have already moved the thread out of the runnable
/// states.
pub fn wait_off_cpu(thread: &Arc<Thread>) {
    while thread.cpu.load(Ordering::Acquire) != -1 {
        send_ipis();
        core::hint::spin_loop();
    }
}

/// Mark a thread Dead and wait for it to leave its CPU. The table slot
/// stays until the owner reaps it.
pub fn kill_thread(thread: &Arc<Thread>) {
    thread.set_state(ThreadState::Dead);
    wait_off_cpu(thread);
}

/// Sleep the calling thread for `spec`, uninterruptibly.
pub fn sleep(spec: Timespec) {
    let wire = Arc::new(Wire::new());
    let _ = wire.wait(evtable::TIME_WAKE, false, Some(spec));
}

/// Sleep, but abort with `Interrupted` when a signal lands.
pub fn sleep_interruptible(spec: Timespec) -> crate::error::KernelResult<()> {
    let wire = Arc::new(Wire::new());
    wire.wait(evtable::TIME_WAKE, true, Some(spec)).map(|_| ())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // The picker is pure table logic; drive it directly. These tests share
    // the global table, so keep them in one case to avoid interleaving.
    #[test]
    fn picker_scans_circularly_and_claims() {
        let t0 = Thread::test_thread();
        let t1 = Thread::test_thread();
        let t2 = Thread::test_thread();

        let tid0 = insert_thread(&t0);
        let tid1 = insert_thread(&t1);
        let tid2 = insert_thread(&t2);

        t0.set_state(ThreadState::Blocked);
        t1.set_state(ThreadState::Ready);
        t2.set_state(ThreadState::Ready);

        // Scan starts after tid0: t1 wins and is claimed Running.
        let picked = pick_and_claim(tid0).expect("a ready thread exists");
        assert_eq!(picked.tid(), tid1);
        assert_eq!(picked.state(), ThreadState::Running);

        // t1 is Running now; next pick from the same point takes t2.
        let picked = pick_and_claim(tid0).expect("t2 is still ready");
        assert_eq!(picked.tid(), tid2);

        // Everyone busy: nothing to claim.
        assert!(pick_and_claim(tid0).is_none());

        // Wait state is as schedulable as Ready, and the scan wraps.
        t0.set_state(ThreadState::Wait);
        let picked = pick_and_claim(tid2).expect("wrap-around reaches t0");
        assert_eq!(picked.tid(), tid0);

        for tid in [tid0, tid1, tid2] {
            remove_thread(tid);
        }
    }
}
