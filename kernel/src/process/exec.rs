//! execve(2)
//!
//! Replaces the calling process's image: every other thread is killed
//! synchronously, CLOEXEC descriptors close, caught signal dispositions
//! reset to default, and the address space is swapped for a fresh one the
//! external ELF loader has populated via FIXED mappings. The calling
//! thread survives as the main thread and resumes at the new entry point
//! with a demand-paged stack carrying argv/envp/auxv.

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    mm::{self, AddressSpace, MapFlags},
    process::{env::LoadedImage, Process},
    sched::{
        self,
        task::{RegFrame, Thread},
    },
};
use core::sync::atomic::Ordering;

/// Top of the initial user stack.
pub const USER_STACK_TOP: u64 = 0x7FFF_FF00_0000;

/// The external ELF loader: reads `path`, places segments into the given
/// address space with `map(.. | FIXED)`, and reports the image geometry.
pub type ElfLoader = fn(&str, &Arc<AddressSpace>) -> KernelResult<LoadedImage>;

static LOADER: spin::Once<ElfLoader> = spin::Once::new();

/// Register the loader collaborator at boot.
pub fn register_loader(loader: ElfLoader) {
    LOADER.call_once(|| loader);
}

/// Replace `proc`'s image with `path`. `caller` must be the thread
/// executing the syscall.
pub fn execve(
    proc: &Arc<Process>,
    caller: &Arc<Thread>,
    path: &str,
    argv: Vec<String>,
    envp: Vec<String>,
) -> KernelResult<()> {
    let loader = LOADER.get().ok_or(KernelError::InvalidArgument)?;

    // Build the new image first; a load failure must leave the old image
    // intact.
    let space = AddressSpace::new();
    let image = loader(path, &space)?;

    // Point of no return: kill every sibling thread.
    let siblings: Vec<Arc<Thread>> = proc.threads.lock().iter().flatten().cloned().collect();
    for thread in &siblings {
        if Arc::ptr_eq(thread, caller) {
            continue;
        }
        sched::kill_thread(thread);
        sched::remove_thread(thread.tid());
        thread.detach_process();
    }
    {
        let mut table = proc.threads.lock();
        table.retain(|slot| slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, caller)));
    }
    proc.set_main_thread(caller);

    proc.fds.lock().close_cloexec();
    proc.reset_caught_sigactions();
    proc.sigenter_rip.store(0, Ordering::Release);

    // Swap spaces; the old one dies with its last Arc.
    let old_space = proc.address_space();
    proc.set_address_space(space.clone());
    old_space.clear_user();
    drop(old_space);

    // Demand-paged stack, then parameters per the POSIX layout.
    let stack_base = USER_STACK_TOP - mm::USER_STACK_SIZE as u64;
    space.map(
        Some(stack_base),
        mm::USER_STACK_SIZE,
        MapFlags::READ | MapFlags::WRITE | MapFlags::USER | MapFlags::DEMAND,
    )?;

    let rsp = {
        let mut env = proc.env.lock();
        env.file_path = String::from(path);
        env.image = image;
        env.argv = argv;
        env.envp = envp;
        env.is_loaded = true;
        env.place_params(&space, USER_STACK_TOP)?
    };

    // Reset the calling thread to the fresh image.
    {
        let mut ctx = caller.ctx.lock();
        let mut regs = RegFrame::user_defaults();
        regs.rip = image.entry;
        regs.rsp = rsp;
        regs.cr3 = space.root_phys();
        ctx.regs = regs;
        ctx.ustack = rsp;
        ctx.fx_area = crate::sched::task::FxArea::zeroed();
    }

    *proc.name.lock() = String::from(path);
    proc.did_exec.store(true, Ordering::Release);

    log::debug!(target: "process", "exec: pid {} -> {}", proc.pid(), path);

    Ok(())
}
