//! Process termination and reaping
//!
//! Exit kills every sibling thread synchronously, gives the user half of
//! the address space back to the PMM through the refcounts, hands children
//! and zombies to the grandparent, posts SIGCHLD, publishes the encoded
//! wait status and arises the parent's wait trigger. The process object
//! itself lingers as a zombie until a waitpid consumes it.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    mm, process,
    process::{wait::WaitStatus, Process},
    sched::{
        self,
        task::{Thread, ThreadState},
    },
    signal,
};

/// Exit the calling process with `code` (exit(2)).
pub fn exit_current(code: i32) -> ! {
    exit_current_status(WaitStatus::Exited(code).encode())
}

/// Exit the calling process with a pre-encoded wait status; also the
/// landing point for fatal signal delivery.
pub fn exit_current_status(status: i64) -> ! {
    let thread = sched::current_thread().expect("exit without a current thread");
    let proc = thread
        .process()
        .expect("exit from a thread without a process");

    kill_process(&proc, Some(&thread), status);

    // This thread is done; give the CPU away for good.
    thread.set_state(ThreadState::Dead);
    loop {
        sched::retick();
    }
}

/// Tear a process down. `survivor` is the calling thread (kept alive as
/// the zombie's main thread); passing `None` kills every thread (used when
/// killing another process outright).
pub fn kill_process(proc: &Arc<Process>, survivor: Option<&Arc<Thread>>, status: i64) {
    if proc.pid() == 0 {
        panic!("init exited with status {status:#x}");
    }

    // Close every descriptor.
    proc.fds.lock().clear();

    // Kill sibling threads synchronously.
    let threads: Vec<Arc<Thread>> = proc.threads.lock().iter().flatten().cloned().collect();
    for thread in &threads {
        if survivor.is_some_and(|s| Arc::ptr_eq(s, thread)) {
            continue;
        }
        sched::kill_thread(thread);
        sched::remove_thread(thread.tid());
        thread.detach_process();
    }

    {
        let mut table = proc.threads.lock();
        for slot in table.iter_mut() {
            let keep = slot
                .as_ref()
                .is_some_and(|t| survivor.is_some_and(|s| Arc::ptr_eq(s, t)));
            if !keep {
                *slot = None;
            }
        }
    }

    if let Some(survivor) = survivor {
        proc.set_main_thread(survivor);
    }

    // Release user memory. Surviving execution continues on the kernel
    // stack with the boot tables.
    let old_space = proc.address_space();
    proc.set_address_space(mm::address_space::boot_space());
    old_space.clear_user();
    drop(old_space);

    let parent = proc.parent();

    // Children and zombies move to our parent (or init when we are a
    // direct child of init that lost its parent).
    let new_guardian = parent
        .clone()
        .or_else(|| process::table::get(0))
        .expect("process table holds init");

    reparent_all(proc, &new_guardian);

    if let Some(parent) = &parent {
        // Our slot in the parent's children becomes a zombie entry.
        if let Some(idx) = parent.find_child(proc) {
            parent.children.lock()[idx] = None;
        }
        parent.zombies.lock().push(Some(proc.clone()));

        let _ = signal::send_process(None, parent, signal::SIGCHLD, None);
    }

    proc.set_status(status);
}

fn reparent_all(proc: &Arc<Process>, guardian: &Arc<Process>) {
    let children: Vec<Arc<Process>> = proc
        .children
        .lock()
        .iter_mut()
        .filter_map(Option::take)
        .collect();
    let zombies: Vec<Arc<Process>> = proc
        .zombies
        .lock()
        .iter_mut()
        .filter_map(Option::take)
        .collect();

    for child in children {
        child.notify_status.clear();
        child.notify_status.add(guardian.waitq.clone());
        child.set_parent(guardian);
        guardian.children.lock().push(Some(child));
    }

    for zombie in zombies {
        zombie.notify_status.clear();
        zombie.notify_status.add(guardian.waitq.clone());
        zombie.set_parent(guardian);
        guardian.zombies.lock().push(Some(zombie));
    }
}

/// Final teardown after a waitpid consumed the zombie: kill the lingering
/// main thread and drop both table slots.
pub fn reap_process(zombie: &Arc<Process>) {
    if let Some(main) = zombie.main_thread() {
        if main.state() != ThreadState::Dead {
            sched::kill_thread(&main);
        }
        sched::remove_thread(main.tid());
        main.detach_process();
    }

    zombie.clear_threads();
    process::table::remove(zombie.pid());
}
