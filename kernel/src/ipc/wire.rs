//! Wire: single-rendezvous event carrier
//!
//! A wire connects any number of sleepers to any number of arisers. A
//! sleeper enrolls itself and blocks; an arise stores the event number and
//! the waker's identity, then readies every enrolled thread. Enrollment is
//! consumed by the arise: a wait that begins after an arise only observes
//! later ones.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    ipc::evtable,
    sched::{self, task::Thread, task::ThreadState},
    sync::IrqSpinlock,
    time::{self, Timespec},
};

struct WireInner {
    waiters: Vec<Arc<Thread>>,
    latest_event: i64,
    latest_waker: Option<Arc<Thread>>,
}

/// See module docs. Cheap to create; embedded in threads, cache holders,
/// and pipes.
pub struct Wire {
    inner: IrqSpinlock<WireInner>,
}

impl Wire {
    pub fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(WireInner {
                waiters: Vec::new(),
                latest_event: 0,
                latest_waker: None,
            }),
        }
    }

    /// Signal `event` on this wire, waking every enrolled sleeper. The
    /// calling thread (if any) is recorded as the waker.
    pub fn arise(&self, event: i64) {
        let waker = sched::current_thread();

        let mut inner = self.inner.lock();
        inner.latest_event = event;
        inner.latest_waker = waker;

        for waiter in inner.waiters.drain(..) {
            waiter.set_state(ThreadState::Ready);
        }
    }

    /// Block until `event` (or `TIME_WAKE` once the timeout elapses, or a
    /// pending signal when `allow_signals`) is arisen on this wire.
    ///
    /// Returns the observed event and the waker that caused it. A signal
    /// interruption yields [`KernelError::Interrupted`].
    pub fn wait(
        self: &Arc<Self>,
        event: i64,
        allow_signals: bool,
        timeout: Option<Timespec>,
    ) -> KernelResult<(i64, Option<Arc<Thread>>)> {
        let Some(thread) = sched::current_thread() else {
            // Nothing to suspend during early boot; report an empty wake.
            return Ok((0, None));
        };

        let mut timer_armed = false;

        loop {
            {
                let mut inner = self.inner.lock();
                inner.waiters.push(thread.clone());
                if allow_signals {
                    thread.set_interruptible(true);
                }
                thread.set_state(ThreadState::Blocked);
            }

            // Arm the deadline only after enrolling, or an immediate expiry
            // could arise before anyone is listening.
            if let Some(spec) = timeout {
                if !timer_armed {
                    time::register_timer(spec, self.clone());
                    timer_armed = true;
                }
            }

            while thread.state() == ThreadState::Blocked {
                sched::retick();
            }

            if allow_signals {
                thread.set_interruptible(false);
                if thread.take_interrupted() {
                    self.unenroll(&thread);
                    return Err(KernelError::Interrupted);
                }
            }

            let (seen, waker) = {
                let inner = self.inner.lock();
                (inner.latest_event, inner.latest_waker.clone())
            };

            if seen == event || seen == evtable::TIME_WAKE {
                return Ok((seen, waker));
            }
            // Someone arose a different event; enroll again and keep
            // sleeping.
        }
    }

    /// Drop a thread from the waiter list (killed or interrupted mid-wait).
    pub fn unenroll(&self, thread: &Arc<Thread>) {
        let mut inner = self.inner.lock();
        inner.waiters.retain(|w| !Arc::ptr_eq(w, thread));
    }

    /// Number of currently enrolled sleepers.
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}
