//! Multi-waiter blocking: wait queues and triggers
//!
//! A [`WaitQueue`] parks any number of threads; a [`Trigger`] fans a single
//! arise out to every queue attached to it, recording the waker so each
//! unblocked thread learns who woke it. Producer/consumer pairs (waitpid,
//! futexes, pipes) hang one trigger on the producer side and block on the
//! consumer side.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    sched::{
        self,
        task::{Thread, ThreadState},
    },
    sync::IrqSpinlock,
    time::{self, Timespec},
};

struct WaitQueueInner {
    waiters: Vec<Arc<Thread>>,
    last_waker: Option<Arc<Thread>>,
    /// A timer expired with nobody enrolled; the next block consumes it
    /// instead of sleeping past its deadline.
    timer_fired: bool,
}

pub struct WaitQueue {
    inner: IrqSpinlock<WaitQueueInner>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(WaitQueueInner {
                waiters: Vec::new(),
                last_waker: None,
                timer_fired: false,
            }),
        }
    }

    /// Park `thread` on the queue until a trigger attached to it arises.
    ///
    /// Returns the waker recorded by the arise (`None` when the wake came
    /// from a timer). A pending unmasked signal aborts the wait with
    /// [`KernelError::Interrupted`].
    pub fn block(&self, thread: &Arc<Thread>) -> KernelResult<Option<Arc<Thread>>> {
        {
            let mut inner = self.inner.lock();
            if inner.timer_fired {
                // Deadline already passed; report the timer wake.
                inner.timer_fired = false;
                return Ok(None);
            }
            inner.waiters.push(thread.clone());
            thread.set_interruptible(true);
            thread.set_state(ThreadState::Blocked);
        }

        while thread.state() == ThreadState::Blocked {
            sched::retick();
        }

        thread.set_interruptible(false);
        if thread.take_interrupted() {
            let mut inner = self.inner.lock();
            inner.waiters.retain(|w| !Arc::ptr_eq(w, thread));
            return Err(KernelError::Interrupted);
        }

        Ok(self.inner.lock().last_waker.clone())
    }

    /// Arm a timeout: once `spec` elapses, every thread blocked here is
    /// readied with no waker recorded.
    pub fn set_timer(self: &Arc<Self>, spec: Timespec) {
        let trigger = Trigger::new();
        trigger.add(self.clone());
        time::register_timer_trigger(spec, trigger);
    }

    fn wake_all(&self, waker: Option<Arc<Thread>>) {
        let mut inner = self.inner.lock();
        if waker.is_none() && inner.waiters.is_empty() {
            inner.timer_fired = true;
        }
        inner.last_waker = waker;
        for waiter in inner.waiters.drain(..) {
            waiter.set_state(ThreadState::Ready);
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out broadcaster: one arise readies the waiters of every attached
/// queue.
pub struct Trigger {
    queues: IrqSpinlock<Vec<Option<Arc<WaitQueue>>>>,
}

impl Trigger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: IrqSpinlock::new(Vec::new()),
        })
    }

    pub fn add(&self, queue: Arc<WaitQueue>) {
        self.queues.lock().push(Some(queue));
    }

    pub fn remove(&self, queue: &Arc<WaitQueue>) {
        let mut queues = self.queues.lock();
        for slot in queues.iter_mut() {
            if slot.as_ref().is_some_and(|q| Arc::ptr_eq(q, queue)) {
                *slot = None;
                return;
            }
        }
    }

    /// Wake every thread blocked on every attached queue, recording `waker`
    /// as the cause.
    pub fn arise(&self, waker: Option<Arc<Thread>>) {
        let queues = self.queues.lock();
        for queue in queues.iter().flatten() {
            queue.wake_all(waker.clone());
        }
    }

    pub fn clear(&self) {
        self.queues.lock().clear();
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().iter().flatten().count()
    }
}
