//! Kernel time: clocks, timespecs, and wake-up timers
//!
//! The bootstrap CPU's timer interrupt advances both clocks by the tick
//! quantum and decrements every pending [`Timer`]; a timer reaching zero
//! arises `TIME_WAKE` on its wire and is dropped. Everything that sleeps
//! with a deadline (wire waits, futexes, `usleep`) goes through here.

use alloc::{sync::Arc, vec::Vec};
use core::ops::{Add, Sub};

use crate::{
    ipc::{evtable, Trigger, Wire},
    sync::IrqSpinlock,
};

pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const MILLIS_PER_SEC: i64 = 1000;

/// Timer interrupt frequency (ticks per second).
pub const TICK_HZ: i64 = 1000;
/// Nanoseconds added to the clocks per tick.
pub const TICK_NANOS: i64 = NANOS_PER_SEC / TICK_HZ;

pub const CLOCK_REALTIME: usize = 0;
pub const CLOCK_MONOTONIC: usize = 1;

/// POSIX timespec with normalized arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    /// Construct from whole milliseconds.
    pub const fn from_ms(ms: i64) -> Self {
        Self {
            tv_sec: ms / MILLIS_PER_SEC,
            tv_nsec: (ms % MILLIS_PER_SEC) * NANOS_PER_MILLI,
        }
    }

    /// Construct from whole microseconds.
    pub const fn from_us(us: i64) -> Self {
        Self {
            tv_sec: us / 1_000_000,
            tv_nsec: (us % 1_000_000) * 1000,
        }
    }

    pub const fn is_zero(&self) -> bool {
        self.tv_sec == 0 && self.tv_nsec == 0
    }
}

impl Add for Timespec {
    type Output = Timespec;

    fn add(self, other: Timespec) -> Timespec {
        let mut res = Timespec {
            tv_sec: self.tv_sec + other.tv_sec,
            tv_nsec: self.tv_nsec + other.tv_nsec,
        };

        if res.tv_nsec >= NANOS_PER_SEC {
            res.tv_nsec -= NANOS_PER_SEC;
            res.tv_sec += 1;
        }

        res
    }
}

impl Sub for Timespec {
    type Output = Timespec;

    /// Saturating subtraction: never goes below zero.
    fn sub(self, other: Timespec) -> Timespec {
        let mut res = Timespec {
            tv_sec: self.tv_sec - other.tv_sec,
            tv_nsec: self.tv_nsec - other.tv_nsec,
        };

        if res.tv_nsec < 0 {
            res.tv_nsec += NANOS_PER_SEC;
            res.tv_sec -= 1;
        }

        if res.tv_sec < 0 {
            res = Timespec::ZERO;
        }

        res
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.tv_sec, self.tv_nsec).cmp(&(other.tv_sec, other.tv_nsec))
    }
}

/// What a timer wakes when it expires.
enum TimerTarget {
    /// Arise `TIME_WAKE` on a wire.
    Wire(Arc<Wire>),
    /// Arise a trigger with no waker (queue timeouts).
    Trigger(Arc<Trigger>),
}

impl TimerTarget {
    fn fire(&self) {
        match self {
            TimerTarget::Wire(wire) => wire.arise(evtable::TIME_WAKE),
            TimerTarget::Trigger(trigger) => trigger.arise(None),
        }
    }
}

/// A countdown bound to a wake target. When `remaining` hits zero the
/// target fires and the timer is removed.
struct Timer {
    remaining: Timespec,
    target: TimerTarget,
}

static CLOCK_RT: IrqSpinlock<Timespec> = IrqSpinlock::new(Timespec::ZERO);
static CLOCK_MONO: IrqSpinlock<Timespec> = IrqSpinlock::new(Timespec::ZERO);
static TIMERS: IrqSpinlock<Vec<Timer>> = IrqSpinlock::new(Vec::new());

/// Seed the realtime clock (from RTC or boot protocol). Monotonic always
/// starts at zero.
pub fn set_realtime(spec: Timespec) {
    *CLOCK_RT.lock() = spec;
}

pub fn get_clock(which: usize) -> Option<Timespec> {
    match which {
        CLOCK_REALTIME => Some(*CLOCK_RT.lock()),
        CLOCK_MONOTONIC => Some(*CLOCK_MONO.lock()),
        _ => None,
    }
}

pub fn monotonic() -> Timespec {
    *CLOCK_MONO.lock()
}

/// Arm a countdown that arises `TIME_WAKE` on `wire` after `spec` elapses.
pub fn register_timer(spec: Timespec, wire: Arc<Wire>) {
    register(spec, TimerTarget::Wire(wire));
}

/// Arm a countdown that arises `trigger` (with no waker) after `spec`
/// elapses. Used for wait-queue timeouts.
pub fn register_timer_trigger(spec: Timespec, trigger: Arc<Trigger>) {
    register(spec, TimerTarget::Trigger(trigger));
}

fn register(spec: Timespec, target: TimerTarget) {
    if spec.is_zero() {
        target.fire();
        return;
    }

    TIMERS.lock().push(Timer {
        remaining: spec,
        target,
    });
}

/// One tick of the bootstrap CPU's timer interrupt: advance the clocks and
/// fire expired timers. Runs with interrupts off.
pub fn tick() {
    let quantum = Timespec::new(0, TICK_NANOS);

    {
        let mut rt = CLOCK_RT.lock();
        *rt = *rt + quantum;
    }
    {
        let mut mono = CLOCK_MONO.lock();
        *mono = *mono + quantum;
    }

    let mut fired: Vec<Timer> = Vec::new();
    {
        let mut timers = TIMERS.lock();
        let mut i = 0;
        while i < timers.len() {
            timers[i].remaining = timers[i].remaining - quantum;
            if timers[i].remaining.is_zero() {
                fired.push(timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }

    // Fire outside the timer lock: waking may take wire locks.
    for timer in fired {
        timer.target.fire();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn timespec_add_normalizes() {
        let a = Timespec::new(1, 800_000_000);
        let b = Timespec::new(0, 300_000_000);
        assert_eq!(a + b, Timespec::new(2, 100_000_000));
    }

    #[test]
    fn timespec_sub_saturates() {
        let a = Timespec::new(0, 100_000_000);
        let b = Timespec::new(1, 0);
        assert_eq!(a - b, Timespec::ZERO);

        let c = Timespec::new(2, 100_000_000);
        let d = Timespec::new(0, 200_000_000);
        assert_eq!(c - d, Timespec::new(1, 900_000_000));
    }

    #[test]
    fn from_ms_splits_fields() {
        let t = Timespec::from_ms(1500);
        assert_eq!(t.tv_sec, 1);
        assert_eq!(t.tv_nsec, 500 * NANOS_PER_MILLI);
    }

    #[test]
    fn ordering_compares_sec_then_nsec() {
        assert!(Timespec::new(1, 0) > Timespec::new(0, 999_999_999));
        assert!(Timespec::new(1, 1) > Timespec::new(1, 0));
    }
}
