//! Synchronization Primitives
//!
//! The kernel's sole locking primitive is the spinlock, in two flavors:
//! `spin::Mutex` for data never touched from interrupt context, and
//! [`IrqSpinlock`] (interrupt-saving) for everything else.

pub mod spinlock;

pub use spinlock::{IrqSpinlock, IrqSpinlockGuard};
