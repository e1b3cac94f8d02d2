//! IRQ-saving spinlock
//!
//! Every lock that can be taken from interrupt context (scheduler, PMM,
//! wires, cache holders) must disable local interrupts for the duration of
//! the critical section, or a timer IRQ arriving mid-section deadlocks on
//! the same CPU. [`IrqSpinlock`] wraps `spin::Mutex` and saves/restores the
//! interrupt flag around the guard's lifetime.
//!
//! Lock hierarchy (outermost first): scheduler < process < process signal <
//! thread signal < wire/queue/trigger < address space < PMM.

use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use spin::{Mutex, MutexGuard};

/// Spinlock that disables local interrupts while held.
pub struct IrqSpinlock<T: ?Sized> {
    inner: Mutex<T>,
}

/// Guard for [`IrqSpinlock`]; releases the lock, then restores the saved
/// interrupt flag. That order is load-bearing: an interrupt taken while
/// the lock word is still set would deadlock against ourselves.
pub struct IrqSpinlockGuard<'a, T: ?Sized> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    were_enabled: bool,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }
}

impl<T: ?Sized> IrqSpinlock<T> {
    /// Disable interrupts, then spin for the lock.
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            disable_interrupts();
        }

        IrqSpinlockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            were_enabled,
        }
    }

    /// Non-blocking acquire; interrupts stay untouched on failure.
    pub fn try_lock(&self) -> Option<IrqSpinlockGuard<'_, T>> {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            disable_interrupts();
        }

        match self.inner.try_lock() {
            Some(guard) => Some(IrqSpinlockGuard {
                guard: ManuallyDrop::new(guard),
                were_enabled,
            }),
            None => {
                if were_enabled {
                    enable_interrupts();
                }
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: ?Sized> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, and never
        // touched again.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn interrupts_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn disable_interrupts() {
    x86_64::instructions::interrupts::disable();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

// Host build (unit tests): no interrupt flag to manage.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn interrupts_enabled() -> bool {
    false
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn disable_interrupts() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn enable_interrupts() {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_data() {
        let lock = IrqSpinlock::new(41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IrqSpinlock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
