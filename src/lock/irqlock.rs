//! `push_off`/`pop_off`-style nested interrupt disabling, and `IrqLock<T>`,
//! the single-CPU "disable interrupts, touch the data, restore" lock used
//! for the scheduler's ready/sleep/block lists, the page-frame table, and
//! the kernel vmap bitmap (`SPEC_FULL.md` §5).
//!
//! Unlike a cross-CPU spinlock, this never spins: on a single CPU, the only
//! other thing that could touch the protected data is an interrupt handler,
//! and disabling interrupts rules that out completely.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

#[cfg(target_arch = "x86")]
use crate::x86;

/// Nesting depth of `push_off`, and whether interrupts were enabled before
/// the outermost one. Single global because this kernel is UP; a per-CPU
/// version would key this off the current CPU index instead.
struct IrqState {
    depth: u32,
    was_enabled: bool,
}

static mut IRQ_STATE: IrqState = IrqState {
    depth: 0,
    was_enabled: false,
};

/// Disables interrupts, remembering whether they were enabled so a matching
/// `pop_off` can restore the original state. Nested calls only take effect
/// on the outermost `push_off`/innermost `pop_off`, exactly like
/// `intr_off`/`intr_on` would if they were idempotent.
///
/// # Safety
/// Must be paired with exactly one `pop_off` per `push_off`.
#[cfg(target_arch = "x86")]
pub unsafe fn push_off() {
    let was_enabled = unsafe { x86::intr_get() };
    unsafe { x86::intr_off() };
    unsafe {
        if IRQ_STATE.depth == 0 {
            IRQ_STATE.was_enabled = was_enabled;
        }
        IRQ_STATE.depth += 1;
    }
}

/// # Safety
/// Must be paired with a preceding `push_off`.
#[cfg(target_arch = "x86")]
pub unsafe fn pop_off() {
    unsafe {
        debug_assert!(!x86::intr_get(), "pop_off: interruptible");
        assert!(IRQ_STATE.depth >= 1, "pop_off without push_off");
        IRQ_STATE.depth -= 1;
        if IRQ_STATE.depth == 0 && IRQ_STATE.was_enabled {
            x86::intr_on();
        }
    }
}

/// Host test build: tracks nesting depth without touching real interrupt
/// state, so `IrqLock`/`ReentrantMutex` unit tests can exercise the
/// bookkeeping on whatever architecture runs `cargo test`.
#[cfg(not(target_arch = "x86"))]
pub unsafe fn push_off() {
    unsafe { IRQ_STATE.depth += 1 };
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn pop_off() {
    unsafe {
        assert!(IRQ_STATE.depth >= 1, "pop_off without push_off");
        IRQ_STATE.depth -= 1;
    }
}

/// Data protected by disabling interrupts for the duration of each access.
pub struct IrqLock<T> {
    inner: UnsafeCell<T>,
}

// SAFETY: access is only ever granted through `lock()`, which disables
// interrupts for the guard's lifetime; on a single CPU that rules out any
// concurrent access.
unsafe impl<T> Sync for IrqLock<T> {}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> IrqGuard<'_, T> {
        unsafe { push_off() };
        IrqGuard { lock: self }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct IrqGuard<'a, T> {
    lock: &'a IrqLock<T>,
}

impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for IrqGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { pop_off() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_reads_and_writes_through() {
        let l = IrqLock::new(5);
        {
            let mut g = l.lock();
            assert_eq!(*g, 5);
            *g = 9;
        }
        assert_eq!(*l.lock(), 9);
    }

    #[test]
    fn nested_locks_on_distinct_instances_compose() {
        let a = IrqLock::new(1);
        let b = IrqLock::new(2);
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(*ga + *gb, 3);
    }
}
