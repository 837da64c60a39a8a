//! A mutex, reentrant by holder identity, built over a binary semaphore
//! (`SPEC_FULL.md` §5). Used to serialize the IDE controller and the
//! serial driver, both of which call back into themselves while already
//! holding the lock (an interrupt-completion handler finishing a request
//! the same task issued).
//!
//! This type deliberately does not know about the scheduler: blocking a
//! task and waking its waiters is layered far above synchronization
//! primitives (L6/L7 vs. this module's L-below-everything). A caller
//! contending for the lock is expected to loop: attempt `try_lock`, and on
//! failure, block on some channel until `unlock` wakes it.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::lock::irqlock::{push_off, pop_off};

const NO_HOLDER: u32 = u32::MAX;

struct State {
    holder: u32,
    depth: u32,
}

/// A reentrant mutex. `holder` identifies the owning task (its pid); the
/// same holder may call `try_lock` again without blocking, and must call
/// `unlock` the same number of times to release it.
pub struct ReentrantMutex<T> {
    state: UnsafeCell<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: UnsafeCell::new(State {
                holder: NO_HOLDER,
                depth: 0,
            }),
            data: UnsafeCell::new(value),
        }
    }

    /// Attempts to acquire the lock for `holder`. Succeeds immediately if
    /// unheld or already held by `holder` (incrementing the reentrancy
    /// depth); fails if held by a different holder.
    pub fn try_lock(&self, holder: u32) -> Option<MutexGuard<'_, T>> {
        unsafe { push_off() };
        let state = unsafe { &mut *self.state.get() };
        let acquired = if state.holder == NO_HOLDER {
            state.holder = holder;
            state.depth = 1;
            true
        } else if state.holder == holder {
            state.depth += 1;
            true
        } else {
            false
        };
        unsafe { pop_off() };
        if acquired {
            Some(MutexGuard { lock: self, holder })
        } else {
            None
        }
    }

    fn unlock(&self, holder: u32) {
        unsafe { push_off() };
        let state = unsafe { &mut *self.state.get() };
        assert_eq!(state.holder, holder, "ReentrantMutex::unlock: not the holder");
        state.depth -= 1;
        if state.depth == 0 {
            state.holder = NO_HOLDER;
        }
        unsafe { pop_off() };
    }

    pub fn holder(&self) -> Option<u32> {
        unsafe { push_off() };
        let state = unsafe { &*self.state.get() };
        let holder = if state.holder == NO_HOLDER { None } else { Some(state.holder) };
        unsafe { pop_off() };
        holder
    }
}

pub struct MutexGuard<'a, T> {
    lock: &'a ReentrantMutex<T>,
    holder: u32,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.holder);
    }
}
