//! The blocking hook lower layers call through instead of depending on the
//! scheduler directly. A channel is just an opaque key — the address of a
//! buffer, a request id, an inode number — that identifies what a task is
//! waiting for; `sched.rs` implements this trait over its sleep/block lists
//! and the task table. Keeping this as a seam lets L3 (buffer cache, device
//! queue) be built and unit-tested before L6 (the scheduler) exists, the
//! same layering choice `lock::mutex` makes for its own contention path.

pub trait Blocking {
    /// Blocks the calling task until some other task calls `wake` with the
    /// same `channel`. Must be called with interrupts in a state where the
    /// wakeup cannot be missed (the scheduler's concern, not the caller's).
    fn block_on(&mut self, channel: usize);

    /// Wakes every task blocked on `channel`, if any.
    fn wake(&mut self, channel: usize);
}

/// A `Blocking` impl for tests and single-threaded call sites: nothing is
/// ever actually blocked, so `block_on` asserts it is never reached with a
/// nonempty wait (the request queue only reports `must_block` when there is
/// something else that will eventually call `wake`, and in these contexts
/// that never happens within one call).
#[cfg(test)]
pub struct NeverBlocks;

#[cfg(test)]
impl Blocking for NeverBlocks {
    fn block_on(&mut self, _channel: usize) {
        panic!("NeverBlocks::block_on: nothing would ever wake this");
    }

    fn wake(&mut self, _channel: usize) {}
}
