//! Synchronization primitives for the single-CPU concurrency model of
//! `SPEC_FULL.md` §5: short critical sections protected purely by disabling
//! maskable interrupts, plus a reentrant mutex (over a binary semaphore)
//! for the two drivers that must serialize longer operations.
//!
//! This is a deliberate simplification of a generic multi-core `Lock<R,
//! T>`/branded-guard hierarchy: the spec is explicit that the kernel is UP
//! and that the scheduler's structures, the page tables, and the frame
//! table are "protected purely by interrupt disabling", not by a
//! cross-CPU spinlock. `IrqLock` is that disable/restore pattern, reentrant
//! across nested critical sections on the same logical CPU.

pub mod irqlock;
pub mod mutex;

pub use irqlock::IrqLock;
pub use mutex::ReentrantMutex;
