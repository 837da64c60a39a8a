//! `sys_*` handlers for the process/scheduling half of `syscall.rs`'s
//! dispatch table (`SPEC_FULL.md` §4.9): exit, fork, wait, getpid, getppid,
//! yield, sleep, brk. Everything that touches `fs/` (`open`/`read`/`write`/
//! ...) lives in `sysfile.rs` instead.
//!
//! Grounded on the teacher's older, simpler `sysproc.rs` (one method per
//! syscall directly on a kernel-context type, `usize::MAX`-as-error
//! sentinel) rather than its later `fs`/`TrapFrameManager`-dependent
//! version, since this layer only needs `proc.rs`/`sched.rs`/`vm.rs`.
//! `usize::MAX` becomes `syscall::EOF` here to match this kernel's signed
//! `i32` return convention (§6.3/§7) instead of the teacher's unsigned one.

use crate::kalloc::PageFrameAllocator;
use crate::proc::{Pid, TaskTable};
use crate::sched::Scheduler;
use crate::syscall::SyscallError;

/// Borrows the three tables a process/scheduling syscall needs, for the
/// duration of a single `dispatch` call. `current` is the calling task's
/// pid, supplied by whatever resolves "the process that trapped in" —
/// `trap.rs`'s job once it exists.
pub struct ProcSyscalls<'a> {
    pub tasks: &'a mut TaskTable,
    pub scheduler: &'a mut Scheduler,
    pub frames: &'a mut PageFrameAllocator,
    pub current: Pid,
}

impl<'a> ProcSyscalls<'a> {
    /// Never returns to the caller in a real trap (the task is Died and the
    /// scheduler has moved on to someone else), but still has an `i32`
    /// return type so it fits `syscall::dispatch`'s uniform signature.
    ///
    /// Only tears down scheduling state — the caller must run
    /// `sysfile::FileSyscalls::sys_exit_fs` on the same pid first to
    /// release its open fds and cwd/root inode pins, since this type
    /// doesn't borrow `fs`/`file` state.
    pub fn sys_exit(&mut self, status: i32) -> Result<i32, SyscallError> {
        self.tasks.exit(self.scheduler, self.frames, self.current, status);
        self.scheduler.schedule();
        Ok(0)
    }

    pub fn sys_fork(&mut self) -> Result<i32, SyscallError> {
        self.tasks
            .fork(self.scheduler, self.frames, self.current)
            .ok_or(SyscallError::NoSpace)
    }

    /// Returns `(reaped_pid, exit_status)`; copying `exit_status` out to the
    /// caller's `status` pointer is `trap.rs`'s job once a real user-memory
    /// copy path is wired to the trapping task's address space.
    pub fn sys_waitpid(&mut self, pid: i32) -> Result<(i32, i32), SyscallError> {
        let mut status = 0;
        let reaped = self.tasks.waitpid(self.scheduler, self.current, pid, &mut status);
        if reaped < 0 {
            Err(SyscallError::NotFound)
        } else {
            Ok((reaped, status))
        }
    }

    pub fn sys_wait(&mut self) -> Result<(i32, i32), SyscallError> {
        self.sys_waitpid(crate::proc::ANY_CHILD)
    }

    pub fn sys_getpid(&mut self) -> Result<i32, SyscallError> {
        Ok(self.tasks.get(self.current).pid)
    }

    pub fn sys_getppid(&mut self) -> Result<i32, SyscallError> {
        Ok(self.tasks.get(self.current).ppid)
    }

    pub fn sys_yield(&mut self) -> Result<i32, SyscallError> {
        self.scheduler.yield_now();
        Ok(0)
    }

    /// `sched::Scheduler::sleep` already takes milliseconds, so the
    /// argument is passed straight through with no further unit conversion.
    pub fn sys_sleep(&mut self, ms: i32) -> Result<i32, SyscallError> {
        if ms < 0 {
            return Err(SyscallError::InvalidArgument);
        }
        self.scheduler.sleep(ms as u64);
        Ok(0)
    }

    pub fn sys_brk(&mut self, addr: usize) -> Result<i32, SyscallError> {
        let address_space = self
            .tasks
            .address_space_mut(self.current)
            .ok_or(SyscallError::InvalidArgument)?;
        address_space
            .sys_brk(self.frames, addr)
            .map(|new_brk| new_brk as i32)
            .map_err(|()| SyscallError::NoSpace)
    }

    /// Ticks since boot, the same counter `sched::Scheduler` uses for
    /// wakeup/timeslice bookkeeping — this kernel has no wall clock, so
    /// `time` is this uptime rather than seconds since the epoch.
    pub fn sys_time(&mut self) -> Result<i32, SyscallError> {
        Ok(self.scheduler.ticks() as i32)
    }

    /// Sets the calling task's creation-mask, returning the previous value
    /// (POSIX `umask(2)` semantics). Only the low 9 permission bits apply.
    /// `fs/dir.rs`'s `mkdir`/`creat` don't consult it yet — every caller so
    /// far has passed an already-masked mode directly.
    pub fn sys_umask(&mut self, mask: i32) -> Result<i32, SyscallError> {
        let task = self.tasks.get_mut(self.current);
        let old = task.umask as i32;
        task.umask = (mask & 0o777) as u16;
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::INIT_PID;

    fn setup() -> (TaskTable, Scheduler, PageFrameAllocator) {
        let mut tasks = TaskTable::new();
        let mut scheduler = Scheduler::new();
        let frames = PageFrameAllocator::new();
        tasks.debug_spawn_for_test(INIT_PID, 0);
        scheduler.spawn_at(INIT_PID as crate::sched::TaskId, 0);
        scheduler.schedule();
        (tasks, scheduler, frames)
    }

    #[test]
    fn getpid_and_getppid_read_the_calling_tasks_fields() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(ctx.sys_getpid(), Ok(INIT_PID));
        assert_eq!(ctx.sys_getppid(), Ok(0));
    }

    #[test]
    fn sleep_rejects_a_negative_duration() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(ctx.sys_sleep(-1), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn waitpid_with_no_children_reports_not_found() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(ctx.sys_waitpid(crate::proc::ANY_CHILD), Err(SyscallError::NotFound));
    }

    #[test]
    fn yield_reschedules_without_error() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(ctx.sys_yield(), Ok(0));
    }

    #[test]
    fn umask_sets_the_new_mask_and_returns_the_old_one() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(ctx.sys_umask(0o777), Ok(0o022));
        assert_eq!(ctx.sys_umask(0o022), Ok(0o777));
    }

    #[test]
    fn time_reports_the_schedulers_tick_count() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        scheduler.tick();
        scheduler.tick();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(ctx.sys_time(), Ok(2));
    }
}
