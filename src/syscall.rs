//! Syscall numbers and the dispatch gate (`SPEC_FULL.md` §4.9, §6.3).
//!
//! The gate itself — pushing a trap frame, invoking this dispatch, and
//! returning through the shared trampoline — is architecture glue that
//! belongs in `trap.rs` (not yet built). This module is the part of §4.9
//! that's pure kernel logic: the number table and a fixed dispatch `match`
//! over it, the same one-method-per-number shape the teacher's own
//! `syscall` dispatcher uses, just routed through `SyscallArgs` instead of
//! reading a `CurrentProc`'s trap frame directly, since that type doesn't
//! exist in this kernel yet.
//!
//! `dispatch` handles the process/scheduling half (`sysproc.rs`).
//! `dispatch_file` handles the file-system half (`sysfile.rs`) separately,
//! since the two borrow disjoint kernel state (`ProcSyscalls` vs.
//! `FileSyscalls`) — `trap.rs` will try a syscall number against whichever
//! table it belongs to. File syscalls additionally need to move bytes
//! between user virtual addresses and the kernel buffers `sysfile.rs`
//! works in, which `dispatch_file` does itself via the calling task's
//! `AddressSpace`, the same split `exec.rs` keeps between "load an ELF
//! image" and "the bytes come from somewhere else".

use arrayvec::ArrayVec;

use crate::fcntl::{OpenFlags, Whence};
use crate::param::{BSIZE, MAXARG, MAXPATH};
use crate::sysfile::FileSyscalls;
use crate::sysproc::ProcSyscalls;
use crate::wait::Blocking;

pub const SYS_TEST: i32 = 0;
pub const SYS_EXIT: i32 = 1;
pub const SYS_FORK: i32 = 2;
pub const SYS_READ: i32 = 3;
pub const SYS_WRITE: i32 = 4;
pub const SYS_OPEN: i32 = 5;
pub const SYS_CLOSE: i32 = 6;
pub const SYS_WAITPID: i32 = 7;
pub const SYS_CREAT: i32 = 8;
pub const SYS_LINK: i32 = 9;
pub const SYS_UNLINK: i32 = 10;
pub const SYS_EXECVE: i32 = 11;
pub const SYS_CHDIR: i32 = 12;
pub const SYS_TIME: i32 = 13;
pub const SYS_MKNOD: i32 = 14;
pub const SYS_STAT: i32 = 18;
pub const SYS_LSEEK: i32 = 19;
pub const SYS_GETPID: i32 = 20;
pub const SYS_MOUNT: i32 = 21;
pub const SYS_UMOUNT: i32 = 22;
pub const SYS_FSTAT: i32 = 28;
pub const SYS_SYNC: i32 = 36;
pub const SYS_MKDIR: i32 = 39;
pub const SYS_RMDIR: i32 = 40;
pub const SYS_DUP: i32 = 41;
pub const SYS_BRK: i32 = 45;
pub const SYS_UMASK: i32 = 60;
pub const SYS_CHROOT: i32 = 61;
pub const SYS_DUP2: i32 = 63;
pub const SYS_GETPPID: i32 = 64;
pub const SYS_READDIR: i32 = 89;
pub const SYS_MMAP: i32 = 90;
pub const SYS_MUNMAP: i32 = 91;
pub const SYS_YIELD: i32 = 158;
pub const SYS_SLEEP: i32 = 162;
pub const SYS_GETCWD: i32 = 183;
pub const SYS_CLEAR: i32 = 200;
pub const SYS_MKFS: i32 = 201;

/// The universal error sentinel a syscall returns to user space (§6.3).
pub const EOF: i32 = -1;

/// Errno-equivalent kinds, per §7. Most map to `EOF`; `NotSupported` and
/// `SegmentationFault` are the two that don't — an unknown syscall number
/// is a kernel bug (fatal), and an out-of-range user access kills the task.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyscallError {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Exists,
    Busy,
    NoSpace,
    NotSupported,
    SegmentationFault,
}

impl SyscallError {
    pub fn is_fatal(self) -> bool {
        matches!(self, SyscallError::NotSupported | SyscallError::SegmentationFault)
    }
}

/// Fetches a syscall's word-sized arguments from wherever the trap gate
/// saved them. `trap.rs` will implement this over the saved trap frame;
/// this seam lets the dispatch table and the syscalls that don't touch the
/// file system be written and tested before `trap.rs` exists, the same
/// layering `wait::Blocking` and `exec::ExecSource` already use.
pub trait SyscallArgs {
    /// The nth word-sized argument, as a signed integer.
    fn arg_int(&self, n: usize) -> i32;
    /// The nth word-sized argument, as a raw user address.
    fn arg_addr(&self, n: usize) -> usize;
}

/// Syscalls whose full behavior needs only `proc.rs`/`sched.rs`/`vm.rs`.
/// The file-system-backed half (`open`/`read`/`write`/...) is
/// `dispatch_file`, below, since it borrows `FileSyscalls` instead.
pub fn dispatch(num: i32, args: &impl SyscallArgs, ctx: &mut ProcSyscalls<'_>) -> Result<i32, SyscallError> {
    match num {
        SYS_TEST => Ok(0),
        SYS_EXIT => ctx.sys_exit(args.arg_int(0)),
        SYS_FORK => ctx.sys_fork(),
        SYS_WAITPID => ctx.sys_waitpid(args.arg_int(0)).map(|(pid, _)| pid),
        SYS_GETPID => ctx.sys_getpid(),
        SYS_GETPPID => ctx.sys_getppid(),
        SYS_YIELD => ctx.sys_yield(),
        SYS_SLEEP => ctx.sys_sleep(args.arg_int(0)),
        SYS_BRK => ctx.sys_brk(args.arg_addr(0)),
        SYS_TIME => ctx.sys_time(),
        SYS_UMASK => ctx.sys_umask(args.arg_int(0)),
        _ => Err(SyscallError::NotSupported),
    }
}

/// Reads a NUL-terminated path out of `ctx`'s current task's address space
/// at `addr`, into a fixed `MAXPATH`-sized stack buffer. Returns the slice
/// without its terminator.
fn user_path<'b>(ctx: &mut FileSyscalls<'_>, addr: usize, buf: &'b mut [u8; MAXPATH]) -> Result<&'b [u8], SyscallError> {
    let space = ctx.tasks.address_space_mut(ctx.current).ok_or(SyscallError::SegmentationFault)?;
    let len = space.copy_in_str(buf, addr).map_err(|_| SyscallError::SegmentationFault)?;
    Ok(&buf[..len.saturating_sub(1)])
}

/// Stages a `read` through a `BSIZE`-sized kernel buffer, one chunk at a
/// time, copying each chunk out to the user address as it comes back —
/// `sysfile.rs`'s own `FileTable::read` only ever sees kernel memory.
fn copy_read(ctx: &mut FileSyscalls<'_>, fd: i32, addr: usize, count: usize, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
    let mut total = 0usize;
    let mut cursor = addr;
    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(BSIZE);
        let mut staging = [0u8; BSIZE];
        let n = ctx.sys_read(fd, &mut staging[..chunk], blocking)? as usize;
        if n == 0 {
            break;
        }
        let space = ctx.tasks.address_space_mut(ctx.current).ok_or(SyscallError::SegmentationFault)?;
        space.copy_out_bytes(cursor, &staging[..n]).map_err(|_| SyscallError::SegmentationFault)?;
        total += n;
        cursor += n;
        remaining -= n;
        if n < chunk {
            break;
        }
    }
    Ok(total as i32)
}

/// The `write` counterpart of `copy_read`: copies each chunk in from the
/// user address before handing it to `FileTable::write`.
fn copy_write(ctx: &mut FileSyscalls<'_>, fd: i32, addr: usize, count: usize, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
    let mut total = 0usize;
    let mut cursor = addr;
    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(BSIZE);
        let mut staging = [0u8; BSIZE];
        {
            let space = ctx.tasks.address_space_mut(ctx.current).ok_or(SyscallError::SegmentationFault)?;
            space.copy_in_bytes(&mut staging[..chunk], cursor).map_err(|_| SyscallError::SegmentationFault)?;
        }
        let n = ctx.sys_write(fd, &staging[..chunk], blocking)? as usize;
        total += n;
        cursor += n;
        remaining -= n;
        if n < chunk {
            break;
        }
    }
    Ok(total as i32)
}

/// Serializes a `Stat` into the fixed wire layout user space reads it in
/// (dev:4, ino:2, kind:1, nlink:1, size:4, mode:2) and copies it out.
fn copy_out_stat(ctx: &mut FileSyscalls<'_>, addr: usize, st: crate::stat::Stat) -> Result<(), SyscallError> {
    let mut bytes = [0u8; 14];
    bytes[0..4].copy_from_slice(&st.dev.to_le_bytes());
    bytes[4..6].copy_from_slice(&st.ino.to_le_bytes());
    bytes[6] = st.kind as u8;
    bytes[7] = st.nlink;
    bytes[8..12].copy_from_slice(&st.size.to_le_bytes());
    bytes[12..14].copy_from_slice(&st.mode.to_le_bytes());
    let space = ctx.tasks.address_space_mut(ctx.current).ok_or(SyscallError::SegmentationFault)?;
    space.copy_out_bytes(addr, &bytes).map_err(|_| SyscallError::SegmentationFault)
}

/// The file-system half of §4.9's dispatch table: `open`/`close`/`read`/
/// `write`/`link`/`unlink`/`mkdir`/`rmdir`/`mknod`/`creat`/`stat`/`fstat`/
/// `lseek`/`dup`/`dup2`/`chdir`/`chroot`/`mount`/`umount`/`sync`/`readdir`/
/// `getcwd`/`mkfs`/`clear`/`mmap`/`munmap`.
pub fn dispatch_file(num: i32, args: &impl SyscallArgs, ctx: &mut FileSyscalls<'_>, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
    match num {
        SYS_OPEN => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            let flags = OpenFlags::from_bits_truncate(args.arg_int(1));
            let mode = args.arg_int(2) as u16;
            ctx.sys_open(path, flags, mode, blocking)
        }
        SYS_CREAT => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            let mode = args.arg_int(1) as u16;
            ctx.sys_open(path, OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::TRUNC, mode, blocking)
        }
        SYS_CLOSE => ctx.sys_close(args.arg_int(0), blocking),
        SYS_READ => copy_read(ctx, args.arg_int(0), args.arg_addr(1), args.arg_int(2).max(0) as usize, blocking),
        SYS_WRITE => copy_write(ctx, args.arg_int(0), args.arg_addr(1), args.arg_int(2).max(0) as usize, blocking),
        SYS_LINK => {
            let mut a = [0u8; MAXPATH];
            let mut b = [0u8; MAXPATH];
            let existing_addr = args.arg_addr(0);
            let new_addr = args.arg_addr(1);
            let existing_len = user_path(ctx, existing_addr, &mut a)?.len();
            let new_len = user_path(ctx, new_addr, &mut b)?.len();
            ctx.sys_link(&a[..existing_len], &b[..new_len], blocking)
        }
        SYS_UNLINK => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            ctx.sys_unlink(path, blocking)
        }
        SYS_CHDIR => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            ctx.sys_chdir(path, blocking)
        }
        SYS_MKNOD => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            let dev = args.arg_int(1) as u32;
            let mode = args.arg_int(2) as u16;
            ctx.sys_mknod(path, dev, mode, blocking)
        }
        SYS_STAT => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            let st = ctx.sys_stat(path, blocking)?;
            copy_out_stat(ctx, args.arg_addr(1), st)?;
            Ok(0)
        }
        SYS_FSTAT => {
            let st = ctx.sys_fstat(args.arg_int(0))?;
            copy_out_stat(ctx, args.arg_addr(1), st)?;
            Ok(0)
        }
        SYS_LSEEK => {
            let whence = Whence::from_i32(args.arg_int(2)).ok_or(SyscallError::InvalidArgument)?;
            ctx.sys_lseek(args.arg_int(0), args.arg_int(1), whence)
        }
        SYS_MOUNT => {
            let dev = args.arg_int(0) as u32;
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(1), &mut buf)?;
            ctx.sys_mount(dev, path, blocking)
        }
        SYS_UMOUNT => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            ctx.sys_umount(path, blocking)
        }
        SYS_MKDIR => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            let mode = args.arg_int(1) as u16;
            ctx.sys_mkdir(path, mode, blocking)
        }
        SYS_RMDIR => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            ctx.sys_rmdir(path, blocking)
        }
        SYS_DUP => ctx.sys_dup(args.arg_int(0)),
        SYS_DUP2 => ctx.sys_dup2(args.arg_int(0), args.arg_int(1), blocking),
        SYS_SYNC => ctx.sys_sync(blocking),
        SYS_CHROOT => {
            let mut buf = [0u8; MAXPATH];
            let path = user_path(ctx, args.arg_addr(0), &mut buf)?;
            ctx.sys_chroot(path, blocking)
        }
        SYS_READDIR => {
            let mut staging = [0u8; crate::fs::layout::DirEntry::SIZE];
            let n = ctx.sys_readdir(args.arg_int(0), &mut staging, blocking)?;
            if n > 0 {
                let space = ctx.tasks.address_space_mut(ctx.current).ok_or(SyscallError::SegmentationFault)?;
                space.copy_out_bytes(args.arg_addr(1), &staging[..n as usize]).map_err(|_| SyscallError::SegmentationFault)?;
            }
            Ok(n)
        }
        SYS_GETCWD => {
            let maxlen = (args.arg_int(1).max(0) as usize).min(MAXPATH);
            let mut staging = [0u8; MAXPATH];
            let n = ctx.sys_getcwd(&mut staging[..maxlen], blocking)?;
            let space = ctx.tasks.address_space_mut(ctx.current).ok_or(SyscallError::SegmentationFault)?;
            space.copy_out_bytes(args.arg_addr(0), &staging[..n as usize]).map_err(|_| SyscallError::SegmentationFault)?;
            Ok(n)
        }
        SYS_MKFS => ctx.sys_mkfs(args.arg_int(0) as u32, args.arg_int(1), blocking),
        SYS_CLEAR => ctx.sys_clear(args.arg_int(0)),
        SYS_MMAP => ctx.sys_mmap(
            args.arg_addr(0),
            args.arg_int(1).max(0) as usize,
            args.arg_int(2) != 0,
            args.arg_int(3) != 0,
            args.arg_int(4),
            blocking,
        ),
        SYS_MUNMAP => ctx.sys_munmap(args.arg_addr(0), args.arg_int(1).max(0) as usize),
        // SYS_EXECVE isn't handled here: a successful `execve` doesn't
        // return an `i32` to place in `eax`, it replaces the calling
        // task's entire register frame, which only the trap gate that
        // owns that frame can do. `dispatch_execve`, below, is the real
        // entry point `trap.rs`'s syscall path calls for this one number
        // instead of `dispatch_file`.
        _ => Err(SyscallError::NotSupported),
    }
}

/// True if `num` is one of `dispatch_file`'s (or [`dispatch_execve`]'s)
/// syscall numbers rather than `dispatch`'s — the routing decision
/// `trap.rs` needs before it knows which borrowed kernel-state bundle to
/// build for a given trap, since `ProcSyscalls` and `FileSyscalls` borrow
/// the task table and page-frame allocator in ways that can't coexist.
pub fn is_file_syscall(num: i32) -> bool {
    matches!(
        num,
        SYS_OPEN
            | SYS_CREAT
            | SYS_CLOSE
            | SYS_READ
            | SYS_WRITE
            | SYS_LINK
            | SYS_UNLINK
            | SYS_CHDIR
            | SYS_MKNOD
            | SYS_STAT
            | SYS_FSTAT
            | SYS_LSEEK
            | SYS_MOUNT
            | SYS_UMOUNT
            | SYS_MKDIR
            | SYS_RMDIR
            | SYS_DUP
            | SYS_DUP2
            | SYS_SYNC
            | SYS_CHROOT
            | SYS_READDIR
            | SYS_GETCWD
            | SYS_MKFS
            | SYS_CLEAR
            | SYS_MMAP
            | SYS_MUNMAP
            | SYS_EXECVE
    )
}

/// Walks a NUL-terminated, `MAXARG`-capped array of user pointers at `addr`
/// (`execve`'s `argv`/`envp`) into owned argument bytes in `storage`,
/// reusing `user_path`'s per-string copy and NUL-stripping since libc's
/// `argv`/`envp` entries are the same kind of string a path is.
fn user_arg_vector<'b>(
    ctx: &mut FileSyscalls<'_>,
    addr: usize,
    storage: &'b mut [[u8; MAXPATH]; MAXARG],
) -> Result<ArrayVec<&'b [u8], MAXARG>, SyscallError> {
    let mut ptrs = ArrayVec::<usize, MAXARG>::new();
    for i in 0..MAXARG {
        let mut word = [0u8; 4];
        let space = ctx.tasks.address_space_mut(ctx.current).ok_or(SyscallError::SegmentationFault)?;
        space.copy_in_bytes(&mut word, addr + i * 4).map_err(|_| SyscallError::SegmentationFault)?;
        let ptr = u32::from_ne_bytes(word) as usize;
        if ptr == 0 {
            break;
        }
        ptrs.push(ptr);
    }

    let mut out = ArrayVec::<&'b [u8], MAXARG>::new();
    for (slot, &ptr) in storage.iter_mut().zip(ptrs.iter()) {
        out.push(user_path(ctx, ptr, slot)?);
    }
    Ok(out)
}

/// The real entry point for `SYS_EXECVE`: copies in the path and the
/// `argv`/`envp` pointer arrays, then runs the fs/memory side of the swap.
/// Returns the new image for the caller to forge the task's register frame
/// from (`trap::TrapFrame::forge_execve_entry`) — this function never
/// touches the trap frame itself, keeping the same split `sysfile.rs`'s own
/// `sys_execve` draws between "build the new image" and "swap it in".
pub fn dispatch_execve(
    args: &impl SyscallArgs,
    ctx: &mut FileSyscalls<'_>,
    blocking: &mut impl Blocking,
) -> Result<crate::exec::ExecImage, SyscallError> {
    let mut path_buf = [0u8; MAXPATH];
    let path_len = user_path(ctx, args.arg_addr(0), &mut path_buf)?.len();

    let mut argv_storage: [[u8; MAXPATH]; MAXARG] = [[0; MAXPATH]; MAXARG];
    let mut envp_storage: [[u8; MAXPATH]; MAXARG] = [[0; MAXPATH]; MAXARG];
    let argv = user_arg_vector(ctx, args.arg_addr(1), &mut argv_storage)?;
    let envp = user_arg_vector(ctx, args.arg_addr(2), &mut envp_storage)?;

    ctx.sys_execve(&path_buf[..path_len], &argv, &envp, blocking)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::PageFrameAllocator;
    use crate::proc::{TaskTable, INIT_PID};
    use crate::sched::Scheduler;

    struct FixedArgs(pub [usize; 4]);

    impl SyscallArgs for FixedArgs {
        fn arg_int(&self, n: usize) -> i32 {
            self.0[n] as i32
        }
        fn arg_addr(&self, n: usize) -> usize {
            self.0[n]
        }
    }

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
    fn test_syscall_always_succeeds() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(dispatch(SYS_TEST, &FixedArgs([0; 4]), &mut ctx), Ok(0));
    }

    #[test]
    fn getpid_returns_the_calling_tasks_pid() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(dispatch(SYS_GETPID, &FixedArgs([0; 4]), &mut ctx), Ok(INIT_PID));
    }

    #[test]
    fn unknown_syscall_number_is_fatal() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        let err = dispatch(9999, &FixedArgs([0; 4]), &mut ctx).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn sleep_rejects_a_negative_argument() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        let err = dispatch(SYS_SLEEP, &FixedArgs([usize::MAX, 0, 0, 0]), &mut ctx).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err, SyscallError::InvalidArgument);
    }

    #[test]
    fn umask_and_time_are_wired_into_the_process_dispatch_table() {
        let (mut tasks, mut scheduler, mut frames) = setup();
        scheduler.tick();
        let mut ctx = ProcSyscalls {
            tasks: &mut tasks,
            scheduler: &mut scheduler,
            frames: &mut frames,
            current: INIT_PID,
        };
        assert_eq!(dispatch(SYS_TIME, &FixedArgs([0; 4]), &mut ctx), Ok(1));
        assert_eq!(dispatch(SYS_UMASK, &FixedArgs([0o777, 0, 0, 0]), &mut ctx), Ok(0o022));
    }
}
