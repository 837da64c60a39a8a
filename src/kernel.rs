//! Owns one of everything: the global kernel-state bundle every layer
//! below this one takes its collaborators as borrowed arguments instead of
//! holding (`fs/mod.rs`'s own doc comment calls this module out by name as
//! "the only place that actually owns one of everything"), the boot
//! sequence that brings the root file system and `init` up, and the single
//! trap-dispatch function an installed IDT vector calls into.
//!
//! Grounded on the teacher's own `kernel.rs`: one global holding every
//! subsystem, a boot routine that brings each one up in dependency order
//! and falls into the scheduler, and a `MaybeUninit` field for the one
//! piece that can't be built before runtime. The teacher gets away with
//! wrapping every other field in a `const fn`-constructible lock
//! (`Sleepablelock::new`/`Spinlock::new` are both `const fn`); here, only
//! `kalloc::PageFrameAllocator::new` and `slab::SlabAllocator::new` are —
//! `buf::BufCache`, `device::DeviceTable`, `fs::Fs`, `file::FileTable`,
//! `pipe::PipeTable`, `proc::TaskTable`, and `sched::Scheduler` all need a
//! runtime `new()` — so the `MaybeUninit` here wraps the whole bundle
//! rather than one field of it.
//!
//! IDT/GDT/TSS installation and the driver bodies the device table calls
//! through are external collaborators per §1: this module hands the
//! platform's bring-up code a `register_devices` hook to call into them
//! with, and exposes [`handle_trap`] as the single function every
//! installed vector is expected to call.

use core::mem::MaybeUninit;

use crate::buf::BufCache;
use crate::device::DeviceTable;
use crate::exec::ExecImage;
use crate::file::FileTable;
use crate::fs::Fs;
use crate::kalloc::{MemRegion, PageFrameAllocator};
use crate::lock::IrqLock;
use crate::pipe::PipeTable;
use crate::proc::{Pid, TaskTable};
use crate::sched::Scheduler;
use crate::slab::SlabAllocator;
use crate::sysfile::FileSyscalls;
use crate::sysproc::ProcSyscalls;
use crate::syscall::{self, SyscallArgs, SyscallError};
use crate::trap::{self, TrapFrame, TrapKind, IRQ_TIMER};
use crate::vm::FaultOutcome;

/// Every table and allocator this kernel owns exactly one of. Every lower
/// layer borrows pieces of this for the duration of a single call instead
/// of holding a reference to it, so nothing here is `pub` beyond this
/// module except through the borrowed bundles (`ProcSyscalls`,
/// `FileSyscalls`) built from it.
pub struct KernelState {
    frames: PageFrameAllocator,
    slab: SlabAllocator,
    devices: DeviceTable,
    bufs: BufCache,
    scheduler: Scheduler,
    tasks: TaskTable,
    pipes: PipeTable,
    fs: Fs,
    files: FileTable,
}

impl KernelState {
    fn new() -> Self {
        Self {
            frames: PageFrameAllocator::new(),
            slab: SlabAllocator::new(),
            devices: DeviceTable::new(),
            bufs: BufCache::new(),
            scheduler: Scheduler::new(),
            tasks: TaskTable::new(),
            pipes: PipeTable::new(),
            fs: Fs::new(),
            files: FileTable::new(),
        }
    }
}

/// The one kernel-state bundle, written exactly once by [`boot`]. Reached
/// only through the `IrqLock`, so every access is a single-CPU critical
/// section the same way the scheduler's own ready/sleep/block lists are —
/// `slab.rs`'s doc comment promises `SlabAllocator` is "only ever reached
/// through a lock (see `kernel.rs`)"; this is that lock.
static mut KERNEL: MaybeUninit<IrqLock<KernelState>> = MaybeUninit::uninit();

/// Constructs `init` (pid 1) directly and execs `/init` into it. The boot
/// counterpart of `sysfile::FileSyscalls::sys_execve`: every later exec
/// replaces a task that trapped in through a real `TrapFrame`, but `init`
/// has no earlier trap to forge one from, so this caller builds the image
/// and hands it back for the platform's own bootstrap frame to use.
fn bring_up_init(state: &mut KernelState) -> ExecImage {
    let init_pid = state.tasks.create_init(&mut state.scheduler, &mut state.frames);
    let mut fsys = FileSyscalls {
        tasks: &mut state.tasks,
        inodes: &mut state.fs.inodes,
        dentries: &mut state.fs.dentries,
        mounts: &mut state.fs.mounts,
        superblocks: &mut state.fs.superblocks,
        files: &mut state.files,
        pipes: &mut state.pipes,
        bufs: &mut state.bufs,
        devices: &mut state.devices,
        frames: &mut state.frames,
        current: init_pid,
    };
    fsys.sys_execve(b"/init", &[], &[], &mut state.scheduler)
        .expect("/init failed to load during boot")
}

/// Brings the kernel up: page allocator, registered devices, the root file
/// system, then `init`. Mirrors the teacher's `kernel_main` ordering
/// (allocator before anything that allocates, devices before the file
/// system that reads through them, the file system before the first user
/// task that execs out of it).
///
/// # Safety
/// Must be called exactly once, before [`handle_trap`] is ever reached,
/// with a memory map describing memory this kernel may use exclusively —
/// the same contract `kalloc::PageFrameAllocator::init` itself carries —
/// and with `register_devices` registering every device `root_dev` and
/// `/init` need.
pub unsafe fn boot(
    regions: &[MemRegion],
    root_dev: u32,
    register_devices: impl FnOnce(&mut DeviceTable),
) -> ExecImage {
    let mut state = KernelState::new();
    unsafe { state.frames.init(regions) };
    register_devices(&mut state.devices);

    state
        .fs
        .mount_root(root_dev, &mut state.bufs, &mut state.devices, &mut state.scheduler)
        .expect("root file system failed to mount during boot");

    let image = bring_up_init(&mut state);

    unsafe {
        KERNEL.write(IrqLock::new(state));
    }
    image
}

fn kernel() -> &'static IrqLock<KernelState> {
    // SAFETY: only reachable after `boot` has written `KERNEL`, per
    // `boot`'s own contract and `handle_trap`'s doc comment.
    unsafe { KERNEL.assume_init_ref() }
}

/// Installed as the body of every IDT vector's common handler. Classifies
/// the trap and routes it to whichever borrowed kernel-state bundle it
/// needs, under the same `IrqLock` critical section `slab.rs` and
/// `sched.rs`'s own shared state already assume.
///
/// Panics if called before `boot` — the platform only installs the IDT
/// after `boot` returns, so this should never actually happen.
pub fn handle_trap(frame: &mut TrapFrame) {
    let mut guard = kernel().lock();
    dispatch_trap(&mut guard, frame);
}

/// What a routed syscall did to `frame`, so the caller knows whether it
/// still owes `frame` a `set_return`.
enum SyscallOutcome {
    /// Ordinary syscall return value, still needs writing to `eax`.
    Return(i32),
    /// `execve` already rewrote the whole frame; nothing left to do.
    Forged,
}

fn dispatch_trap(state: &mut KernelState, frame: &mut TrapFrame) {
    match trap::classify(frame.trapno) {
        TrapKind::Syscall => {
            if let Some(current) = current_pid(state) {
                dispatch_syscall(state, frame, current);
            }
        }
        TrapKind::PageFault => {
            if let Some(current) = current_pid(state) {
                dispatch_page_fault(state, frame, current);
            }
        }
        TrapKind::Irq(IRQ_TIMER) => {
            if state.scheduler.tick() {
                state.scheduler.schedule();
            }
        }
        // Device IRQs complete through the driver's own interrupt handler
        // and `device::DeviceTable::run_head`, never through this path —
        // §1 keeps drivers external to this crate, and `device.rs`'s own
        // doc comment is explicit that the core never reaches into a
        // driver's state, only the other way around.
        TrapKind::Irq(_) => {}
        TrapKind::Fault => {
            if let Some(current) = current_pid(state) {
                kill_current(state, current, -1);
            }
        }
    }
}

fn current_pid(state: &KernelState) -> Option<Pid> {
    state.scheduler.current().map(|id| id as Pid)
}

fn dispatch_syscall(state: &mut KernelState, frame: &mut TrapFrame, current: Pid) {
    match route_syscall(state, frame, current) {
        Ok(SyscallOutcome::Forged) => {}
        Ok(SyscallOutcome::Return(value)) => frame.set_return(value),
        Err(e) => {
            frame.set_return(syscall::EOF);
            if e.is_fatal() {
                kill_current(state, current, -1);
            }
        }
    }
}

/// `syscall::dispatch`'s own `SYS_WAITPID` arm throws the exit status away
/// (it has nowhere to copy it to, borrowing only `ProcSyscalls`); this is
/// the "real user-memory copy path" `sysproc.rs`'s `sys_waitpid` doc
/// comment says is this module's job to wire up, the same way `execve`
/// needed its own path around `dispatch_file`.
fn dispatch_waitpid(state: &mut KernelState, frame: &TrapFrame, current: Pid) -> Result<i32, SyscallError> {
    let mut psys = ProcSyscalls {
        tasks: &mut state.tasks,
        scheduler: &mut state.scheduler,
        frames: &mut state.frames,
        current,
    };
    let (pid, status) = psys.sys_waitpid(frame.arg_int(0))?;
    let status_addr = frame.arg_addr(1);
    if status_addr != 0 {
        let space = psys.tasks.address_space_mut(current).ok_or(SyscallError::SegmentationFault)?;
        space
            .copy_out_bytes(status_addr, &status.to_le_bytes())
            .map_err(|_| SyscallError::SegmentationFault)?;
    }
    Ok(pid)
}

fn route_syscall(state: &mut KernelState, frame: &mut TrapFrame, current: Pid) -> Result<SyscallOutcome, SyscallError> {
    let num = frame.syscall_num();

    if num == syscall::SYS_WAITPID {
        return dispatch_waitpid(state, frame, current).map(SyscallOutcome::Return);
    }

    if num == syscall::SYS_EXECVE {
        let mut fsys = FileSyscalls {
            tasks: &mut state.tasks,
            inodes: &mut state.fs.inodes,
            dentries: &mut state.fs.dentries,
            mounts: &mut state.fs.mounts,
            superblocks: &mut state.fs.superblocks,
            files: &mut state.files,
            pipes: &mut state.pipes,
            bufs: &mut state.bufs,
            devices: &mut state.devices,
            frames: &mut state.frames,
            current,
        };
        let image = syscall::dispatch_execve(frame, &mut fsys, &mut state.scheduler)?;
        frame.forge_execve_entry(&image);
        return Ok(SyscallOutcome::Forged);
    }

    if syscall::is_file_syscall(num) {
        let mut fsys = FileSyscalls {
            tasks: &mut state.tasks,
            inodes: &mut state.fs.inodes,
            dentries: &mut state.fs.dentries,
            mounts: &mut state.fs.mounts,
            superblocks: &mut state.fs.superblocks,
            files: &mut state.files,
            pipes: &mut state.pipes,
            bufs: &mut state.bufs,
            devices: &mut state.devices,
            frames: &mut state.frames,
            current,
        };
        return syscall::dispatch_file(num, frame, &mut fsys, &mut state.scheduler).map(SyscallOutcome::Return);
    }

    let mut psys = ProcSyscalls {
        tasks: &mut state.tasks,
        scheduler: &mut state.scheduler,
        frames: &mut state.frames,
        current,
    };
    syscall::dispatch(num, frame, &mut psys).map(SyscallOutcome::Return)
}

fn dispatch_page_fault(state: &mut KernelState, frame: &TrapFrame, current: Pid) {
    // SAFETY: only reached from a real page-fault vector, after `cr2` has
    // been latched by the CPU and before anything else overwrites it.
    let fault_va = unsafe { trap::r_cr2() } as usize;
    let error = crate::vm::FaultError::from_bits_truncate(frame.err);
    let is_user = frame.from_user();

    let outcome = match state.tasks.address_space_mut(current) {
        Some(space) => space.handle_fault(&mut state.frames, fault_va, error, is_user),
        None => FaultOutcome::Fatal,
    };
    if outcome == FaultOutcome::Fatal {
        kill_current(state, current, -1);
    }
}

/// Releases `pid`'s fs/file resources, then its scheduling state — the
/// order `sysproc::ProcSyscalls::sys_exit`'s own doc comment requires,
/// since `proc::TaskTable::exit` clears `root_inode`/`cwd_inode`/`fds`
/// unconditionally without releasing what they pin.
fn kill_current(state: &mut KernelState, pid: Pid, status: i32) {
    {
        let mut fsys = FileSyscalls {
            tasks: &mut state.tasks,
            inodes: &mut state.fs.inodes,
            dentries: &mut state.fs.dentries,
            mounts: &mut state.fs.mounts,
            superblocks: &mut state.fs.superblocks,
            files: &mut state.files,
            pipes: &mut state.pipes,
            bufs: &mut state.bufs,
            devices: &mut state.devices,
            frames: &mut state.frames,
            current: pid,
        };
        fsys.sys_exit_fs(&mut state.scheduler);
    }
    let mut psys = ProcSyscalls {
        tasks: &mut state.tasks,
        scheduler: &mut state.scheduler,
        frames: &mut state.frames,
        current: pid,
    };
    let _ = psys.sys_exit(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSubtype, DeviceType, DriverOps};
    use crate::elf::{ElfHdr, ElfProgFlags, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
    use crate::fcntl::OpenFlags;
    use crate::fs::{mkfs, SuperBlocks};
    use crate::memlayout::USER_EXEC_ADDR;
    use crate::proc::{ProcState, INIT_PID};
    use zerocopy::AsBytes;

    fn ramdisk_ops() -> DriverOps {
        DriverOps {
            ioctl: |_dev, _cmd| 0,
            read: |_dev, _sector, _count, buf| {
                buf.fill(0);
                true
            },
            write: |_dev, _sector, _count, _buf| true,
        }
    }

    /// A one-segment ELF32 binary: a page of readable `PT_LOAD` loaded at
    /// `USER_EXEC_ADDR`, entry pointing at its start. Never actually
    /// executed on the host, only loaded, so its contents don't matter
    /// past being valid bytes, the same boundary `exec.rs`'s own
    /// `SliceSource` test fixture draws.
    fn minimal_init_binary() -> [u8; 4096] {
        let mut image = [0u8; 4096];
        let mut ident = [0u8; 16];
        ident[0..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
        ident[4] = 1; // ELFCLASS32
        ident[5] = 1; // ELFDATA2LSB
        ident[6] = 1; // EV_CURRENT
        let ehdr = ElfHdr {
            ident,
            typ: 2, // ET_EXEC
            machine: 3, // EM_386
            version: 1,
            entry: USER_EXEC_ADDR as u32,
            phoff: core::mem::size_of::<ElfHdr>() as u32,
            shoff: 0,
            flags: 0,
            ehsize: core::mem::size_of::<ElfHdr>() as u16,
            phentsize: core::mem::size_of::<ProgHdr>() as u16,
            phnum: 1,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        };
        let phdr = ProgHdr {
            typ: ELF_PROG_LOAD,
            off: 0,
            vaddr: USER_EXEC_ADDR as u32,
            paddr: USER_EXEC_ADDR as u32,
            filesz: 4096,
            memsz: 4096,
            flags: (ElfProgFlags::READ | ElfProgFlags::EXEC).bits(),
            align: 4096,
        };
        image[..ehdr.as_bytes().len()].copy_from_slice(ehdr.as_bytes());
        let phoff = ehdr.phoff as usize;
        image[phoff..phoff + phdr.as_bytes().len()].copy_from_slice(phdr.as_bytes());
        image
    }

    fn write_all(fsys: &mut FileSyscalls<'_>, fd: i32, data: &[u8], blocking: &mut impl crate::wait::Blocking) {
        let mut off = 0;
        while off < data.len() {
            let n = fsys.sys_write(fd, &data[off..], blocking).unwrap();
            off += n as usize;
        }
    }

    /// Builds a `KernelState` with a mounted, mkfs'd root carrying `/init`,
    /// stopping short of `boot`'s static/unsafe global write so tests can
    /// exercise `bring_up_init`/`dispatch_trap` directly.
    fn setup() -> KernelState {
        let mut state = KernelState::new();
        state.devices.register(0, DeviceType::Block, DeviceSubtype::RamDisk, None, ramdisk_ops());
        let sb = mkfs::mkfs_on(0, 4096, &mut state.bufs, &mut state.devices, &mut state.scheduler);
        state.fs.superblocks = SuperBlocks::new();
        state.fs.superblocks.insert(sb);

        state.tasks.debug_spawn_for_test(INIT_PID, 0);
        let binary = minimal_init_binary();
        {
            let mut fsys = FileSyscalls {
                tasks: &mut state.tasks,
                inodes: &mut state.fs.inodes,
                dentries: &mut state.fs.dentries,
                mounts: &mut state.fs.mounts,
                superblocks: &mut state.fs.superblocks,
                files: &mut state.files,
                pipes: &mut state.pipes,
                bufs: &mut state.bufs,
                devices: &mut state.devices,
                frames: &mut state.frames,
                current: INIT_PID,
            };
            let fd = fsys
                .sys_open(b"init", OpenFlags::CREAT | OpenFlags::WRONLY, 0o755, &mut state.scheduler)
                .unwrap();
            write_all(&mut fsys, fd, &binary, &mut state.scheduler);
            fsys.sys_close(fd, &mut state.scheduler).unwrap();
        }
        state
    }

    #[test]
    fn bring_up_init_execs_the_freshly_written_binary() {
        let mut state = setup();
        let image = bring_up_init(&mut state);
        assert_eq!(image.entry, USER_EXEC_ADDR);
        assert_eq!(image.image_text, USER_EXEC_ADDR);
    }

    #[test]
    fn dispatch_trap_routes_a_process_syscall_and_writes_eax() {
        let mut state = setup();
        state.scheduler.spawn_at(INIT_PID as crate::sched::TaskId, 0);
        state.scheduler.schedule();

        let mut frame = TrapFrame { eax: syscall::SYS_GETPID as u32, trapno: trap::T_SYSCALL, ..Default::default() };
        dispatch_trap(&mut state, &mut frame);
        assert_eq!(frame.eax as i32, INIT_PID);
    }

    #[test]
    fn dispatch_trap_fatal_page_fault_kills_the_running_task() {
        let mut state = setup();
        state.scheduler.spawn_at(INIT_PID as crate::sched::TaskId, 0);
        state.scheduler.schedule();
        state.tasks.get_mut(INIT_PID).address_space = None;

        let mut frame = TrapFrame { trapno: trap::T_PAGE_FAULT, err: 0, ..Default::default() };
        dispatch_trap(&mut state, &mut frame);
        assert_eq!(state.tasks.get(INIT_PID).state, ProcState::Died);
    }

    #[test]
    fn dispatch_trap_timer_irq_advances_the_clock() {
        let mut state = setup();
        state.scheduler.spawn_at(INIT_PID as crate::sched::TaskId, 0);
        state.scheduler.schedule();

        let mut frame = TrapFrame { trapno: trap::T_IRQ0 + IRQ_TIMER, ..Default::default() };
        dispatch_trap(&mut state, &mut frame);
        assert_eq!(state.scheduler.ticks(), 1);
    }
}
