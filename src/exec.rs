//! `execve`: ELF32 program loading and the process-image swap
//! (`SPEC_FULL.md` §4.8 "execve").
//!
//! Adapted from the teacher's `KernelCtx::exec` — the page-by-page segment
//! loader and the top-down argument-string packing (`sp &= !0xf` after each
//! push) are the same shape, ported from its RISC-V register-passed
//! `main(argc, argv)` convention onto the i386 System V ABI convention
//! instead: argc/argv/envp are read straight off the initial `esp` by the
//! user binary's own `_start`, since this kernel has no register-frame type
//! yet (`trap.rs`, not yet built, owns that) to pass them in registers the
//! way the teacher's `RegNum::R1` write does.
//!
//! Unlike the teacher, reading the file's bytes goes through `ExecSource`
//! rather than a direct file-system call: `sysfile.rs`'s `sys_execve`
//! implements it over the inode cache (`InodeExecSource`), the same
//! layering `wait::Blocking` uses to let this module be built and tested
//! ahead of the file-system layer it now sits under.

use arrayvec::ArrayVec;
use zerocopy::FromBytes;

use crate::addr::{pgroundup, PGSIZE};
use crate::elf::{ElfError, ElfHdr, ProgHdr};
use crate::kalloc::PageFrameAllocator;
use crate::memlayout::{USER_EXEC_ADDR, USER_MMAP_ADDR, USER_STACK_TOP};
use crate::param::MAXARG;
use crate::vm::{AddressSpace, PteFlags};

/// Supplies the bytes of the file being exec'd, by offset. `sysfile.rs`'s
/// `InodeExecSource` implements this over the inode cache and buffer
/// cache; tests implement it over a plain in-memory byte slice.
pub trait ExecSource {
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), ()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecError {
    Elf(ElfError),
    Read,
    NoMemory,
    TooManyArgs,
    StackOverflow,
}

impl From<ElfError> for ExecError {
    fn from(e: ElfError) -> Self {
        ExecError::Elf(e)
    }
}

/// What `exec` hands back for `trap.rs` to forge the new task's `intr_frame`
/// from, plus the three image-extent fields `proc.rs`'s `Task` tracks.
pub struct ExecImage {
    pub entry: usize,
    pub user_sp: usize,
    pub image_text: usize,
    pub image_data: usize,
    pub image_end: usize,
}

/// Loads `source` as the new program image of `address_space`, mapping
/// every `PT_LOAD` segment and building the initial stack above it. The
/// caller builds `address_space` fresh and only swaps it in on success —
/// like the teacher, a failed `exec` must never leave a running task's old
/// image half-overwritten.
pub fn exec(
    address_space: &mut AddressSpace,
    frames: &mut PageFrameAllocator,
    source: &mut impl ExecSource,
    argv: &[&[u8]],
    envp: &[&[u8]],
) -> Result<ExecImage, ExecError> {
    if argv.len() > MAXARG || envp.len() > MAXARG {
        return Err(ExecError::TooManyArgs);
    }

    let mut ehdr_bytes = [0u8; core::mem::size_of::<ElfHdr>()];
    source.read_at(0, &mut ehdr_bytes).map_err(|_| ExecError::Read)?;
    let ehdr = ElfHdr::read_from(&ehdr_bytes[..]).ok_or(ExecError::Read)?;
    ehdr.validate()?;

    let mut image_text: Option<usize> = None;
    let mut image_data: Option<usize> = None;
    let mut image_end = USER_EXEC_ADDR;

    for i in 0..ehdr.phnum as usize {
        let mut ph_bytes = [0u8; core::mem::size_of::<ProgHdr>()];
        let off = ehdr.phoff as usize + i * core::mem::size_of::<ProgHdr>();
        source.read_at(off, &mut ph_bytes).map_err(|_| ExecError::Read)?;
        let ph = ProgHdr::read_from(&ph_bytes[..]).ok_or(ExecError::Read)?;
        if !ph.is_prog_load() {
            continue;
        }
        ph.validate_load(PGSIZE, USER_EXEC_ADDR, USER_MMAP_ADDR)?;

        load_segment(address_space, frames, source, &ph)?;

        let start = ph.vaddr as usize;
        let end = start + ph.memsz as usize;
        image_text = Some(image_text.map_or(start, |t| t.min(start)));
        if ph.is_writable() {
            image_data = Some(image_data.map_or(start, |d| d.min(start)));
        }
        image_end = image_end.max(end);
    }

    let image_text = image_text.unwrap_or(USER_EXEC_ADDR);
    let image_data = image_data.unwrap_or(image_text);

    let stack_top = USER_STACK_TOP;
    let stack_bottom = stack_top - PGSIZE;
    address_space
        .link_page(frames, stack_bottom, PteFlags::WRITABLE)
        .ok_or(ExecError::NoMemory)?;

    let user_sp = stage_stack(address_space, stack_bottom, stack_top, argv, envp)?;

    Ok(ExecImage {
        entry: ehdr.entry as usize,
        user_sp,
        image_text,
        image_data,
        image_end: pgroundup(image_end),
    })
}

fn load_segment(
    address_space: &mut AddressSpace,
    frames: &mut PageFrameAllocator,
    source: &mut impl ExecSource,
    ph: &ProgHdr,
) -> Result<(), ExecError> {
    let npages = pgroundup(ph.memsz as usize) / PGSIZE;
    let flags = if ph.is_writable() {
        PteFlags::WRITABLE
    } else {
        PteFlags::empty()
    };
    for i in 0..npages {
        let va = ph.vaddr as usize + i * PGSIZE;
        address_space.link_page(frames, va, flags).ok_or(ExecError::NoMemory)?;
    }

    let mut remaining = ph.filesz as usize;
    let mut file_off = ph.off as usize;
    let mut va = ph.vaddr as usize;
    let mut chunk = [0u8; PGSIZE];
    while remaining > 0 {
        let n = remaining.min(PGSIZE);
        source.read_at(file_off, &mut chunk[..n]).map_err(|_| ExecError::Read)?;
        address_space.copy_out_bytes(va, &chunk[..n]).map_err(|_| ExecError::NoMemory)?;
        remaining -= n;
        file_off += n;
        va += n;
    }
    // BSS tail beyond filesz is already zero: link_page hands out fresh
    // frames from the allocator, never recycled dirty ones.

    if !ph.is_writable() {
        let mut va = ph.vaddr as usize;
        for _ in 0..npages {
            address_space.mark_readonly(va);
            va += PGSIZE;
        }
    }
    Ok(())
}

/// Pure layout arithmetic for the initial stack image, split out from the
/// actual byte-copying so it can be unit-tested without an `AddressSpace`
/// (the same boundary `vm.rs`'s own tests draw around anything that would
/// dereference a real page table).
struct StackLayout {
    sp: usize,
    argv_array_at: usize,
    envp_array_at: usize,
    argv_string_at: ArrayVec<usize, MAXARG>,
    envp_string_at: ArrayVec<usize, MAXARG>,
}

fn compute_stack_layout(
    stack_top: usize,
    stack_bottom: usize,
    argv_lens: &[usize],
    envp_lens: &[usize],
) -> Result<StackLayout, ExecError> {
    let mut sp = stack_top;

    let mut envp_string_at = ArrayVec::<usize, MAXARG>::new();
    for &len in envp_lens.iter().rev() {
        sp = sp.checked_sub(len + 1).ok_or(ExecError::StackOverflow)?;
        sp &= !0x3;
        if sp < stack_bottom {
            return Err(ExecError::StackOverflow);
        }
        envp_string_at.push(sp);
    }
    envp_string_at.reverse();

    let mut argv_string_at = ArrayVec::<usize, MAXARG>::new();
    for &len in argv_lens.iter().rev() {
        sp = sp.checked_sub(len + 1).ok_or(ExecError::StackOverflow)?;
        sp &= !0x3;
        if sp < stack_bottom {
            return Err(ExecError::StackOverflow);
        }
        argv_string_at.push(sp);
    }
    argv_string_at.reverse();

    // The envp pointer array sits directly above the argv pointer array
    // (both NUL-terminated), so a freestanding `_start` can find `envp` by
    // walking past argv's terminator without a separate envp pointer.
    sp = sp
        .checked_sub((envp_lens.len() + 1) * 4)
        .ok_or(ExecError::StackOverflow)?;
    sp &= !0x3;
    if sp < stack_bottom {
        return Err(ExecError::StackOverflow);
    }
    let envp_array_at = sp;

    sp = sp
        .checked_sub((argv_lens.len() + 1) * 4)
        .ok_or(ExecError::StackOverflow)?;
    if sp < stack_bottom {
        return Err(ExecError::StackOverflow);
    }
    let argv_array_at = sp;
    debug_assert_eq!(argv_array_at + (argv_lens.len() + 1) * 4, envp_array_at);

    sp = sp.checked_sub(4).ok_or(ExecError::StackOverflow)?;
    if sp < stack_bottom {
        return Err(ExecError::StackOverflow);
    }
    debug_assert_eq!(sp + 4, argv_array_at);

    Ok(StackLayout {
        sp,
        argv_array_at,
        envp_array_at,
        argv_string_at,
        envp_string_at,
    })
}

fn stage_stack(
    address_space: &mut AddressSpace,
    stack_bottom: usize,
    stack_top: usize,
    argv: &[&[u8]],
    envp: &[&[u8]],
) -> Result<usize, ExecError> {
    let argv_lens: ArrayVec<usize, MAXARG> = argv.iter().map(|s| s.len()).collect();
    let envp_lens: ArrayVec<usize, MAXARG> = envp.iter().map(|s| s.len()).collect();
    let layout = compute_stack_layout(stack_top, stack_bottom, &argv_lens, &envp_lens)?;

    for (s, &at) in argv.iter().zip(layout.argv_string_at.iter()) {
        write_nul_terminated(address_space, at, s)?;
    }
    for (s, &at) in envp.iter().zip(layout.envp_string_at.iter()) {
        write_nul_terminated(address_space, at, s)?;
    }

    let argv_ptrs: ArrayVec<usize, { MAXARG + 1 }> =
        layout.argv_string_at.iter().copied().chain(core::iter::once(0)).collect();
    let envp_ptrs: ArrayVec<usize, { MAXARG + 1 }> =
        layout.envp_string_at.iter().copied().chain(core::iter::once(0)).collect();
    write_ptr_array(address_space, layout.argv_array_at, &argv_ptrs)?;
    write_ptr_array(address_space, layout.envp_array_at, &envp_ptrs)?;

    address_space
        .copy_out_bytes(layout.sp, &(argv.len() as u32).to_ne_bytes())
        .map_err(|_| ExecError::NoMemory)?;

    Ok(layout.sp)
}

fn write_nul_terminated(address_space: &mut AddressSpace, va: usize, s: &[u8]) -> Result<(), ExecError> {
    address_space.copy_out_bytes(va, s).map_err(|_| ExecError::NoMemory)?;
    address_space.copy_out_bytes(va + s.len(), &[0]).map_err(|_| ExecError::NoMemory)
}

fn write_ptr_array(address_space: &mut AddressSpace, va: usize, ptrs: &[usize]) -> Result<(), ExecError> {
    for (i, &p) in ptrs.iter().enumerate() {
        address_space
            .copy_out_bytes(va + i * 4, &(p as u32).to_ne_bytes())
            .map_err(|_| ExecError::NoMemory)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_envp_array_directly_above_argv_array() {
        let layout = compute_stack_layout(0x1000_0000, 0x0fff_f000, &[5, 3], &[7]).unwrap();
        assert_eq!(layout.argv_array_at + 3 * 4, layout.envp_array_at);
        assert_eq!(layout.sp + 4, layout.argv_array_at);
    }

    #[test]
    fn layout_reports_overflow_when_arguments_dont_fit() {
        let huge = [4000usize; 1];
        let err = compute_stack_layout(0x1000_0000, 0x0fff_f000, &huge, &[]);
        assert_eq!(err.err(), Some(ExecError::StackOverflow));
    }

    #[test]
    fn layout_with_no_arguments_still_has_both_null_terminators() {
        let layout = compute_stack_layout(0x1000_0000, 0x0fff_f000, &[], &[]).unwrap();
        assert_eq!(layout.argv_array_at + 4, layout.envp_array_at);
        assert!(layout.argv_string_at.is_empty());
        assert!(layout.envp_string_at.is_empty());
    }

    struct SliceSource<'a>(&'a [u8]);

    impl ExecSource for SliceSource<'_> {
        fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), ()> {
            let end = offset.checked_add(buf.len()).ok_or(())?;
            if end > self.0.len() {
                return Err(());
            }
            buf.copy_from_slice(&self.0[offset..end]);
            Ok(())
        }
    }

    #[test]
    fn rejects_a_truncated_header_read() {
        let mut src = SliceSource(&[0u8; 4]);
        let mut hdr = [0u8; core::mem::size_of::<ElfHdr>()];
        assert!(src.read_at(0, &mut hdr).is_err());
    }
}
