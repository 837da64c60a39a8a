//! L1: per-process address spaces, two-level x86 paging, copy-on-write
//! fork, and demand paging for the heap and stack (`SPEC_FULL.md` §4.2).
//!
//! Adapted from a three-level Sv39 `PageTable`/`UserMemory` design down to
//! x86's directory/table split. The biggest departure from that ancestor is
//! that this kernel does *not* identity-map the whole of physical memory, so
//! a page table belonging to an address space that isn't the one currently
//! loaded in `cr3` cannot be dereferenced directly. Two mechanisms cover
//! that:
//!
//! - the self-referential last page-directory entry (`SELFMAP_*` in
//!   `addr.rs`) addresses the *active* address space's own tables, used on
//!   the fast path (page-fault handling, `link_page`/`unlink_page`);
//! - a pair of scratch kernel virtual pages (`TEMP_MAP_SRC_VA`/`_DST_VA`)
//!   temporarily map one or two arbitrary physical frames so `copy_pde` and
//!   `free_pde` can walk a directory that isn't active yet (the child, mid
//!   fork) or isn't active anymore (a reaped zombie).

use bitflags::bitflags;

use crate::addr::{pgrounddown, pgroundup, Addr, PAddr, PGSHIFT, PGSIZE, PLMASK, PLSHIFT, PLSIZE, SELFMAP_PDE_INDEX};
use crate::bitmap::Bitmap;
use crate::kalloc::PageFrameAllocator;
use crate::memlayout::{
    KERNEL_MEM, KERNEL_PDE_COUNT, TEMP_MAP_DST_VA, TEMP_MAP_SRC_VA, USER_EXEC_ADDR, USER_MMAP_ADDR,
    USER_MMAP_LIMIT, USER_STACK_BOTTOM, USER_STACK_TOP,
};
use crate::page::RawPage;
use crate::x86;

bitflags! {
    /// Software-visible x86 PTE bits this kernel relies on. Bits 9-11 are
    /// architecturally available to the OS; bit 9 marks a CoW-shared frame,
    /// bit 10 marks a page that must never become a CoW candidate (a true
    /// `O_RDONLY` mapping or read-only ELF text), bit 11 marks a
    /// `MAP_SHARED` mapping, which must also never become a CoW candidate —
    /// it has to keep pointing at the same frame in every process that
    /// shares it, including across `fork`.
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        const COW      = 1 << 9;
        const READONLY = 1 << 10;
        const SHARED   = 1 << 11;
    }
}

const PTE_ADDR_MASK: u32 = !(PGSIZE as u32 - 1);
const PTE_FLAGS_MASK: u32 = PGSIZE as u32 - 1;

#[derive(Clone, Copy)]
#[repr(transparent)]
struct PageTableEntry(u32);

impl PageTableEntry {
    const fn empty() -> Self {
        Self(0)
    }

    fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PTE_FLAGS_MASK)
    }

    fn pa(&self) -> usize {
        (self.0 & PTE_ADDR_MASK) as usize
    }

    fn set(&mut self, pa: usize, flags: PteFlags) {
        debug_assert_eq!(pa & PTE_FLAGS_MASK as usize, 0, "PTE target must be page aligned");
        self.0 = (pa as u32 & PTE_ADDR_MASK) | flags.bits();
    }

    fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & PTE_ADDR_MASK) | flags.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(align(4096))]
struct RawPageTable {
    entries: [PageTableEntry; PLSIZE],
}

impl RawPageTable {
    fn as_entries(page: &mut RawPage) -> &mut [PageTableEntry; PLSIZE] {
        // SAFETY: `RawPage` and `RawPageTable` have the same size and
        // alignment; both are plain-old-data arrays of page-sized granules.
        unsafe { &mut *(page as *mut RawPage as *mut [PageTableEntry; PLSIZE]) }
    }
}

/// Runs `f` with `paddr`'s contents visible as a `RawPage`. Frames inside
/// the kernel's permanently identity-mapped window are dereferenced
/// directly; frames outside it (physical memory beyond `KERNEL_MEM`, which
/// is where ordinary user frames live) are reached through a scratch
/// virtual-address window.
fn with_frame<R>(paddr: usize, temp_va: usize, f: impl FnOnce(&mut RawPage) -> R) -> R {
    if paddr < KERNEL_MEM {
        let page = unsafe { &mut *(paddr as *mut RawPage) };
        f(page)
    } else {
        temp_map(paddr, temp_va, f)
    }
}

fn temp_map<R>(paddr: usize, temp_va: usize, f: impl FnOnce(&mut RawPage) -> R) -> R {
    unsafe {
        install_kernel_temp_pte(temp_va, paddr);
        x86::invlpg(temp_va);
        let result = f(&mut *(temp_va as *mut RawPage));
        clear_kernel_temp_pte(temp_va);
        x86::invlpg(temp_va);
        result
    }
}

/// The kernel's permanent page table covering `TEMP_MAP_SRC_VA`/`_DST_VA`.
/// Installed identically in every process's directory (see
/// `init_directory`), so the scratch window is reachable no matter which
/// address space is active when `temp_map` runs.
static mut KERNEL_TEMP_TABLE: RawPageTable = RawPageTable {
    entries: [PageTableEntry::empty(); PLSIZE],
};

fn temp_pte_index(va: usize) -> usize {
    (va >> PGSHIFT) & PLMASK
}

unsafe fn install_kernel_temp_pte(va: usize, paddr: usize) {
    let idx = temp_pte_index(va);
    unsafe {
        KERNEL_TEMP_TABLE.entries[idx].set(paddr, PteFlags::PRESENT | PteFlags::WRITABLE);
    }
}

unsafe fn clear_kernel_temp_pte(va: usize) {
    let idx = temp_pte_index(va);
    unsafe {
        KERNEL_TEMP_TABLE.entries[idx].clear();
    }
}

/// Physical address the kernel's shared table lives at, for wiring it into
/// freshly built directories. Valid only because `KERNEL_TEMP_TABLE` sits in
/// the kernel's statically linked (and therefore identity-mapped) data.
fn kernel_temp_table_paddr() -> usize {
    unsafe { core::ptr::addr_of!(KERNEL_TEMP_TABLE) as usize }
}

fn dir_index(va: usize) -> usize {
    (va >> (PGSHIFT + PLSHIFT)) & PLMASK
}

fn table_index(va: usize) -> usize {
    (va >> PGSHIFT) & PLMASK
}

/// One process's page directory, its heap break, and its mmap-window
/// reservation bitmap.
pub struct AddressSpace {
    directory: PAddr,
    /// Highest byte in use by the program image/heap (`sys_brk`'s ceiling
    /// follows this, both start equal to the image end set by `execve`).
    brk: usize,
    /// Bits set for pages reserved (whether or not yet linked) in
    /// `[USER_MMAP_ADDR, USER_MMAP_LIMIT)`.
    vmap: Bitmap<{ (USER_MMAP_LIMIT - USER_MMAP_ADDR) / PGSIZE / 32 }>,
}

/// Outcome of a page-fault dispatched to `AddressSpace::handle_fault`.
#[derive(Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault was resolved; the faulting instruction may be retried.
    Resolved,
    /// The fault is not recoverable; the caller must terminate the task.
    Fatal,
}

bitflags! {
    /// Error-code bits x86 pushes for a page fault, in the order the spec
    /// names them: present, write, user.
    pub struct FaultError: u32 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
    }
}

impl AddressSpace {
    /// Builds a fresh, empty address space: an allocated directory with the
    /// shared kernel PDEs and the self-referential last entry installed,
    /// and nothing mapped above `USER_EXEC_ADDR`.
    pub fn new(frames: &mut PageFrameAllocator) -> Option<Self> {
        let dir_page = frames.try_alloc_frame()?;
        let dir_paddr = dir_page.addr();
        let _ = dir_page.into_usize();
        Self::init_directory(dir_paddr);
        Some(Self {
            directory: PAddr::from(dir_paddr),
            brk: USER_EXEC_ADDR,
            vmap: Bitmap::new(),
        })
    }

    fn init_directory(dir_paddr: usize) {
        with_frame(dir_paddr, TEMP_MAP_DST_VA, |page| {
            let dir = RawPageTable::as_entries(page);
            for e in dir.iter_mut() {
                e.clear();
            }
            // Share the kernel's own low-memory page tables by value: every
            // directory's first KERNEL_PDE_COUNT entries point at the same
            // physical tables as the boot-time kernel directory.
            for i in 0..KERNEL_PDE_COUNT {
                dir[i] = boot_kernel_pde(i);
            }
            // Wire in the shared scratch window used by `temp_map`.
            let temp_idx = dir_index(TEMP_MAP_SRC_VA);
            dir[temp_idx].set(kernel_temp_table_paddr(), PteFlags::PRESENT | PteFlags::WRITABLE);
            dir[SELFMAP_PDE_INDEX].set(dir_paddr, PteFlags::PRESENT | PteFlags::WRITABLE);
        });
    }

    pub fn directory_paddr(&self) -> usize {
        self.directory.into_usize()
    }

    pub fn brk(&self) -> usize {
        self.brk
    }

    /// `execve` has already mapped every program-image page up through
    /// `image_end` itself; this just moves the heap ceiling to match, the
    /// "both start equal to the image end set by `execve`" promise above.
    pub fn set_brk_after_exec(&mut self, image_end: usize) {
        self.brk = image_end;
    }

    /// Loads this address space's directory into `cr3`, making it active.
    ///
    /// # Safety
    /// Must only be called as part of a context switch into a task that
    /// owns this address space.
    pub unsafe fn activate(&self) {
        unsafe { x86::w_cr3(self.directory.into_usize() as u32) };
    }

    /// `copy_pde`: builds a child address space that shares every present
    /// user frame with `self`, read-only, bumping each frame's refcount.
    /// Page tables are *not* shared: each is freshly allocated and
    /// populated by copying entries one at a time. A `MAP_SHARED` frame
    /// (`PteFlags::SHARED`) is the one exception: it stays exactly as
    /// mapped in the parent, writable or not, since both processes must
    /// keep observing the same frame rather than diverging on next write.
    pub fn copy_pde(&self, frames: &mut PageFrameAllocator) -> Option<Self> {
        let mut child = Self::new(frames)?;
        child.brk = self.brk;
        child.vmap = self.vmap.clone();

        for pd_idx in KERNEL_PDE_COUNT..SELFMAP_PDE_INDEX {
            let parent_pde = read_pde(self.directory.into_usize(), pd_idx);
            if !parent_pde.is_present() {
                continue;
            }
            let parent_table_pa = parent_pde.pa();
            let child_table_page = frames.try_alloc_frame()?;
            let child_table_pa = child_table_page.addr();
            let _ = child_table_page.into_usize();

            with_frame(child_table_pa, TEMP_MAP_DST_VA, |dst_page| {
                let dst = RawPageTable::as_entries(dst_page);
                for e in dst.iter_mut() {
                    e.clear();
                }
            });

            for pt_idx in 0..PLSIZE {
                let parent_pte = read_pte(parent_table_pa, pt_idx);
                if !parent_pte.is_present() {
                    continue;
                }
                let frame_pa = parent_pte.pa();
                let mut flags = parent_pte.flags();
                if !flags.contains(PteFlags::READONLY) && !flags.contains(PteFlags::SHARED) {
                    flags.remove(PteFlags::WRITABLE);
                    flags.insert(PteFlags::COW);
                    write_pte_flags(parent_table_pa, pt_idx, flags);
                }
                frames.get_frame(frame_pa);
                write_pte(child_table_pa, pt_idx, frame_pa, flags);
            }

            write_pde(
                child.directory.into_usize(),
                pd_idx,
                child_table_pa,
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
            );
        }

        // The parent's entries were just demoted to read-only/CoW; flush so
        // the change takes effect if the parent is the active address space.
        unsafe { flush_all() };
        Some(child)
    }

    /// `free_pde`: releases every present user frame and page table, then
    /// the directory itself. Must be the last use of this `AddressSpace`.
    pub fn free_pde(self, frames: &mut PageFrameAllocator) {
        let dir_pa = self.directory.into_usize();
        for pd_idx in KERNEL_PDE_COUNT..SELFMAP_PDE_INDEX {
            let pde = read_pde(dir_pa, pd_idx);
            if !pde.is_present() {
                continue;
            }
            let table_pa = pde.pa();
            for pt_idx in 0..PLSIZE {
                let pte = read_pte(table_pa, pt_idx);
                if pte.is_present() {
                    frames.put_frame_addr(pte.pa());
                }
            }
            frames.put_frame_addr(table_pa);
        }
        frames.put_frame_addr(dir_pa);
        core::mem::forget(self);
    }

    /// `link_page`: attaches a freshly allocated, zeroed frame at `va`,
    /// creating the page table on demand. `self` must be the active
    /// address space.
    pub fn link_page(&mut self, frames: &mut PageFrameAllocator, va: usize, flags: PteFlags) -> Option<()> {
        debug_assert_eq!(va % PGSIZE, 0);
        let pde_idx = dir_index(va);
        ensure_table_present(frames, pde_idx)?;
        let pte = active_pte_mut(va);
        assert!(!pte.is_present(), "link_page: already mapped");
        let page = frames.try_alloc_frame()?;
        let pa = page.into_usize();
        pte.set(pa, PteFlags::PRESENT | PteFlags::USER | flags);
        unsafe { x86::invlpg(va) };
        Some(())
    }

    /// `unlink_page`: detaches and frees the frame mapped at `va`, if any.
    /// `self` must be the active address space.
    pub fn unlink_page(&mut self, frames: &mut PageFrameAllocator, va: usize) {
        let va = pgrounddown(va);
        let pde_idx = dir_index(va);
        if !read_pde(self.directory.into_usize(), pde_idx).is_present() {
            return;
        }
        let pte = active_pte_mut(va);
        if pte.is_present() {
            frames.put_frame_addr(pte.pa());
            pte.clear();
            unsafe { x86::invlpg(va) };
        }
    }

    /// Marks a mapped page read-only, without touching CoW bookkeeping.
    /// Used by `execve` for a true `O_RDONLY` text page and for the user
    /// stack's guard page.
    pub fn mark_readonly(&mut self, va: usize) {
        let pte = active_pte_mut(va);
        assert!(pte.is_present(), "mark_readonly: not mapped");
        let mut flags = pte.flags();
        flags.remove(PteFlags::WRITABLE | PteFlags::COW);
        flags.insert(PteFlags::READONLY);
        pte.set_flags(flags);
        unsafe { x86::invlpg(va) };
    }

    /// The page-fault policy of `SPEC_FULL.md` §4.2, verbatim:
    /// 1. Out-of-range access by a user task is fatal.
    /// 2. A write fault on a present read-only page is either fatal (a true
    ///    `O_RDONLY` page) or resolved by CoW (break or deep-copy sharing).
    /// 3. A not-present fault below `brk` or above `USER_STACK_BOTTOM` is
    ///    demand-paged with a fresh zero frame.
    /// 4. Anything else is fatal.
    pub fn handle_fault(
        &mut self,
        frames: &mut PageFrameAllocator,
        fault_va: usize,
        error: FaultError,
        is_user_task: bool,
    ) -> FaultOutcome {
        if is_user_task && (fault_va < USER_EXEC_ADDR || fault_va >= USER_STACK_TOP) {
            return FaultOutcome::Fatal;
        }

        if error.contains(FaultError::PRESENT) && error.contains(FaultError::WRITE) {
            return self.handle_cow_fault(frames, fault_va);
        }

        if !error.contains(FaultError::PRESENT) {
            let page = pgrounddown(fault_va);
            if page < self.brk || fault_va >= USER_STACK_BOTTOM {
                return match self.link_page(frames, page, PteFlags::WRITABLE) {
                    Some(()) => FaultOutcome::Resolved,
                    None => FaultOutcome::Fatal,
                };
            }
        }

        FaultOutcome::Fatal
    }

    fn handle_cow_fault(&mut self, frames: &mut PageFrameAllocator, fault_va: usize) -> FaultOutcome {
        let va = pgrounddown(fault_va);
        let pte = active_pte_mut(va);
        if !pte.is_present() {
            return FaultOutcome::Fatal;
        }
        let flags = pte.flags();
        if flags.contains(PteFlags::READONLY) {
            return FaultOutcome::Fatal;
        }
        if !flags.contains(PteFlags::COW) {
            // A present, writable page faulted on write only reaches here
            // through a stale TLB entry; nothing to do but retry.
            return FaultOutcome::Resolved;
        }

        let old_pa = pte.pa();
        if frames.refcount(old_pa) == 1 {
            let mut new_flags = flags;
            new_flags.remove(PteFlags::COW);
            new_flags.insert(PteFlags::WRITABLE);
            pte.set_flags(new_flags);
            unsafe { x86::invlpg(va) };
            return FaultOutcome::Resolved;
        }

        let new_page = match frames.try_alloc_frame() {
            Some(p) => p,
            None => return FaultOutcome::Fatal,
        };
        let new_pa = new_page.addr();
        copy_frame(old_pa, new_pa);
        let _ = new_page.into_usize();
        frames.put_frame_addr(old_pa);

        let mut new_flags = flags;
        new_flags.remove(PteFlags::COW);
        new_flags.insert(PteFlags::WRITABLE);
        pte.set(new_pa, new_flags);
        unsafe { x86::invlpg(va) };
        FaultOutcome::Resolved
    }

    /// `sys_brk`: grows or shrinks the heap ceiling. Growing only checks
    /// that enough frames could plausibly back the new range; the mapping
    /// itself is lazy, through `handle_fault`. Shrinking unmaps eagerly.
    pub fn sys_brk(&mut self, frames: &mut PageFrameAllocator, addr: usize) -> Result<usize, ()> {
        if addr % PGSIZE != 0 || addr < USER_EXEC_ADDR || addr >= USER_MMAP_ADDR {
            return Err(());
        }
        if addr < self.brk {
            let mut va = addr;
            while va < pgroundup(self.brk) {
                self.unlink_page(frames, va);
                va += PGSIZE;
            }
        } else if addr > self.brk {
            let npages = (pgroundup(addr) - pgroundup(self.brk)) / PGSIZE;
            if frames.free_frames() < npages {
                return Err(());
            }
        }
        self.brk = addr;
        Ok(self.brk)
    }

    /// `sys_mmap`: reserves `[addr, addr+len)` in the per-process mmap
    /// bitmap (the caller picks `addr` by scanning it) and eagerly links
    /// pages with the given protection. If `src` is given, its bytes are
    /// copied into the region (the read-from-fd step the caller performs
    /// before calling this). `shared` selects `MAP_SHARED` over the
    /// `MAP_PRIVATE` default: a shared mapping keeps pointing at the same
    /// frame across `fork` (see `copy_pde`) instead of becoming CoW.
    pub fn sys_mmap(
        &mut self,
        frames: &mut PageFrameAllocator,
        addr: usize,
        len: usize,
        writable: bool,
        shared: bool,
        src: Option<&[u8]>,
    ) -> Result<usize, ()> {
        if addr % PGSIZE != 0 || len == 0 {
            return Err(());
        }
        let end = addr.checked_add(pgroundup(len)).ok_or(())?;
        if addr < USER_MMAP_ADDR || end > USER_MMAP_LIMIT {
            return Err(());
        }
        let base_bit = (addr - USER_MMAP_ADDR) / PGSIZE;
        let nbits = pgroundup(len) / PGSIZE;
        for b in base_bit..base_bit + nbits {
            if self.vmap.get(b) {
                return Err(());
            }
        }
        for b in base_bit..base_bit + nbits {
            self.vmap.set(b);
        }

        let mut flags = if writable { PteFlags::WRITABLE } else { PteFlags::empty() };
        if shared {
            flags.insert(PteFlags::SHARED);
        }
        let mut va = addr;
        while va < end {
            self.link_page(frames, va, flags).ok_or(())?;
            va += PGSIZE;
        }
        if let Some(src) = src {
            self.copy_out_bytes(addr, src).map_err(|_| ())?;
        }
        if !writable {
            let mut va = addr;
            while va < end {
                self.mark_readonly(va);
                va += PGSIZE;
            }
        }
        Ok(addr)
    }

    /// `sys_munmap`: unmaps and clears the reservation for `[addr, addr+len)`.
    pub fn sys_munmap(&mut self, frames: &mut PageFrameAllocator, addr: usize, len: usize) -> Result<(), ()> {
        if addr % PGSIZE != 0 || addr < USER_MMAP_ADDR || addr >= USER_MMAP_LIMIT {
            return Err(());
        }
        let base_bit = (addr - USER_MMAP_ADDR) / PGSIZE;
        let nbits = pgroundup(len) / PGSIZE;
        let mut va = addr;
        for b in base_bit..base_bit + nbits {
            self.vmap.clear(b);
            self.unlink_page(frames, va);
            va += PGSIZE;
        }
        Ok(())
    }

    /// Copy from kernel `src` to user virtual address `dst`.
    pub fn copy_out_bytes(&mut self, dst: usize, src: &[u8]) -> Result<(), ()> {
        self.copy_bytes(dst, src.len(), |page_off, chunk_len, page, written| {
            page[page_off..page_off + chunk_len].copy_from_slice(&src[*written..*written + chunk_len]);
            *written += chunk_len;
        })
    }

    /// Copy from user virtual address `src` into kernel `dst`.
    pub fn copy_in_bytes(&mut self, dst: &mut [u8], src: usize) -> Result<(), ()> {
        self.copy_bytes(src, dst.len(), |page_off, chunk_len, page, written| {
            dst[*written..*written + chunk_len].copy_from_slice(&page[page_off..page_off + chunk_len]);
            *written += chunk_len;
        })
    }

    /// Copies a NUL-terminated string from user `src` into `dst`, stopping
    /// at the terminator or `dst.len()`, whichever comes first.
    pub fn copy_in_str(&mut self, dst: &mut [u8], src: usize) -> Result<usize, ()> {
        let mut va = src;
        let mut written = 0;
        while written < dst.len() {
            let page_va = pgrounddown(va);
            let page_off = va - page_va;
            let page = self.user_slice(page_va)?;
            let avail = PGSIZE - page_off;
            let room = dst.len() - written;
            let chunk = avail.min(room);
            for (i, &b) in page[page_off..page_off + chunk].iter().enumerate() {
                dst[written + i] = b;
                if b == 0 {
                    return Ok(written + i + 1);
                }
            }
            written += chunk;
            va += chunk;
        }
        Err(())
    }

    fn copy_bytes(
        &mut self,
        uva: usize,
        len: usize,
        mut each: impl FnMut(usize, usize, &mut [u8; PGSIZE], &mut usize),
    ) -> Result<(), ()> {
        let mut va = uva;
        let mut remaining = len;
        let mut progress = 0usize;
        while remaining > 0 {
            let page_va = pgrounddown(va);
            let page_off = va - page_va;
            let page = self.user_slice(page_va)?;
            let chunk = (PGSIZE - page_off).min(remaining);
            each(page_off, chunk, page, &mut progress);
            remaining -= chunk;
            va += chunk;
        }
        Ok(())
    }

    fn user_slice(&mut self, page_va: usize) -> Result<&mut [u8; PGSIZE], ()> {
        if page_va >= USER_STACK_TOP {
            return Err(());
        }
        let pte = active_pte_mut(page_va);
        if !pte.is_present() || !pte.flags().contains(PteFlags::USER) {
            return Err(());
        }
        // SAFETY: the PTE is present and user-accessible, so `page_va` is
        // backed by a live frame the active directory owns.
        Ok(unsafe { &mut *(page_va as *mut [u8; PGSIZE]) })
    }
}

fn boot_kernel_pde(index: usize) -> PageTableEntry {
    let table_pa = crate::memlayout::KERNEL_PAGE_DIR + (index + 1) * PGSIZE;
    let mut pte = PageTableEntry::empty();
    pte.set(table_pa, PteFlags::PRESENT | PteFlags::WRITABLE);
    pte
}

fn read_pde(dir_pa: usize, index: usize) -> PageTableEntry {
    with_frame(dir_pa, TEMP_MAP_SRC_VA, |page| RawPageTable::as_entries(page)[index])
}

fn write_pde(dir_pa: usize, index: usize, pa: usize, flags: PteFlags) {
    with_frame(dir_pa, TEMP_MAP_DST_VA, |page| {
        RawPageTable::as_entries(page)[index].set(pa, flags)
    })
}

fn read_pte(table_pa: usize, index: usize) -> PageTableEntry {
    with_frame(table_pa, TEMP_MAP_SRC_VA, |page| RawPageTable::as_entries(page)[index])
}

fn write_pte(table_pa: usize, index: usize, pa: usize, flags: PteFlags) {
    with_frame(table_pa, TEMP_MAP_DST_VA, |page| {
        RawPageTable::as_entries(page)[index].set(pa, flags)
    })
}

fn write_pte_flags(table_pa: usize, index: usize, flags: PteFlags) {
    with_frame(table_pa, TEMP_MAP_DST_VA, |page| {
        RawPageTable::as_entries(page)[index].set_flags(flags)
    })
}

fn copy_frame(src_pa: usize, dst_pa: usize) {
    if src_pa < KERNEL_MEM && dst_pa < KERNEL_MEM {
        let (src, dst) = unsafe { (&*(src_pa as *const RawPage), &mut *(dst_pa as *mut RawPage)) };
        dst.bytes.copy_from_slice(&src.bytes);
        return;
    }
    unsafe {
        install_kernel_temp_pte(TEMP_MAP_SRC_VA, src_pa);
        install_kernel_temp_pte(TEMP_MAP_DST_VA, dst_pa);
        x86::invlpg(TEMP_MAP_SRC_VA);
        x86::invlpg(TEMP_MAP_DST_VA);
        let src = &*(TEMP_MAP_SRC_VA as *const RawPage);
        let dst = &mut *(TEMP_MAP_DST_VA as *mut RawPage);
        dst.bytes.copy_from_slice(&src.bytes);
        clear_kernel_temp_pte(TEMP_MAP_SRC_VA);
        clear_kernel_temp_pte(TEMP_MAP_DST_VA);
        x86::invlpg(TEMP_MAP_SRC_VA);
        x86::invlpg(TEMP_MAP_DST_VA);
    }
}

/// Creates the page table for `pde_idx` in the active directory if absent.
fn ensure_table_present(frames: &mut PageFrameAllocator, pde_idx: usize) -> Option<()> {
    let self_dir = selfmap_dir_mut();
    if self_dir[pde_idx].is_present() {
        return Some(());
    }
    let table_page = frames.try_alloc_frame()?;
    let table_pa = table_page.addr();
    let _ = table_page.into_usize();
    let self_dir = selfmap_dir_mut();
    self_dir[pde_idx].set(table_pa, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER);
    unsafe { x86::invlpg(crate::addr::SELFMAP_PTE_BASE + pde_idx * PGSIZE) };
    Some(())
}

/// The active directory, addressed through the self-referential last PDE.
fn selfmap_dir_mut() -> &'static mut [PageTableEntry; PLSIZE] {
    unsafe { &mut *(crate::addr::SELFMAP_PDE as *mut [PageTableEntry; PLSIZE]) }
}

/// A PTE of the active directory, addressed through the self-map window.
fn active_pte_mut(va: usize) -> &'static mut PageTableEntry {
    let pde_idx = dir_index(va);
    let pt_idx = table_index(va);
    let table_window = crate::addr::SELFMAP_PTE_BASE + pde_idx * PGSIZE;
    unsafe { &mut (*(table_window as *mut [PageTableEntry; PLSIZE]))[pt_idx] }
}

unsafe fn flush_all() {
    unsafe {
        let cr3 = x86::r_cr3();
        x86::w_cr3(cr3);
    }
}
