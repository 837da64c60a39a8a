//! L0: the physical page-frame allocator and the kernel virtual-address
//! bitmap allocator (`SPEC_FULL.md` §4.1).
//!
//! Physical memory is tracked with one byte per page (a reference count,
//! not just a free bit) so that copy-on-write sharing can be layered on top
//! in `vm.rs` without a separate bookkeeping structure. Kernel virtual
//! addresses are handed out from a 16 MiB window by scanning a bitmap; the
//! mapping from virtual address to backing frame is established lazily by
//! the page-fault handler or eagerly by the caller, per `alloc_kpages`'s
//! contract.

use crate::addr::{pgrounddown, pgroundup, PGSIZE};
use crate::bitmap::Bitmap;
use crate::memlayout::{KERNEL_LOAD_ADDR, KERNEL_MEM};
use crate::page::Page;

/// Number of frames describable by the reference-count table, sized to
/// cover the full kernel memory window plus a margin for physical memory
/// discovered past it (user RAM).
pub const MAX_FRAMES: usize = 256 * 1024; // covers up to 1 GiB of physical memory

/// Number of pages of kernel virtual address space available for
/// `alloc_kpages`/`free_kpages` (the 16 MiB kernel region minus the fixed
/// identity-mapped load address).
pub const KERNEL_VPAGES: usize = KERNEL_MEM / PGSIZE;

/// One ARDS-style usable memory region reported by the bootloader.
#[derive(Clone, Copy, Debug)]
pub struct MemRegion {
    pub base: usize,
    pub len: usize,
}

/// Physical page-frame reference-count table plus the kernel virtual
/// address bitmap (§4.1). A single `PageFrameAllocator` instance is the
/// kernel's sole owner of physical memory.
pub struct PageFrameAllocator {
    refcounts: [u8; MAX_FRAMES],
    frame_base: usize,
    frame_limit: usize,
    kvmap: Bitmap<{ KERNEL_VPAGES / 32 }>,
}

impl PageFrameAllocator {
    pub const fn new() -> Self {
        Self {
            refcounts: [0; MAX_FRAMES],
            frame_base: 0,
            frame_limit: 0,
            kvmap: Bitmap::new(),
        }
    }

    /// One-time boot initialization from the bootloader's ARDS memory map.
    /// The largest usable zone must start at 1 MiB and be at least
    /// `KERNEL_MEM` bytes, per §4.1's contract.
    ///
    /// # Safety
    /// Must be called exactly once, before any other method, with a memory
    /// map describing memory this kernel may use exclusively.
    pub unsafe fn init(&mut self, regions: &[MemRegion]) {
        let best = regions
            .iter()
            .filter(|r| r.base >= KERNEL_LOAD_ADDR)
            .max_by_key(|r| r.len)
            .expect("no usable memory region reported by the bootloader");
        assert!(
            best.len >= KERNEL_MEM,
            "largest usable zone smaller than required kernel memory"
        );
        self.set_range(pgroundup(best.base), pgrounddown(best.base + best.len));
    }

    fn set_range(&mut self, base: usize, limit: usize) {
        assert!((limit - base) / PGSIZE <= MAX_FRAMES, "physical memory exceeds MAX_FRAMES");
        self.frame_base = base;
        self.frame_limit = limit;
    }

    /// Test-only escape hatch so other modules' unit tests (e.g. `slab.rs`)
    /// can stand up a small backing store without going through `init`'s
    /// bootloader-memory-map contract.
    #[cfg(test)]
    pub(crate) fn set_range_for_test(&mut self, base: usize, nframes: usize) {
        self.set_range(base, base + nframes * PGSIZE);
    }

    fn frame_index(&self, paddr: usize) -> usize {
        debug_assert!(paddr % PGSIZE == 0, "unaligned physical address");
        debug_assert!(
            (self.frame_base..self.frame_limit).contains(&paddr),
            "physical address outside the managed range"
        );
        (paddr - self.frame_base) / PGSIZE
    }

    fn nframes(&self) -> usize {
        (self.frame_limit - self.frame_base) / PGSIZE
    }

    /// Allocates a fresh, zero-refcount frame, sets its refcount to 1, and
    /// returns it. Fails fatally (panics) if none are free: frame
    /// exhaustion with no caller able to proceed is a kernel bug at this
    /// layer, matching the teaching kernel's "fails fatally" contract.
    pub fn alloc_frame(&mut self) -> Page {
        self.try_alloc_frame().expect("out of physical memory")
    }

    /// Like `alloc_frame`, but returns `None` on exhaustion instead of
    /// panicking, for call sites (e.g. `sys_brk`'s growth check) that must
    /// recover gracefully.
    pub fn try_alloc_frame(&mut self) -> Option<Page> {
        for i in 0..self.nframes() {
            if self.refcounts[i] == 0 {
                self.refcounts[i] = 1;
                let paddr = self.frame_base + i * PGSIZE;
                let mut page = unsafe { Page::from_usize(paddr) };
                page.bytes = [0; PGSIZE];
                return Some(page);
            }
        }
        None
    }

    /// Number of currently free frames, used by callers (like `sys_brk`)
    /// that must check availability before committing to a lazy mapping.
    pub fn free_frames(&self) -> usize {
        (0..self.nframes()).filter(|&i| self.refcounts[i] == 0).count()
    }

    /// Bumps a frame's reference count, for sharing a page (CoW fork).
    pub fn get_frame(&mut self, paddr: usize) {
        let i = self.frame_index(paddr);
        assert!(self.refcounts[i] > 0, "get_frame: frame not allocated");
        self.refcounts[i] += 1;
    }

    pub fn refcount(&self, paddr: usize) -> u8 {
        self.refcounts[self.frame_index(paddr)]
    }

    /// Decrements a frame's reference count, freeing it at zero. Takes
    /// ownership of the `Page` handle so double-frees are a type error, not
    /// a runtime bug, at every call site that still holds a `Page`.
    pub fn put_frame(&mut self, page: Page) {
        self.put_frame_addr(page.into_usize());
    }

    /// Decrements a frame's reference count given only its address, for
    /// callers (unmap paths) that don't hold a `Page` handle because the
    /// frame is still live in a page table entry until this call returns.
    pub fn put_frame_addr(&mut self, paddr: usize) {
        let i = self.frame_index(paddr);
        assert!(self.refcounts[i] > 0, "put_frame_addr: double free");
        self.refcounts[i] -= 1;
    }

    /// Finds `n` contiguous free bits in the kernel virtual-address bitmap
    /// and returns the base kernel virtual address. Frame mapping is the
    /// caller's responsibility (see `alloc_kpages` callers in `vm.rs`).
    pub fn alloc_kvaddr(&mut self, n: usize) -> Option<usize> {
        let base_page = self.kvmap.alloc_contiguous(n)?;
        Some(KERNEL_LOAD_ADDR + base_page * PGSIZE)
    }

    pub fn free_kvaddr(&mut self, vaddr: usize, n: usize) {
        let base_page = (vaddr - KERNEL_LOAD_ADDR) / PGSIZE;
        self.kvmap.free_contiguous(base_page, n);
    }
}

impl Default for PageFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_small(nframes: usize) -> PageFrameAllocator {
        let mut a = PageFrameAllocator::new();
        a.set_range(KERNEL_LOAD_ADDR, KERNEL_LOAD_ADDR + nframes * PGSIZE);
        a
    }

    #[test]
    fn alloc_frame_starts_at_refcount_one() {
        let mut a = init_small(4);
        let page = a.alloc_frame();
        assert_eq!(a.refcount(page.addr()), 1);
        a.put_frame(page);
    }

    #[test]
    fn get_frame_shares_and_put_frame_releases() {
        let mut a = init_small(4);
        let page = a.alloc_frame();
        let paddr = page.addr();
        a.get_frame(paddr);
        assert_eq!(a.refcount(paddr), 2);
        a.put_frame_addr(paddr);
        assert_eq!(a.refcount(paddr), 1);
        a.put_frame(page);
        assert_eq!(a.refcount(paddr), 0);
    }

    #[test]
    fn exhaustion_returns_none_not_panic() {
        let mut a = init_small(4);
        let mut pages: [Option<Page>; 4] = [None, None, None, None];
        for slot in pages.iter_mut() {
            *slot = Some(a.alloc_frame());
        }
        assert!(a.try_alloc_frame().is_none());
        assert_eq!(a.free_frames(), 0);
        for slot in pages.iter_mut() {
            if let Some(p) = core::mem::take(slot) {
                a.put_frame(p);
            }
        }
        assert_eq!(a.free_frames(), 4);
    }

    #[test]
    fn kvaddr_alloc_and_free_round_trip() {
        let mut a = init_small(4);
        let base = a.alloc_kvaddr(3).unwrap();
        a.free_kvaddr(base, 3);
        let base2 = a.alloc_kvaddr(3).unwrap();
        assert_eq!(base, base2);
    }
}
