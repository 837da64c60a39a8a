//! An owned handle to a single physical page frame.
//!
//! `Page` is intended to be consumed exactly once, either by mapping it into
//! a page table (`into_usize`) or by handing it back to the frame allocator
//! (`PageFrameAllocator::free`).

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use crate::addr::PGSIZE;

#[repr(align(4096))]
pub struct RawPage {
    pub bytes: [u8; PGSIZE],
}

/// An owned physical page, identified by its physical address.
///
/// # Safety
/// The address must refer to a page frame this kernel owns exclusively: not
/// aliased by any other live `Page`.
pub struct Page(usize);

impl Page {
    /// # Safety
    /// `addr` must be page-aligned and must refer to a frame not already
    /// owned by another live `Page`.
    pub unsafe fn from_usize(addr: usize) -> Self {
        debug_assert_eq!(addr % PGSIZE, 0, "Page::from_usize: misaligned address");
        Self(addr)
    }

    /// Consumes the handle, returning its physical address without running `Drop`.
    pub fn into_usize(self) -> usize {
        let addr = self.0;
        let _ = ManuallyDrop::new(self);
        addr
    }

    pub fn addr(&self) -> usize {
        self.0
    }

    fn as_raw(&self) -> *mut RawPage {
        self.0 as *mut RawPage
    }
}

impl Deref for Page {
    type Target = RawPage;

    fn deref(&self) -> &Self::Target {
        // SAFETY: a live `Page` owns its frame exclusively.
        unsafe { &*self.as_raw() }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: a live `Page` owns its frame exclusively.
        unsafe { &mut *self.as_raw() }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // Every live `Page` must be consumed by `into_usize` or by the
        // allocator's `free`; a silent drop would hide a leaked or
        // use-after-freed frame.
        panic!("Page dropped without being freed or installed");
    }
}
