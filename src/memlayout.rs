//! Virtual memory map, per the platform's fixed x86 layout (see `SPEC_FULL.md` §6.5).
//!
//! The kernel is identity-mapped into the bottom 16 MiB of every address
//! space; user images start right above it. Unlike the RISC-V teaching
//! kernel this design is descended from (which relocates the kernel to the
//! top of the address space behind a trampoline page), this kernel keeps the
//! classic MINIX/xv6-x86 scheme of a low, identity-mapped kernel shared by
//! every page directory.

#![allow(dead_code)]

use static_assertions::const_assert;

use crate::addr::PGSIZE;

/// Total physical/virtual memory reserved for the kernel (identity-mapped).
pub const KERNEL_MEM: usize = 16 * 1024 * 1024;

/// Number of leading page-directory entries that map the shared, permanent
/// kernel region. These entries are installed identically (by value, not by
/// copy of the underlying table) in every process's page directory and are
/// never walked by `copy_pde`/`free_pde`.
pub const KERNEL_PDE_COUNT: usize = KERNEL_MEM / (crate::addr::PLSIZE * PGSIZE);

/// Physical address of the kernel's own page directory, in the low-memory
/// area reserved for boot-time structures (below where the frame allocator
/// starts handing out pages).
pub const KERNEL_PAGE_DIR: usize = 0x0000_1000;

/// Lowest legal physical address a frame allocator may hand out; memory
/// below this is reserved for real-mode structures, the kernel image, and
/// the boot page tables.
pub const KERNEL_LOAD_ADDR: usize = 0x0010_0000;

/// A reserved pair of virtual pages, inside the identity-mapped kernel
/// region, used to temporarily map an arbitrary physical frame that falls
/// outside that region (e.g. a user frame on a machine with more than
/// `KERNEL_MEM` of RAM) so the kernel can read or write its bytes. Two
/// slots exist so a copy between two such frames (`copy_pde`) never needs
/// more than one temporary mapping live at a time per side.
pub const TEMP_MAP_SRC_VA: usize = 0x0070_0000;
pub const TEMP_MAP_DST_VA: usize = 0x0070_1000;

/// Buffer-cache backing region (bump-allocated `Buffer` storage).
pub const BUFFER_REGION_START: usize = 0x0080_0000;
pub const BUFFER_REGION_END: usize = 0x00C0_0000;

/// RAM-disk backing region, used by the in-memory block device driver.
pub const RAMDISK_REGION_START: usize = 0x00C0_0000;
pub const RAMDISK_REGION_END: usize = KERNEL_MEM;

/// First byte of user-space: where `execve` places the ELF image.
pub const USER_EXEC_ADDR: usize = KERNEL_MEM;

/// Start of the user `mmap` window.
pub const USER_MMAP_ADDR: usize = 0x0800_0000;

/// One past the end of the user `mmap` window.
pub const USER_MMAP_LIMIT: usize = 0x0FC0_0000;

/// Lowest address demand-paged in for the user stack.
pub const USER_STACK_BOTTOM: usize = 0x0FC0_0000;

/// One past the top of user space; `esp` starts here minus a few words.
pub const USER_STACK_TOP: usize = 0x1000_0000;

const_assert!(TEMP_MAP_DST_VA + PGSIZE <= BUFFER_REGION_START);
const_assert!(USER_STACK_BOTTOM == USER_MMAP_LIMIT);
const_assert!(USER_MMAP_ADDR < USER_MMAP_LIMIT);
const_assert!(USER_EXEC_ADDR < USER_MMAP_ADDR);
