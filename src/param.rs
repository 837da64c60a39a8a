//! Compile-time sizing constants for every fixed-capacity table in the kernel.
//!
//! Nothing here grows at run time: the kernel has no heap, so every cache
//! (tasks, buffers, inodes, devices) is a fixed-size array sized by one of
//! these constants.

/// Maximum number of tasks (processes + kernel threads).
pub const NPROC: usize = 64;

/// Open files per process (fixed fd table size).
pub const NOFILE: usize = 16;

/// Open file objects system-wide.
pub const NFILE: usize = 128;

/// Maximum number of cached in-memory inodes.
pub const NINODE: usize = 64;

/// Maximum number of mounted file systems.
pub const NMOUNT: usize = 8;

/// Maximum number of device-table entries.
pub const NDEV: usize = 16;

/// Device number of the boot file system.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size in bytes (matches MINIX's 1 KiB zone == 2 disk sectors).
pub const BSIZE: usize = 1024;

/// Sector size of the underlying block device.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per block.
pub const SECTORS_PER_BLOCK: usize = BSIZE / SECTOR_SIZE;

/// Size of the buffer cache (number of cached blocks).
pub const NBUF: usize = 128;

/// Maximum number of queued requests per device.
pub const NREQUEST: usize = 64;

/// Maximum file path name, including the NUL terminator.
pub const MAXPATH: usize = 128;

/// Maximum length of a single path component (MINIX directory entry name).
pub const DIRSIZ: usize = 14;

/// Maximum length of a process name, for debugging/`ps`.
pub const MAXPROCNAME: usize = 16;

/// Dentry cache capacity.
pub const NDENTRY: usize = 256;

/// Clock tick period, in milliseconds.
pub const TICK_MS: u64 = 10;

/// `nice(0)` scheduling weight, i.e. `sched_prio_to_weight[20]`.
pub const NICE0_WEIGHT: u64 = 1024;

/// Scheduling latency target, in ticks: every ready task should run at
/// least once within this many ticks when the ready queue isn't deeper than
/// `NPROC`.
pub const SCHED_LATENCY_TICKS: u64 = 10;

/// Minimum time slice, in ticks.
pub const MIN_TIMESLICE_TICKS: u64 = 1;

/// Sleeper fairness credit, in ticks, subtracted from vruntime on wakeup so
/// a task that slept briefly doesn't lose its place unfairly.
pub const SCHED_WAKEUP_GRAN_TICKS: u64 = 1;

/// Ring-buffer capacity of a single pipe, in bytes.
pub const PIPE_SIZE: usize = 512;

/// Maximum number of simultaneously open pipes.
pub const NPIPE: usize = 32;
