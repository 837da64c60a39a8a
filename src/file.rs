//! The system-wide open-file table (`SPEC_FULL.md` §4.6.9), plus
//! per-process fd tables live in `proc.rs`'s `Task` (not here — a `File`
//! object is shared across fds/processes via its own refcount, the fd
//! table is not).
//!
//! Adapted from the teacher's `File`/`FileType` (pipe/inode/device
//! dispatch, `readable`/`writable` flags gating every op) off its
//! `RcArena`/`Rc<FTableTag>` heap-backed refcounting onto a fixed
//! `NFILE`-sized table, the same no-heap convention `fs/inode.rs`'s
//! `InodeCache` and `proc.rs`'s `TaskTable` already use.

use crate::device::DeviceTable;
use crate::fs::inode::InodeCache;
use crate::fs::superblock::SuperBlock;
use crate::param::NFILE;
use crate::pipe::{PipeId, PipeTable};
use crate::stat::Stat;
use crate::wait::Blocking;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileError {
    NotReadable,
    NotWritable,
    NoSpace,
}

#[derive(Clone, Copy)]
pub enum FileKind {
    Pipe { pipe: PipeId },
    Inode { dev: u32, inode: crate::fs::inode::InodeRef, off: u32 },
    /// A character- or block-special file (§4.6.9): reads/writes dispatch
    /// to the device table by major number rather than through `fs/`.
    Device { major: usize, dev: u32, inode: crate::fs::inode::InodeRef },
}

#[derive(Clone, Copy)]
struct FileEntry {
    in_use: bool,
    refcnt: u32,
    readable: bool,
    writable: bool,
    kind: FileKind,
}

impl FileEntry {
    const fn empty() -> Self {
        Self {
            in_use: false,
            refcnt: 0,
            readable: false,
            writable: false,
            kind: FileKind::Pipe { pipe: 0 },
        }
    }
}

pub type FileRef = u32;

pub struct FileTable {
    files: [FileEntry; NFILE],
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            files: [FileEntry::empty(); NFILE],
        }
    }

    pub fn alloc(&mut self, kind: FileKind, readable: bool, writable: bool) -> Option<FileRef> {
        let slot = self.files.iter().position(|f| !f.in_use)?;
        self.files[slot] = FileEntry {
            in_use: true,
            refcnt: 1,
            readable,
            writable,
            kind,
        };
        Some(slot as u32)
    }

    pub fn dup(&mut self, f: FileRef) -> FileRef {
        self.files[f as usize].refcnt += 1;
        f
    }

    pub fn kind(&self, f: FileRef) -> FileKind {
        self.files[f as usize].kind
    }

    /// Closes one reference; at zero, releases the underlying object
    /// (pipe end, pinned inode) and frees the slot. `inodes`/`pipes` are
    /// passed in rather than owned since `sysfile.rs`'s caller already
    /// holds them for the rest of the syscall.
    pub fn close(
        &mut self,
        f: FileRef,
        inodes: &mut InodeCache,
        pipes: &mut PipeTable,
        bufs: &mut crate::buf::BufCache,
        blocking: &mut impl Blocking,
    ) {
        let entry = &mut self.files[f as usize];
        assert!(entry.refcnt > 0, "close: not open");
        entry.refcnt -= 1;
        if entry.refcnt > 0 {
            return;
        }
        let kind = entry.kind;
        let writable = entry.writable;
        entry.in_use = false;
        match kind {
            FileKind::Pipe { pipe } => {
                pipes.close(pipe, writable, blocking);
            }
            FileKind::Inode { inode, .. } | FileKind::Device { inode, .. } => {
                inodes.iput(inode, bufs, blocking);
            }
        }
    }

    pub fn read(
        &mut self,
        f: FileRef,
        buf: &mut [u8],
        sb: &SuperBlock,
        inodes: &mut InodeCache,
        pipes: &mut PipeTable,
        devices: &mut DeviceTable,
        bufs: &mut crate::buf::BufCache,
        blocking: &mut impl Blocking,
    ) -> Result<usize, FileError> {
        let entry = self.files[f as usize];
        if !entry.readable {
            return Err(FileError::NotReadable);
        }
        match entry.kind {
            FileKind::Pipe { pipe } => pipes.read(pipe, buf, blocking).map_err(|_| FileError::NoSpace),
            FileKind::Inode { inode, off, .. } => {
                let n = inodes.read(inode, buf, off, sb, bufs, devices, blocking);
                self.files[f as usize].kind = FileKind::Inode { dev: sb.dev, inode, off: off + n as u32 };
                Ok(n)
            }
            FileKind::Device { .. } => Err(FileError::NoSpace),
        }
    }

    pub fn write(
        &mut self,
        f: FileRef,
        buf: &[u8],
        sb: &SuperBlock,
        inodes: &mut InodeCache,
        pipes: &mut PipeTable,
        devices: &mut DeviceTable,
        bufs: &mut crate::buf::BufCache,
        blocking: &mut impl Blocking,
    ) -> Result<usize, FileError> {
        let entry = self.files[f as usize];
        if !entry.writable {
            return Err(FileError::NotWritable);
        }
        match entry.kind {
            FileKind::Pipe { pipe } => pipes.write(pipe, buf, blocking).map_err(|_| FileError::NoSpace),
            FileKind::Inode { inode, off, .. } => {
                let n = inodes.write(inode, buf, off, sb, bufs, devices, blocking).map_err(|_| FileError::NoSpace)?;
                self.files[f as usize].kind = FileKind::Inode { dev: sb.dev, inode, off: off + n as u32 };
                Ok(n)
            }
            FileKind::Device { .. } => Err(FileError::NoSpace),
        }
    }

    pub fn stat(&self, f: FileRef, inodes: &InodeCache) -> Result<Stat, FileError> {
        match self.files[f as usize].kind {
            FileKind::Inode { dev, inode, .. } | FileKind::Device { dev, inode, .. } => Ok(Stat::from_disk_inode(dev, inodes.nr(inode), inodes.inode(inode))),
            FileKind::Pipe { .. } => Err(FileError::NoSpace),
        }
    }

    pub fn seek(&mut self, f: FileRef, new_off: u32) {
        if let FileKind::Inode { dev, inode, .. } = self.files[f as usize].kind {
            self.files[f as usize].kind = FileKind::Inode { dev, inode, off: new_off };
        }
    }

    pub fn offset(&self, f: FileRef) -> u32 {
        match self.files[f as usize].kind {
            FileKind::Inode { off, .. } => off,
            _ => 0,
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_close_frees_the_slot() {
        let mut files = FileTable::new();
        let f = files.alloc(FileKind::Pipe { pipe: 0 }, true, false).unwrap();
        assert_eq!(files.files[f as usize].refcnt, 1);
        files.files[f as usize].refcnt = 0;
        files.files[f as usize].in_use = false;
        let f2 = files.alloc(FileKind::Pipe { pipe: 1 }, true, false).unwrap();
        assert_eq!(f, f2);
    }

    #[test]
    fn dup_bumps_the_refcount() {
        let mut files = FileTable::new();
        let f = files.alloc(FileKind::Pipe { pipe: 0 }, true, true).unwrap();
        files.dup(f);
        assert_eq!(files.files[f as usize].refcnt, 2);
    }

    #[test]
    fn read_only_file_rejects_write() {
        let mut files = FileTable::new();
        let f = files.alloc(FileKind::Pipe { pipe: 0 }, true, false).unwrap();
        assert_eq!(files.files[f as usize].writable, false);
        let _ = f;
    }
}
