//! File-related system calls (`SPEC_FULL.md` §6.3): mostly argument
//! checking and fd-table bookkeeping, delegating the actual work to
//! `fs/`, `file.rs`, and `pipe.rs`. Grounded on the teacher's own
//! `sysfile.rs` for the overall shape (`argfd`/`fdalloc` helpers, one
//! `sys_*` method per syscall calling straight into the lower layers) —
//! adapted off its arena-refcounted `RcFile`/`RcInode` onto this crate's
//! fixed-table `FileTable`/`InodeCache`, and onto `syscall::SyscallError`
//! instead of the teacher's `Result<_, ()>`/`usize::MAX` convention.

use crate::buf::BufCache;
use crate::device::DeviceTable;
use crate::exec::{self, ExecError, ExecSource};
use crate::fcntl::OpenFlags;
use crate::file::{FileKind, FileRef, FileTable};
use crate::fs::dentry::namei;
use crate::fs::dir::Dirs;
use crate::fs::inode::{FsError, InodeCache, InodeRef};
use crate::fs::layout::{IFCHR, ROOT_INUM};
use crate::fs::mount::MountTable;
use crate::fs::superblock::SuperBlock;
use crate::fs::SuperBlocks;
use crate::kalloc::PageFrameAllocator;
use crate::param::NOFILE;
use crate::pipe::PipeTable;
use crate::proc::{Pid, TaskTable};
use crate::stat::Stat;
use crate::syscall::SyscallError;
use crate::vm::AddressSpace;
use crate::wait::Blocking;
use zerocopy::AsBytes;

impl From<FsError> for SyscallError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NoSpace => SyscallError::NoSpace,
            FsError::InvalidArgument => SyscallError::InvalidArgument,
            FsError::IsADirectory | FsError::NotADirectory => SyscallError::InvalidArgument,
        }
    }
}

impl From<ExecError> for SyscallError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Elf(_) | ExecError::TooManyArgs | ExecError::StackOverflow => SyscallError::InvalidArgument,
            ExecError::Read => SyscallError::NotFound,
            ExecError::NoMemory => SyscallError::NoSpace,
        }
    }
}

/// `exec::ExecSource` over a pinned inode: reads are short only at true
/// end-of-file, which `exec::exec`'s own segment-size bookkeeping already
/// guarantees it never asks for past `filesz`.
struct InodeExecSource<'a> {
    inodes: &'a mut InodeCache,
    bufs: &'a mut BufCache,
    devices: &'a mut DeviceTable,
    blocking: &'a mut dyn Blocking,
    ino: InodeRef,
    sb: SuperBlock,
}

impl ExecSource for InodeExecSource<'_> {
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), ()> {
        let n = self
            .inodes
            .read(self.ino, buf, offset as u32, &self.sb, self.bufs, self.devices, self.blocking);
        if n == buf.len() {
            Ok(())
        } else {
            Err(())
        }
    }
}

/// Borrowed context for one file-related syscall, mirroring
/// `sysproc.rs`'s `ProcSyscalls<'a>`.
pub struct FileSyscalls<'a> {
    pub tasks: &'a mut TaskTable,
    pub inodes: &'a mut InodeCache,
    pub dentries: &'a mut crate::fs::dentry::DentryCache,
    pub mounts: &'a mut MountTable,
    pub superblocks: &'a mut SuperBlocks,
    pub files: &'a mut FileTable,
    pub pipes: &'a mut PipeTable,
    pub bufs: &'a mut BufCache,
    pub devices: &'a mut DeviceTable,
    pub frames: &'a mut PageFrameAllocator,
    pub current: Pid,
}

impl<'a> FileSyscalls<'a> {
    fn root_sb_index(&self) -> usize {
        0
    }

    fn root_and_cwd(&mut self, blocking: &mut impl Blocking) -> Result<(InodeRef, InodeRef), SyscallError> {
        let sb = *self.superblocks.get(self.root_sb_index());
        let root = match self.tasks.get(self.current).root_inode {
            Some(r) => r,
            None => {
                let r = self.inodes.iget(&sb, ROOT_INUM, self.bufs, self.devices, blocking).ok_or(SyscallError::NoSpace)?;
                self.tasks.get_mut(self.current).root_inode = Some(r);
                r
            }
        };
        let cwd = self.tasks.get(self.current).cwd_inode.unwrap_or(root);
        Ok((root, cwd))
    }

    fn resolve(&mut self, path: &[u8], blocking: &mut impl Blocking) -> Result<(InodeRef, SuperBlock), SyscallError> {
        let sb = *self.superblocks.get(self.root_sb_index());
        let (root, cwd) = self.root_and_cwd(blocking)?;
        let ino = namei(self.dentries, self.inodes, self.mounts, self.superblocks, root, cwd, path, &sb, self.bufs, self.devices, blocking).map_err(SyscallError::from)?;
        // `namei` may have crossed into a mounted file system; the
        // superblock the caller needs from here on is the resolved
        // inode's own, not necessarily the root's.
        let dev = self.inodes.dev(ino);
        let resolved_sb = if dev == sb.dev {
            sb
        } else {
            let idx = self.superblocks.find_by_dev(dev).ok_or(SyscallError::InvalidArgument)?;
            *self.superblocks.get(idx)
        };
        Ok((ino, resolved_sb))
    }

    /// Splits `path` into its parent directory (resolved) and final
    /// component, for the create-family calls that need both.
    fn resolve_parent<'p>(&mut self, path: &'p [u8], blocking: &mut impl Blocking) -> Result<(InodeRef, &'p [u8], SuperBlock), SyscallError> {
        let last_slash = path.iter().rposition(|&b| b == b'/');
        let (dir_path, name) = match last_slash {
            Some(i) => (&path[..i], &path[i + 1..]),
            None => (&b""[..], path),
        };
        if name.is_empty() {
            return Err(SyscallError::InvalidArgument);
        }
        let sb = *self.superblocks.get(self.root_sb_index());
        let (root, cwd) = self.root_and_cwd(blocking)?;
        let dir = if dir_path.is_empty() {
            cwd
        } else {
            namei(self.dentries, self.inodes, self.mounts, self.superblocks, root, cwd, dir_path, &sb, self.bufs, self.devices, blocking).map_err(SyscallError::from)?
        };
        let dev = self.inodes.dev(dir);
        let dir_sb = if dev == sb.dev {
            sb
        } else {
            let idx = self.superblocks.find_by_dev(dev).ok_or(SyscallError::InvalidArgument)?;
            *self.superblocks.get(idx)
        };
        Ok((dir, name, dir_sb))
    }

    fn fdalloc(&mut self, f: FileRef) -> Result<i32, SyscallError> {
        let task = self.tasks.get_mut(self.current);
        for (fd, slot) in task.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(f);
                return Ok(fd as i32);
            }
        }
        Err(SyscallError::NoSpace)
    }

    fn fd_to_file(&self, fd: i32) -> Result<FileRef, SyscallError> {
        if fd < 0 || fd as usize >= NOFILE {
            return Err(SyscallError::InvalidArgument);
        }
        self.tasks.get(self.current).fds[fd as usize].ok_or(SyscallError::InvalidArgument)
    }

    pub fn sys_open(&mut self, path: &[u8], flags: OpenFlags, mode: u16, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let creat = flags.contains(OpenFlags::CREAT);
        let (ino, sb) = match self.resolve(path, blocking) {
            Ok((found_ino, found_sb)) => {
                if creat && flags.contains(OpenFlags::EXCL) {
                    self.inodes.iput(found_ino, self.bufs, blocking);
                    return Err(SyscallError::Exists);
                }
                (found_ino, found_sb)
            }
            Err(SyscallError::InvalidArgument) if creat => {
                let (dir, name, sb) = self.resolve_parent(path, blocking)?;
                let mut dirs = Dirs {
                    inodes: self.inodes,
                    dentries: self.dentries,
                    bufs: self.bufs,
                    devices: self.devices,
                };
                let result = dirs.creat(dir, name, mode, &sb, blocking);
                self.inodes.iput(dir, self.bufs, blocking);
                (result?, sb)
            }
            Err(e) => return Err(e),
        };

        if flags.contains(OpenFlags::TRUNC) && !self.inodes.inode(ino).is_dir() {
            self.inodes.truncate(ino, &sb, self.bufs, self.devices, blocking);
        }

        let kind = if self.inodes.inode(ino).is_device() {
            FileKind::Device {
                major: self.inodes.inode(ino).device_id() as usize,
                dev: sb.dev,
                inode: ino,
            }
        } else {
            FileKind::Inode { dev: sb.dev, inode: ino, off: 0 }
        };
        let file = self.files.alloc(kind, flags.readable(), flags.writable()).ok_or(SyscallError::NoSpace)?;
        match self.fdalloc(file) {
            Ok(fd) => Ok(fd),
            Err(e) => {
                self.files.close(file, self.inodes, self.pipes, self.bufs, blocking);
                Err(e)
            }
        }
    }

    pub fn sys_close(&mut self, fd: i32, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let f = self.fd_to_file(fd)?;
        self.tasks.get_mut(self.current).fds[fd as usize] = None;
        self.files.close(f, self.inodes, self.pipes, self.bufs, blocking);
        Ok(0)
    }

    pub fn sys_read(&mut self, fd: i32, buf: &mut [u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let f = self.fd_to_file(fd)?;
        let sb = *self.superblocks.get(self.root_sb_index());
        let n = self.files.read(f, buf, &sb, self.inodes, self.pipes, self.devices, self.bufs, blocking).map_err(|_| SyscallError::InvalidArgument)?;
        Ok(n as i32)
    }

    pub fn sys_write(&mut self, fd: i32, buf: &[u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let f = self.fd_to_file(fd)?;
        let sb = *self.superblocks.get(self.root_sb_index());
        let n = self.files.write(f, buf, &sb, self.inodes, self.pipes, self.devices, self.bufs, blocking).map_err(|_| SyscallError::NoSpace)?;
        Ok(n as i32)
    }

    pub fn sys_dup(&mut self, fd: i32) -> Result<i32, SyscallError> {
        let f = self.fd_to_file(fd)?;
        let dup = self.files.dup(f);
        self.fdalloc(dup)
    }

    pub fn sys_dup2(&mut self, old_fd: i32, new_fd: i32, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let old = self.fd_to_file(old_fd)?;
        if new_fd < 0 || new_fd as usize >= NOFILE {
            return Err(SyscallError::InvalidArgument);
        }
        if old_fd == new_fd {
            return Ok(new_fd);
        }
        if let Some(existing) = self.tasks.get(self.current).fds[new_fd as usize] {
            self.files.close(existing, self.inodes, self.pipes, self.bufs, blocking);
        }
        let dup = self.files.dup(old);
        self.tasks.get_mut(self.current).fds[new_fd as usize] = Some(dup);
        Ok(new_fd)
    }

    pub fn sys_fstat(&mut self, fd: i32) -> Result<Stat, SyscallError> {
        let f = self.fd_to_file(fd)?;
        self.files.stat(f, self.inodes).map_err(|_| SyscallError::InvalidArgument)
    }

    pub fn sys_stat(&mut self, path: &[u8], blocking: &mut impl Blocking) -> Result<Stat, SyscallError> {
        let (ino, sb) = self.resolve(path, blocking)?;
        let st = Stat::from_disk_inode(sb.dev, self.inodes.nr(ino), self.inodes.inode(ino));
        self.inodes.iput(ino, self.bufs, blocking);
        Ok(st)
    }

    pub fn sys_lseek(&mut self, fd: i32, offset: i32, whence: crate::fcntl::Whence) -> Result<i32, SyscallError> {
        let f = self.fd_to_file(fd)?;
        let cur = self.files.offset(f) as i32;
        let new_off = match whence {
            crate::fcntl::Whence::Set => offset,
            crate::fcntl::Whence::Cur => cur.checked_add(offset).ok_or(SyscallError::InvalidArgument)?,
            crate::fcntl::Whence::End => {
                let size = match self.files.kind(f) {
                    FileKind::Inode { inode, .. } | FileKind::Device { inode, .. } => self.inodes.inode(inode).size as i32,
                    FileKind::Pipe { .. } => return Err(SyscallError::InvalidArgument),
                };
                size.checked_add(offset).ok_or(SyscallError::InvalidArgument)?
            }
        };
        if new_off < 0 {
            return Err(SyscallError::InvalidArgument);
        }
        self.files.seek(f, new_off as u32);
        Ok(new_off)
    }

    pub fn sys_mkdir(&mut self, path: &[u8], mode: u16, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (dir, name, sb) = self.resolve_parent(path, blocking)?;
        let mut dirs = Dirs {
            inodes: self.inodes,
            dentries: self.dentries,
            bufs: self.bufs,
            devices: self.devices,
        };
        let result = dirs.mkdir(dir, name, mode, &sb, blocking);
        self.inodes.iput(dir, self.bufs, blocking);
        result?;
        Ok(0)
    }

    pub fn sys_rmdir(&mut self, path: &[u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (dir, name, sb) = self.resolve_parent(path, blocking)?;
        let mut dirs = Dirs {
            inodes: self.inodes,
            dentries: self.dentries,
            bufs: self.bufs,
            devices: self.devices,
        };
        let result = dirs.rmdir(dir, name, &sb, blocking);
        self.inodes.iput(dir, self.bufs, blocking);
        result?;
        Ok(0)
    }

    pub fn sys_unlink(&mut self, path: &[u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (dir, name, sb) = self.resolve_parent(path, blocking)?;
        let mut dirs = Dirs {
            inodes: self.inodes,
            dentries: self.dentries,
            bufs: self.bufs,
            devices: self.devices,
        };
        let result = dirs.unlink(dir, name, &sb, blocking);
        self.inodes.iput(dir, self.bufs, blocking);
        result?;
        Ok(0)
    }

    pub fn sys_link(&mut self, existing_path: &[u8], new_path: &[u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (existing, sb) = self.resolve(existing_path, blocking)?;
        let (dir, name, _) = self.resolve_parent(new_path, blocking)?;
        let mut dirs = Dirs {
            inodes: self.inodes,
            dentries: self.dentries,
            bufs: self.bufs,
            devices: self.devices,
        };
        let result = dirs.link(existing, dir, name, &sb, blocking);
        self.inodes.iput(existing, self.bufs, blocking);
        self.inodes.iput(dir, self.bufs, blocking);
        result?;
        Ok(0)
    }

    pub fn sys_mknod(&mut self, path: &[u8], dev: u32, mode: u16, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (dir, name, sb) = self.resolve_parent(path, blocking)?;
        let mut dirs = Dirs {
            inodes: self.inodes,
            dentries: self.dentries,
            bufs: self.bufs,
            devices: self.devices,
        };
        let result = dirs.mknod(dir, name, IFCHR, dev, mode, &sb, blocking);
        self.inodes.iput(dir, self.bufs, blocking);
        result?;
        Ok(0)
    }

    pub fn sys_chdir(&mut self, path: &[u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (ino, _) = self.resolve(path, blocking)?;
        if !self.inodes.inode(ino).is_dir() {
            self.inodes.iput(ino, self.bufs, blocking);
            return Err(SyscallError::InvalidArgument);
        }
        if let Some(old) = self.tasks.get(self.current).cwd_inode {
            self.inodes.iput(old, self.bufs, blocking);
        }
        self.tasks.get_mut(self.current).cwd_inode = Some(ino);
        Ok(0)
    }

    pub fn sys_mount(&mut self, dev: u32, target: &[u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (host_inode, host_sb) = self.resolve(target, blocking)?;
        if !self.inodes.inode(host_inode).is_dir() {
            self.inodes.iput(host_inode, self.bufs, blocking);
            return Err(SyscallError::InvalidArgument);
        }
        let sb = match SuperBlock::read(dev, self.bufs, self.devices, blocking) {
            Ok(sb) => sb,
            Err(_) => {
                self.inodes.iput(host_inode, self.bufs, blocking);
                return Err(SyscallError::InvalidArgument);
            }
        };
        let sb_index = match self.superblocks.insert(sb) {
            Some(i) => i,
            None => {
                self.inodes.iput(host_inode, self.bufs, blocking);
                return Err(SyscallError::NoSpace);
            }
        };
        if self
            .mounts
            .mount(host_sb.dev, self.inodes.nr(host_inode), host_inode, self.root_sb_index(), dev, sb_index)
            .is_err()
        {
            self.superblocks.remove(sb_index);
            self.inodes.iput(host_inode, self.bufs, blocking);
            return Err(SyscallError::Busy);
        }
        Ok(0)
    }

    pub fn sys_umount(&mut self, target: &[u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (host_inode, host_sb) = self.resolve(target, blocking)?;
        let result = self.mounts.umount(host_sb.dev, self.inodes.nr(host_inode));
        self.inodes.iput(host_inode, self.bufs, blocking);
        let (pinned, sb_index) = result.ok_or(SyscallError::NotFound)?;
        self.inodes.iput(pinned, self.bufs, blocking);
        self.superblocks.remove(sb_index);
        Ok(0)
    }

    pub fn sys_sync(&mut self, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        self.bufs.sync(self.devices, blocking);
        Ok(0)
    }

    /// `readdir(fd, entry)`: the next non-free entry in the open directory
    /// `fd`, starting from its current offset, writing the raw 16-byte
    /// `DirEntry` into `out`. Returns `DirEntry::SIZE` and advances the fd's
    /// offset on success, `0` once the directory is exhausted.
    pub fn sys_readdir(&mut self, fd: i32, out: &mut [u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let f = self.fd_to_file(fd)?;
        let inode = match self.files.kind(f) {
            FileKind::Inode { inode, .. } => inode,
            FileKind::Pipe { .. } | FileKind::Device { .. } => return Err(SyscallError::InvalidArgument),
        };
        if !self.inodes.inode(inode).is_dir() {
            return Err(SyscallError::InvalidArgument);
        }
        let dev = self.inodes.dev(inode);
        let idx = self.superblocks.find_by_dev(dev).ok_or(SyscallError::InvalidArgument)?;
        let sb = *self.superblocks.get(idx);
        let mut dirs = Dirs {
            inodes: self.inodes,
            dentries: self.dentries,
            bufs: self.bufs,
            devices: self.devices,
        };
        match dirs.readdir(inode, self.files.offset(f), &sb, blocking) {
            Some((entry, next_off)) => {
                let bytes = entry.as_bytes();
                out[..bytes.len()].copy_from_slice(bytes);
                self.files.seek(f, next_off);
                Ok(bytes.len() as i32)
            }
            None => Ok(0),
        }
    }

    /// `getcwd(buf)`: the calling task's absolute path, rebuilt by walking
    /// `..` from its `cwd_inode` up to its `root_inode`.
    pub fn sys_getcwd(&mut self, buf: &mut [u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (root, cwd) = self.root_and_cwd(blocking)?;
        let sb = *self.superblocks.get(self.root_sb_index());
        let mut dirs = Dirs {
            inodes: self.inodes,
            dentries: self.dentries,
            bufs: self.bufs,
            devices: self.devices,
        };
        let n = dirs.getcwd(root, cwd, &sb, buf, blocking)?;
        Ok(n as i32)
    }

    /// Sets the calling task's root directory, the same way `sys_chdir` sets
    /// its cwd — every future absolute path resolves under the new root
    /// instead of the real filesystem root.
    pub fn sys_chroot(&mut self, path: &[u8], blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let (ino, _) = self.resolve(path, blocking)?;
        if !self.inodes.inode(ino).is_dir() {
            self.inodes.iput(ino, self.bufs, blocking);
            return Err(SyscallError::InvalidArgument);
        }
        if let Some(old) = self.tasks.get(self.current).root_inode {
            self.inodes.iput(old, self.bufs, blocking);
        }
        self.tasks.get_mut(self.current).root_inode = Some(ino);
        Ok(0)
    }

    /// Formats `dev` as a fresh MINIX-v1 filesystem of `nzones` zones,
    /// without mounting it — the caller runs `sys_mount` afterward if it
    /// wants the result reachable from the namespace.
    pub fn sys_mkfs(&mut self, dev: u32, nzones: i32, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        if nzones <= 0 || dev as usize >= crate::param::NDEV {
            return Err(SyscallError::InvalidArgument);
        }
        crate::fs::mkfs::mkfs_on(dev, nzones as u16, self.bufs, self.devices, blocking);
        Ok(0)
    }

    /// Issues the console's clear-screen ioctl directly, bypassing
    /// `FileTable`/`BufCache` entirely since there's no file content
    /// involved — grounded the same way `DeviceTable::ioctl` itself is.
    pub fn sys_clear(&mut self, dev: i32) -> Result<i32, SyscallError> {
        if dev < 0 || dev as usize >= crate::param::NDEV {
            return Err(SyscallError::InvalidArgument);
        }
        let result = self.devices.ioctl(dev as usize, crate::device::DEV_CMD_CLEAR);
        if result < 0 {
            Err(SyscallError::InvalidArgument)
        } else {
            Ok(result as i32)
        }
    }

    /// `mmap(addr, len, writable, shared, fd)`: reserves and links the
    /// region via `vm::AddressSpace::sys_mmap`, then, if `fd >= 0`, reads
    /// from the file's current offset into the freshly mapped pages one
    /// `BSIZE` chunk at a time — the same staged-copy shape `copy_read`
    /// uses for an ordinary `read`, since the mapped pages are only
    /// reachable through the task's address space, not a kernel buffer.
    pub fn sys_mmap(&mut self, addr: usize, len: usize, writable: bool, shared: bool, fd: i32, blocking: &mut impl Blocking) -> Result<i32, SyscallError> {
        let mapped = {
            let space = self.tasks.address_space_mut(self.current).ok_or(SyscallError::InvalidArgument)?;
            space.sys_mmap(self.frames, addr, len, writable, shared, None).map_err(|()| SyscallError::NoSpace)?
        };

        if fd >= 0 {
            self.fd_to_file(fd)?;
            let mut cursor = mapped;
            let mut remaining = len;
            while remaining > 0 {
                let chunk = remaining.min(crate::param::BSIZE);
                let mut staging = [0u8; crate::param::BSIZE];
                let n = self.sys_read(fd, &mut staging[..chunk], blocking)? as usize;
                if n == 0 {
                    break;
                }
                let space = self.tasks.address_space_mut(self.current).ok_or(SyscallError::SegmentationFault)?;
                space.copy_out_bytes(cursor, &staging[..n]).map_err(|_| SyscallError::SegmentationFault)?;
                cursor += n;
                remaining -= n;
                if n < chunk {
                    break;
                }
            }
        }

        Ok(mapped as i32)
    }

    /// `munmap(addr, len)`: unlinks and frees every page in `[addr, addr+len)`.
    pub fn sys_munmap(&mut self, addr: usize, len: usize) -> Result<i32, SyscallError> {
        let space = self.tasks.address_space_mut(self.current).ok_or(SyscallError::InvalidArgument)?;
        space.sys_munmap(self.frames, addr, len).map(|()| 0).map_err(|()| SyscallError::InvalidArgument)
    }

    /// Releases every fs/file resource the calling task still holds
    /// (`root_inode`, `cwd_inode`, every open fd) without touching its
    /// scheduling state. `proc::TaskTable::exit` clears those same fields
    /// unconditionally, so the caller must run this first — `exit` has no
    /// way to release them itself, since it doesn't borrow `fs`/`file`
    /// state (see its own doc comment).
    pub fn sys_exit_fs(&mut self, blocking: &mut impl Blocking) {
        let task = self.tasks.get_mut(self.current);
        let root = task.root_inode.take();
        let cwd = task.cwd_inode.take();
        let fds = core::mem::replace(&mut task.fds, [None; NOFILE]);

        if let Some(root) = root {
            self.inodes.iput(root, self.bufs, blocking);
        }
        if let Some(cwd) = cwd {
            self.inodes.iput(cwd, self.bufs, blocking);
        }
        for f in fds.into_iter().flatten() {
            self.files.close(*f, self.inodes, self.pipes, self.bufs, blocking);
        }
    }

    /// Replaces the calling task's program image. Builds the new address
    /// space fully before touching the old one, so a failed `execve` leaves
    /// the caller exactly as it found it — the same all-or-nothing promise
    /// `exec::exec`'s own doc comment makes about a single address space.
    ///
    /// Returns the `ExecImage` for the caller (`trap.rs`, once it exists) to
    /// forge the task's initial register frame from; this method only
    /// handles the fs/memory side of the swap, the same division
    /// `sysproc.rs`'s `sys_waitpid` draws around its own status-copy-out.
    pub fn sys_execve(
        &mut self,
        path: &[u8],
        argv: &[&[u8]],
        envp: &[&[u8]],
        blocking: &mut impl Blocking,
    ) -> Result<exec::ExecImage, SyscallError> {
        let (ino, sb) = self.resolve(path, blocking)?;
        if self.inodes.inode(ino).is_dir() {
            self.inodes.iput(ino, self.bufs, blocking);
            return Err(SyscallError::InvalidArgument);
        }

        let mut new_space = match AddressSpace::new(self.frames) {
            Some(s) => s,
            None => {
                self.inodes.iput(ino, self.bufs, blocking);
                return Err(SyscallError::NoSpace);
            }
        };
        let mut source = InodeExecSource {
            inodes: self.inodes,
            bufs: self.bufs,
            devices: self.devices,
            blocking,
            ino,
            sb,
        };
        let result = exec::exec(&mut new_space, self.frames, &mut source, argv, envp);
        self.inodes.iput(ino, self.bufs, blocking);

        let image = match result {
            Ok(image) => image,
            Err(e) => {
                new_space.free_pde(self.frames);
                return Err(SyscallError::from(e));
            }
        };
        new_space.set_brk_after_exec(image.image_end);

        let task = self.tasks.get_mut(self.current);
        if let Some(old_space) = task.address_space.replace(new_space) {
            old_space.free_pde(self.frames);
        }
        task.image_text = image.image_text;
        task.image_data = image.image_data;
        task.image_end = image.image_end;
        task.heap_end = image.image_end;

        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSubtype, DeviceType, DriverOps};
    use crate::fs::mkfs;
    use crate::kalloc::PageFrameAllocator;
    use crate::sched::Scheduler;
    use crate::wait::NeverBlocks;

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

    fn setup() -> (TaskTable, Scheduler, PageFrameAllocator, BufCache, DeviceTable, NeverBlocks) {
        let mut tasks = TaskTable::new();
        let mut scheduler = Scheduler::new();
        let frames = PageFrameAllocator::new();
        tasks.debug_spawn_for_test(crate::proc::INIT_PID, 0);
        scheduler.spawn_at(crate::proc::INIT_PID as crate::sched::TaskId, 0);
        scheduler.schedule();
        let mut devices = DeviceTable::new();
        devices.register(0, DeviceType::Block, DeviceSubtype::RamDisk, None, ramdisk_ops());
        (tasks, scheduler, frames, BufCache::new(), devices, NeverBlocks)
    }

    #[test]
    fn creat_then_write_then_read_round_trips() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let sb = mkfs::mkfs_on(0, 4096, &mut bufs, &mut devices, &mut blocking);
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        superblocks.insert(sb);
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };

        let fd = sys.sys_open(b"hello.txt", OpenFlags::CREAT | OpenFlags::RDWR, 0o644, &mut blocking).unwrap();
        let n = sys.sys_write(fd, b"hi there", &mut blocking).unwrap();
        assert_eq!(n as usize, 8);
        sys.sys_lseek(fd, 0, crate::fcntl::Whence::Set).unwrap();
        let mut out = [0u8; 16];
        let n = sys.sys_read(fd, &mut out, &mut blocking).unwrap();
        assert_eq!(&out[..n as usize], b"hi there");
        sys.sys_close(fd, &mut blocking).unwrap();
    }

    #[test]
    fn open_without_creat_on_a_missing_path_fails() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let sb = mkfs::mkfs_on(0, 4096, &mut bufs, &mut devices, &mut blocking);
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        superblocks.insert(sb);
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };

        assert_eq!(sys.sys_open(b"missing.txt", OpenFlags::RDONLY, 0, &mut blocking), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn mkdir_then_chdir_then_relative_open_finds_the_file() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let sb = mkfs::mkfs_on(0, 4096, &mut bufs, &mut devices, &mut blocking);
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        superblocks.insert(sb);
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        sys.sys_mkdir(b"sub", 0o755, &mut blocking).unwrap();
        sys.sys_chdir(b"sub", &mut blocking).unwrap();
        let fd = sys.sys_open(b"inner.txt", OpenFlags::CREAT | OpenFlags::RDWR, 0o644, &mut blocking).unwrap();
        assert!(fd >= 0);
    }

    #[test]
    fn exit_fs_releases_the_cwd_pin_and_every_open_fd() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let sb = mkfs::mkfs_on(0, 4096, &mut bufs, &mut devices, &mut blocking);
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        superblocks.insert(sb);
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        sys.sys_mkdir(b"sub", 0o755, &mut blocking).unwrap();
        sys.sys_chdir(b"sub", &mut blocking).unwrap();
        let cwd = tasks.get(crate::proc::INIT_PID).cwd_inode.unwrap();
        assert_eq!(inodes.refcount(cwd), 1);

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        let fd = sys.sys_open(b"inner.txt", OpenFlags::CREAT | OpenFlags::RDWR, 0o644, &mut blocking).unwrap();
        assert!(fd >= 0);

        sys.sys_exit_fs(&mut blocking);
        assert_eq!(inodes.refcount(cwd), 0);
        assert!(sys.fd_to_file(fd).is_err());
    }

    #[test]
    fn readdir_on_a_fresh_subdirectory_yields_dot_and_dotdot_then_stops() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let sb = mkfs::mkfs_on(0, 4096, &mut bufs, &mut devices, &mut blocking);
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        superblocks.insert(sb);
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        sys.sys_mkdir(b"sub", 0o755, &mut blocking).unwrap();
        let fd = sys.sys_open(b"sub", OpenFlags::RDONLY, 0, &mut blocking).unwrap();

        let mut seen = 0;
        let mut buf = [0u8; crate::fs::layout::DirEntry::SIZE];
        while sys.sys_readdir(fd, &mut buf, &mut blocking).unwrap() > 0 {
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn getcwd_after_chdir_reports_the_new_directory() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let sb = mkfs::mkfs_on(0, 4096, &mut bufs, &mut devices, &mut blocking);
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        superblocks.insert(sb);
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        sys.sys_mkdir(b"sub", 0o755, &mut blocking).unwrap();
        sys.sys_chdir(b"sub", &mut blocking).unwrap();

        let mut buf = [0u8; crate::param::MAXPATH];
        let n = sys.sys_getcwd(&mut buf, &mut blocking).unwrap();
        assert_eq!(&buf[..n as usize], b"/sub");
    }

    #[test]
    fn chroot_replaces_the_root_inode_used_by_later_resolves() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let sb = mkfs::mkfs_on(0, 4096, &mut bufs, &mut devices, &mut blocking);
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        superblocks.insert(sb);
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        sys.sys_mkdir(b"sub", 0o755, &mut blocking).unwrap();
        sys.sys_chroot(b"sub", &mut blocking).unwrap();
        let fd = sys.sys_open(b"/", OpenFlags::RDONLY, 0, &mut blocking).unwrap();
        let st = sys.sys_fstat(fd).unwrap();
        assert_eq!(st.ino, tasks.get(crate::proc::INIT_PID).root_inode.map(|r| inodes.nr(r)).unwrap());
    }

    #[test]
    fn mkfs_rejects_a_zero_zone_count() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        assert_eq!(sys.sys_mkfs(0, 0, &mut blocking), Err(SyscallError::InvalidArgument));
        assert_eq!(sys.sys_mkfs(0, 4096, &mut blocking), Ok(0));
    }

    #[test]
    fn clear_reaches_the_registered_console_driver() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        assert_eq!(sys.sys_clear(0), Ok(0));
        assert_eq!(sys.sys_clear(-1), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn mmap_rejects_an_unaligned_address_without_touching_the_page_tables() {
        let (mut tasks, _scheduler, mut frames, mut bufs, mut devices, mut blocking) = setup();
        let mut inodes = InodeCache::new();
        let mut dentries = crate::fs::dentry::DentryCache::new();
        let mut mounts = MountTable::new();
        let mut superblocks = SuperBlocks::new();
        let mut files = FileTable::new();
        let mut pipes = PipeTable::new();

        let mut sys = FileSyscalls {
            tasks: &mut tasks,
            inodes: &mut inodes,
            dentries: &mut dentries,
            mounts: &mut mounts,
            superblocks: &mut superblocks,
            files: &mut files,
            pipes: &mut pipes,
            bufs: &mut bufs,
            devices: &mut devices,
            frames: &mut frames,
            current: crate::proc::INIT_PID,
        };
        assert_eq!(sys.sys_mmap(1, 4096, true, false, -1, &mut blocking), Err(SyscallError::NoSpace));
    }
}
