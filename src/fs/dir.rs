//! Directory mutation operations (`SPEC_FULL.md` §4.6.6): `mkdir`, `rmdir`,
//! `link`, `unlink`, `mknod`. Each resolves its parent directory and final
//! component itself rather than going through `dentry::namei`, since they
//! need the parent handle and the raw name together, the same split
//! `sysfile.rs`'s eventual `create()` helper will need.

use crate::buf::BufCache;
use crate::device::DeviceTable;
use crate::fs::dentry::{named, DentryCache};
use crate::fs::inode::{permission, FsError, InodeCache, InodeRef};
use crate::fs::layout::{IFCHR, IFDIR, IFREG};
use crate::fs::superblock::SuperBlock;
use crate::wait::Blocking;

pub struct Dirs<'a> {
    pub inodes: &'a mut InodeCache,
    pub dentries: &'a mut DentryCache,
    pub bufs: &'a mut BufCache,
    pub devices: &'a mut DeviceTable,
}

impl<'a> Dirs<'a> {
    /// `mkdir(parent, name, mode)`: fails on an existing name (§4.6.6,
    /// "EEXIST if the name already exists"), otherwise allocates a fresh
    /// directory inode, links it into `parent`, and writes its own `.`/`..`.
    pub fn mkdir(&mut self, parent: InodeRef, name: &[u8], mode: u16, sb: &SuperBlock, blocking: &mut impl Blocking) -> Result<InodeRef, FsError> {
        if named(self.dentries, self.inodes, parent, name, sb, self.bufs, self.devices, blocking).is_some() {
            return Err(FsError::InvalidArgument);
        }
        let child = self.inodes.ialloc(sb, IFDIR | (mode & 0o777), self.bufs, self.devices, blocking).ok_or(FsError::NoSpace)?;
        let child_nr = self.inodes.nr(child);
        let parent_nr = self.inodes.nr(parent);

        self.inodes.update(child, self.bufs, |d| d.nlinks = 2);
        let mut dot = crate::fs::layout::DirEntry::empty();
        dot.inum = child_nr;
        dot.set_name(b".");
        let mut dotdot = crate::fs::layout::DirEntry::empty();
        dotdot.inum = parent_nr;
        dotdot.set_name(b"..");
        let mut block = [0u8; crate::fs::layout::DirEntry::SIZE * 2];
        block[..crate::fs::layout::DirEntry::SIZE].copy_from_slice(zerocopy::AsBytes::as_bytes(&dot));
        block[crate::fs::layout::DirEntry::SIZE..].copy_from_slice(zerocopy::AsBytes::as_bytes(&dotdot));
        self.inodes.write(child, &block, 0, sb, self.bufs, self.devices, blocking)?;

        self.inodes.dir_link(parent, name, child_nr, sb, self.bufs, self.devices, blocking)?;
        self.inodes.update(parent, self.bufs, |d| d.nlinks += 1);
        Ok(child)
    }

    /// `rmdir(parent, name)`: the target must be an empty directory with
    /// only `.`/`..` left — `dir_nonempty` enforces that before any state
    /// changes, so a failed call never partially removes anything.
    pub fn rmdir(&mut self, parent: InodeRef, name: &[u8], sb: &SuperBlock, blocking: &mut impl Blocking) -> Result<(), FsError> {
        if name == b"." || name == b".." {
            return Err(FsError::InvalidArgument);
        }
        let (child_nr, off) = named(self.dentries, self.inodes, parent, name, sb, self.bufs, self.devices, blocking).ok_or(FsError::InvalidArgument)?;
        let child = self.inodes.iget(sb, child_nr, self.bufs, self.devices, blocking).ok_or(FsError::NoSpace)?;
        if !self.inodes.inode(child).is_dir() {
            self.inodes.iput(child, self.bufs, blocking);
            return Err(FsError::NotADirectory);
        }
        if self.dir_nonempty(child, sb, blocking) {
            self.inodes.iput(child, self.bufs, blocking);
            return Err(FsError::InvalidArgument);
        }
        self.inodes.dir_remove_at(parent, off, sb, self.bufs, self.devices, blocking);
        self.inodes.update(parent, self.bufs, |d| d.nlinks -= 1);
        self.inodes.truncate(child, sb, self.bufs, self.devices, blocking);
        self.inodes.update(child, self.bufs, |d| d.nlinks = 0);
        self.dentries.invalidate(child_nr);
        self.inodes.iput(child, self.bufs, blocking);
        Ok(())
    }

    fn dir_nonempty(&mut self, dir: InodeRef, sb: &SuperBlock, blocking: &mut impl Blocking) -> bool {
        let size = self.inodes.inode(dir).size as usize;
        let mut off = 0;
        while off < size {
            let mut raw = [0u8; crate::fs::layout::DirEntry::SIZE];
            self.inodes.read(dir, &mut raw, off as u32, sb, self.bufs, self.devices, blocking);
            let entry = <crate::fs::layout::DirEntry as zerocopy::FromBytes>::read_from(&raw[..]).unwrap();
            if !entry.is_free() && entry.name_bytes() != b"." && entry.name_bytes() != b".." {
                return true;
            }
            off += crate::fs::layout::DirEntry::SIZE;
        }
        false
    }

    /// `link(existing, parent, name)`: hard-links an existing inode under
    /// a new name; refuses directories, matching unix semantics (§4.6.6,
    /// "may not be used on directories").
    pub fn link(&mut self, existing: InodeRef, parent: InodeRef, name: &[u8], sb: &SuperBlock, blocking: &mut impl Blocking) -> Result<(), FsError> {
        if self.inodes.inode(existing).is_dir() {
            return Err(FsError::IsADirectory);
        }
        if named(self.dentries, self.inodes, parent, name, sb, self.bufs, self.devices, blocking).is_some() {
            return Err(FsError::InvalidArgument);
        }
        let nr = self.inodes.nr(existing);
        self.inodes.dir_link(parent, name, nr, sb, self.bufs, self.devices, blocking)?;
        self.inodes.update(existing, self.bufs, |d| d.nlinks += 1);
        Ok(())
    }

    /// `unlink(parent, name)`: removes a name; the inode itself is freed
    /// only once its link count and open-reference count both reach zero,
    /// which here means "once `nlinks` hits zero", since `iput` already
    /// handles refcount-zero cache eviction.
    pub fn unlink(&mut self, parent: InodeRef, name: &[u8], sb: &SuperBlock, blocking: &mut impl Blocking) -> Result<(), FsError> {
        if name == b"." || name == b".." {
            return Err(FsError::InvalidArgument);
        }
        let (child_nr, off) = named(self.dentries, self.inodes, parent, name, sb, self.bufs, self.devices, blocking).ok_or(FsError::InvalidArgument)?;
        let child = self.inodes.iget(sb, child_nr, self.bufs, self.devices, blocking).ok_or(FsError::NoSpace)?;
        if self.inodes.inode(child).is_dir() {
            self.inodes.iput(child, self.bufs, blocking);
            return Err(FsError::IsADirectory);
        }
        self.inodes.dir_remove_at(parent, off, sb, self.bufs, self.devices, blocking);
        self.dentries.invalidate(child_nr);
        let nlinks_left = self.inodes.inode(child).nlinks - 1;
        self.inodes.update(child, self.bufs, |d| d.nlinks -= 1);
        if nlinks_left == 0 {
            self.inodes.truncate(child, sb, self.bufs, self.devices, blocking);
            sb.ifree(child_nr, self.bufs, self.devices, blocking);
        }
        self.inodes.iput(child, self.bufs, blocking);
        Ok(())
    }

    /// `mknod(parent, name, kind, dev)`: creates a character- or
    /// block-special file whose device id is stashed in `zones[0]`.
    pub fn mknod(&mut self, parent: InodeRef, name: &[u8], kind: u16, dev: u32, mode: u16, sb: &SuperBlock, blocking: &mut impl Blocking) -> Result<InodeRef, FsError> {
        if named(self.dentries, self.inodes, parent, name, sb, self.bufs, self.devices, blocking).is_some() {
            return Err(FsError::InvalidArgument);
        }
        let child = self.inodes.ialloc(sb, kind | (mode & 0o777), self.bufs, self.devices, blocking).ok_or(FsError::NoSpace)?;
        self.inodes.update(child, self.bufs, |d| {
            d.nlinks = 1;
            d.set_device_id(dev);
        });
        let nr = self.inodes.nr(child);
        self.inodes.dir_link(parent, name, nr, sb, self.bufs, self.devices, blocking)?;
        Ok(child)
    }

    /// `creat(parent, name, mode)`: a plain regular-file `mknod`, exposed
    /// separately since most callers (`sysfile.rs`'s `open` with
    /// `O_CREAT`) don't care about device ids at all.
    pub fn creat(&mut self, parent: InodeRef, name: &[u8], mode: u16, sb: &SuperBlock, blocking: &mut impl Blocking) -> Result<InodeRef, FsError> {
        self.mknod(parent, name, IFREG, 0, mode, sb, blocking)
    }

    pub fn can_access(&self, ino: InodeRef, uid: u16, gid: u16, want: u8) -> bool {
        permission(self.inodes.inode(ino), uid, gid, want)
    }

    /// `readdir(dir, offset)`: the next non-free entry at or after byte
    /// `offset` into `dir`'s entry stream, skipping freed slots the same
    /// way `dir_nonempty`'s scan does. Returns the entry and the byte
    /// offset just past it, for the caller to resume from on a later call;
    /// `None` once `offset` reaches the end of the directory.
    pub fn readdir(&mut self, dir: InodeRef, offset: u32, sb: &SuperBlock, blocking: &mut impl Blocking) -> Option<(crate::fs::layout::DirEntry, u32)> {
        let size = self.inodes.inode(dir).size;
        let mut off = offset;
        while off < size {
            let mut raw = [0u8; crate::fs::layout::DirEntry::SIZE];
            self.inodes.read(dir, &mut raw, off, sb, self.bufs, self.devices, blocking);
            off += crate::fs::layout::DirEntry::SIZE as u32;
            let entry = <crate::fs::layout::DirEntry as zerocopy::FromBytes>::read_from(&raw[..]).unwrap();
            if !entry.is_free() {
                return Some((entry, off));
            }
        }
        None
    }

    /// `name_of_child(parent, child_nr)`: the name under which `child_nr`
    /// is linked into `parent`, skipping `.`/`..` — the reverse of
    /// `dentry::named`, used to rebuild a path from an inode upward.
    fn name_of_child(&mut self, parent: InodeRef, child_nr: u16, sb: &SuperBlock, blocking: &mut impl Blocking) -> Option<([u8; crate::param::DIRSIZ], u8)> {
        let size = self.inodes.inode(parent).size;
        let mut off = 0;
        while off < size {
            let mut raw = [0u8; crate::fs::layout::DirEntry::SIZE];
            self.inodes.read(parent, &mut raw, off, sb, self.bufs, self.devices, blocking);
            off += crate::fs::layout::DirEntry::SIZE as u32;
            let entry = <crate::fs::layout::DirEntry as zerocopy::FromBytes>::read_from(&raw[..]).unwrap();
            let name = entry.name_bytes();
            if !entry.is_free() && entry.inum == child_nr && name != b"." && name != b".." {
                let mut buf = [0u8; crate::param::DIRSIZ];
                let len = name.len().min(crate::param::DIRSIZ);
                buf[..len].copy_from_slice(&name[..len]);
                return Some((buf, len as u8));
            }
        }
        None
    }

    /// `getcwd(root, cwd)`: rebuilds the absolute path of `cwd` by walking
    /// `..` up to `root`, looking up each step's own name in its parent via
    /// `name_of_child`. Writes the path (no trailing NUL) into `out` and
    /// returns its length; `out` must be at least 1 byte for the root case.
    pub fn getcwd(&mut self, root: InodeRef, cwd: InodeRef, sb: &SuperBlock, out: &mut [u8], blocking: &mut impl Blocking) -> Result<usize, FsError> {
        let root_nr = self.inodes.nr(root);
        if self.inodes.nr(cwd) == root_nr {
            *out.first_mut().ok_or(FsError::InvalidArgument)? = b'/';
            return Ok(1);
        }

        const MAX_DEPTH: usize = 32;
        let mut names = [[0u8; crate::param::DIRSIZ]; MAX_DEPTH];
        let mut lens = [0u8; MAX_DEPTH];
        let mut depth = 0;
        let mut cur = cwd;
        let mut owns_cur = false;

        loop {
            if depth == MAX_DEPTH {
                if owns_cur {
                    self.inodes.iput(cur, self.bufs, blocking);
                }
                return Err(FsError::NoSpace);
            }
            let (parent_nr, _) = named(self.dentries, self.inodes, cur, b"..", sb, self.bufs, self.devices, blocking).ok_or(FsError::InvalidArgument)?;
            let parent = self.inodes.iget(sb, parent_nr, self.bufs, self.devices, blocking).ok_or(FsError::NoSpace)?;
            let child_nr = self.inodes.nr(cur);
            let found = self.name_of_child(parent, child_nr, sb, blocking);
            if owns_cur {
                self.inodes.iput(cur, self.bufs, blocking);
            }
            let (name, len) = match found {
                Some(v) => v,
                None => {
                    self.inodes.iput(parent, self.bufs, blocking);
                    return Err(FsError::InvalidArgument);
                }
            };
            names[depth] = name;
            lens[depth] = len;
            depth += 1;
            cur = parent;
            owns_cur = true;
            if self.inodes.nr(cur) == root_nr {
                break;
            }
        }
        if owns_cur {
            self.inodes.iput(cur, self.bufs, blocking);
        }

        let mut pos = 0;
        for i in (0..depth).rev() {
            let len = lens[i] as usize;
            if pos + 1 + len > out.len() {
                return Err(FsError::NoSpace);
            }
            out[pos] = b'/';
            pos += 1;
            out[pos..pos + len].copy_from_slice(&names[i][..len]);
            pos += len;
        }
        Ok(pos)
    }
}

pub const IFCHR_MODE: u16 = IFCHR;
