//! Mount table (`SPEC_FULL.md` §4.6.7), sized by `param::NMOUNT`. Tracks,
//! for each mounted file system, the covered directory (host device +
//! inode) and the mounted file system's own root, both kept pinned in the
//! inode cache for as long as the mount is active so `dentry.rs`'s `namei`
//! can cross the boundary in either direction without re-resolving.

use crate::fs::inode::InodeRef;
use crate::param::NMOUNT;

#[derive(Clone, Copy)]
struct MountEntry {
    used: bool,
    host_sb_dev: u32,
    host_inum: u16,
    host_inode: InodeRef,
    host_sb_index: usize,
    mounted_sb_dev: u32,
    mounted_sb_index: usize,
}

impl MountEntry {
    const fn empty() -> Self {
        Self {
            used: false,
            host_sb_dev: 0,
            host_inum: 0,
            host_inode: 0,
            host_sb_index: 0,
            mounted_sb_dev: 0,
            mounted_sb_index: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MountError {
    NotADirectory,
    AlreadyMounted,
    Busy,
    NoSpace,
}

/// Where `namei` lands after crossing `..` out of a mounted file system.
pub struct Crossing {
    pub mount_point: InodeRef,
    pub host_sb_index: usize,
}

pub struct MountTable {
    entries: [MountEntry; NMOUNT],
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            entries: [MountEntry::empty(); NMOUNT],
        }
    }

    /// Registers a new mount covering `(host_inode, host_sb_index)` with
    /// the file system rooted at `mounted_sb_index`. `host_inum`/
    /// `host_sb_dev` are cached alongside for the `mounted_here` lookup
    /// that doesn't have a live `InodeCache` handle to hash by.
    pub fn mount(
        &mut self,
        host_sb_dev: u32,
        host_inum: u16,
        host_inode: InodeRef,
        host_sb_index: usize,
        mounted_sb_dev: u32,
        mounted_sb_index: usize,
    ) -> Result<(), MountError> {
        if self.mounted_here(host_sb_dev, host_inum).is_some() {
            return Err(MountError::AlreadyMounted);
        }
        let slot = self.entries.iter().position(|e| !e.used).ok_or(MountError::NoSpace)?;
        self.entries[slot] = MountEntry {
            used: true,
            host_sb_dev,
            host_inum,
            host_inode,
            host_sb_index,
            mounted_sb_dev,
            mounted_sb_index,
        };
        Ok(())
    }

    /// Tears down the mount covering `(host_sb_dev, host_inum)`, returning
    /// the pinned `(host_inode, mounted_sb_index)` pair so the caller can
    /// `iput` the host inode and retire the unmounted superblock.
    pub fn umount(&mut self, host_sb_dev: u32, host_inum: u16) -> Option<(InodeRef, usize)> {
        let slot = self.entries.iter().position(|e| e.used && e.host_sb_dev == host_sb_dev && e.host_inum == host_inum)?;
        let e = self.entries[slot];
        self.entries[slot] = MountEntry::empty();
        Some((e.host_inode, e.mounted_sb_index))
    }

    /// `(dev, nr)` names a directory covered by a mount: returns the
    /// mounted file system's superblock index to descend into.
    pub fn mounted_here(&self, dev: u32, nr: u16) -> Option<usize> {
        self.entries.iter().find(|e| e.used && e.host_sb_dev == dev && e.host_inum == nr).map(|e| e.mounted_sb_index)
    }

    /// `(dev, nr)` names the root of a mounted file system: returns where
    /// to resume in the host file system on `..`.
    pub fn covering(&self, dev: u32, nr: u16) -> Option<Crossing> {
        if nr != crate::fs::layout::ROOT_INUM {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.used && e.mounted_sb_dev == dev)
            .map(|e| Crossing {
                mount_point: e.host_inode,
                host_sb_index: e.host_sb_index,
            })
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_then_mounted_here_resolves_to_the_child_superblock() {
        let mut mounts = MountTable::new();
        mounts.mount(0, 5, 42, 0, 1, 7).unwrap();
        assert_eq!(mounts.mounted_here(0, 5), Some(7));
    }

    #[test]
    fn covering_resolves_the_mounted_roots_host_directory() {
        let mut mounts = MountTable::new();
        mounts.mount(0, 5, 42, 0, 1, 7).unwrap();
        let crossing = mounts.covering(1, crate::fs::layout::ROOT_INUM).unwrap();
        assert_eq!(crossing.mount_point, 42);
        assert_eq!(crossing.host_sb_index, 0);
    }

    #[test]
    fn mounting_the_same_directory_twice_fails() {
        let mut mounts = MountTable::new();
        mounts.mount(0, 5, 42, 0, 1, 7).unwrap();
        assert_eq!(mounts.mount(0, 5, 42, 0, 2, 8), Err(MountError::AlreadyMounted));
    }

    #[test]
    fn umount_frees_the_slot_for_reuse() {
        let mut mounts = MountTable::new();
        mounts.mount(0, 5, 42, 0, 1, 7).unwrap();
        let (host_inode, sb_idx) = mounts.umount(0, 5).unwrap();
        assert_eq!(host_inode, 42);
        assert_eq!(sb_idx, 7);
        assert!(mounts.mount(0, 5, 43, 0, 1, 9).is_ok());
    }
}
