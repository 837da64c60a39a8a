//! Dentry cache and path resolution (`SPEC_FULL.md` §4.6.5). A fixed
//! `NDENTRY`-sized table keyed by `(parent inode, name)`, hashed with djb2
//! the way the original MINIX directory cache does, with a simple
//! insert-overwrites-oldest policy instead of real LRU — the same
//! trade-off `buf.rs` makes for its own hash buckets, just without the
//! intrusive list since misses are cheap (one directory scan).

use crate::buf::BufCache;
use crate::device::DeviceTable;
use crate::fs::inode::{FsError, InodeCache, InodeRef};
use crate::fs::mount::MountTable;
use crate::fs::superblock::SuperBlock;
use crate::fs::SuperBlocks;
use crate::param::{DIRSIZ, NDENTRY};
use crate::wait::Blocking;

fn djb2(bytes: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for &b in bytes {
        h = h.wrapping_mul(33).wrapping_add(b as u32);
    }
    h
}

#[derive(Clone, Copy)]
struct Entry {
    used: bool,
    parent_dev: u32,
    parent_nr: u16,
    name: [u8; DIRSIZ],
    name_len: u8,
    child_nr: u16,
}

impl Entry {
    const fn empty() -> Self {
        Self {
            used: false,
            parent_dev: 0,
            parent_nr: 0,
            name: [0; DIRSIZ],
            name_len: 0,
            child_nr: 0,
        }
    }
}

pub struct DentryCache {
    entries: [Entry; NDENTRY],
    clock: usize,
}

impl DentryCache {
    pub fn new() -> Self {
        Self {
            entries: [Entry::empty(); NDENTRY],
            clock: 0,
        }
    }

    fn slot(&self, dev: u32, parent: u16, name: &[u8]) -> usize {
        (djb2(name).wrapping_add(dev).wrapping_add(parent as u32)) as usize % NDENTRY
    }

    fn lookup(&self, dev: u32, parent: u16, name: &[u8]) -> Option<u16> {
        let start = self.slot(dev, parent, name);
        for probe in 0..NDENTRY {
            let e = &self.entries[(start + probe) % NDENTRY];
            if !e.used {
                continue;
            }
            if e.parent_dev == dev && e.parent_nr == parent && &e.name[..e.name_len as usize] == name {
                return Some(e.child_nr);
            }
        }
        None
    }

    fn insert(&mut self, dev: u32, parent: u16, name: &[u8], child: u16) {
        let slot = self.clock % NDENTRY;
        self.clock = self.clock.wrapping_add(1);
        let mut buf = [0u8; DIRSIZ];
        let len = name.len().min(DIRSIZ);
        buf[..len].copy_from_slice(&name[..len]);
        self.entries[slot] = Entry {
            used: true,
            parent_dev: dev,
            parent_nr: parent,
            name: buf,
            name_len: len as u8,
            child_nr: child,
        };
    }

    /// Drops every cached entry naming `nr` as parent or child, on rename/
    /// unlink/rmdir invalidation.
    pub fn invalidate(&mut self, nr: u16) {
        for e in &mut self.entries {
            if e.used && (e.parent_nr == nr || e.child_nr == nr) {
                e.used = false;
            }
        }
    }
}

impl Default for DentryCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Resolution {
    pub inode: InodeRef,
    pub dev: u32,
}

/// `named(dir, name)`: one path-component lookup, consulting the dentry
/// cache before falling back to `InodeCache::dir_lookup`'s directory scan,
/// populating the cache on a scan hit.
pub fn named(
    dentries: &mut DentryCache,
    inodes: &mut InodeCache,
    dir: InodeRef,
    name: &[u8],
    sb: &SuperBlock,
    bufs: &mut BufCache,
    devices: &mut DeviceTable,
    blocking: &mut impl Blocking,
) -> Option<(u16, u32)> {
    let dev = inodes.dev(dir);
    let parent_nr = inodes.nr(dir);
    if let Some(child) = dentries.lookup(dev, parent_nr, name) {
        return Some((child, 0));
    }
    let (child, off) = inodes.dir_lookup(dir, name, sb, bufs, devices, blocking)?;
    dentries.insert(dev, parent_nr, name, child);
    Some((child, off))
}

/// `namei(path)`: walks a `/`-separated path from the root (or `cwd` for a
/// relative path), resolving each component via `named`. Crossing a mount
/// point (`..` at a mounted file system's root, per §4.6.7) switches both
/// the device and the inode to the covered file system's root rather than
/// ascending within the mounted one.
pub fn namei(
    dentries: &mut DentryCache,
    inodes: &mut InodeCache,
    mounts: &MountTable,
    superblocks: &SuperBlocks,
    root: InodeRef,
    cwd: InodeRef,
    path: &[u8],
    sb: &SuperBlock,
    bufs: &mut BufCache,
    devices: &mut DeviceTable,
    blocking: &mut impl Blocking,
) -> Result<InodeRef, FsError> {
    let mut cur = if path.first() == Some(&b'/') { root } else { cwd };
    let mut cur_sb = *sb;

    for component in path.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
        if !inodes.inode(cur).is_dir() {
            return Err(FsError::NotADirectory);
        }

        if component == b".." {
            if let Some(mp) = mounts.covering(inodes.dev(cur), inodes.nr(cur)) {
                cur = mp.mount_point;
                cur_sb = *superblocks.get(mp.host_sb_index);
                continue;
            }
        }

        let (child_nr, _off) = named(dentries, inodes, cur, component, &cur_sb, bufs, devices, blocking).ok_or(FsError::InvalidArgument)?;
        let next = inodes.iget(&cur_sb, child_nr, bufs, devices, blocking).ok_or(FsError::NoSpace)?;
        if cur != root && cur != cwd {
            inodes.iput(cur, bufs, blocking);
        }
        cur = next;

        if let Some(mounted_sb_idx) = mounts.mounted_here(cur_sb.dev, child_nr) {
            let mounted_sb = *superblocks.get(mounted_sb_idx);
            let mount_root = inodes.iget(&mounted_sb, crate::fs::layout::ROOT_INUM, bufs, devices, blocking).ok_or(FsError::NoSpace)?;
            inodes.iput(cur, bufs, blocking);
            cur = mount_root;
            cur_sb = mounted_sb;
        }
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSubtype, DeviceType, DriverOps};
    use crate::fs::layout::IFDIR;
    use crate::fs::mkfs;
    use crate::wait::NeverBlocks;

    fn harness() -> (BufCache, DeviceTable, NeverBlocks) {
        let mut devices = DeviceTable::new();
        devices.register(
            0,
            DeviceType::Block,
            DeviceSubtype::RamDisk,
            None,
            DriverOps {
                ioctl: |_dev, _cmd| 0,
                read: |_dev, _sector, _count, buf| {
                    buf.fill(0);
                    true
                },
                write: |_dev, _sector, _count, _buf| true,
            },
        );
        (BufCache::new(), devices, NeverBlocks)
    }

    #[test]
    fn named_hits_the_cache_on_the_second_lookup() {
        let (mut bufs, mut devices, mut blocking) = harness();
        let sb = mkfs::mkfs(0, 4096);
        let mut inodes = InodeCache::new();
        let mut dentries = DentryCache::new();
        let root = inodes.iget(&sb, crate::fs::layout::ROOT_INUM, &mut bufs, &mut devices, &mut blocking).unwrap();
        let child = inodes.ialloc(&sb, IFDIR | 0o755, &mut bufs, &mut devices, &mut blocking).unwrap();
        let child_nr = inodes.nr(child);
        inodes.dir_link(root, b"sub", child_nr, &sb, &mut bufs, &mut devices, &mut blocking).unwrap();

        let (a, _) = named(&mut dentries, &mut inodes, root, b"sub", &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        let (b, _) = named(&mut dentries, &mut inodes, root, b"sub", &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, child_nr);
    }

    #[test]
    fn invalidate_removes_stale_entries() {
        let mut dentries = DentryCache::new();
        dentries.insert(0, 1, b"foo", 5);
        assert_eq!(dentries.lookup(0, 1, b"foo"), Some(5));
        dentries.invalidate(5);
        assert_eq!(dentries.lookup(0, 1, b"foo"), None);
    }
}
