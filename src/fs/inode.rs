//! Inode cache, block map, and file I/O (`SPEC_FULL.md` §4.6.1, §4.6.3,
//! §4.6.4). Fixed `NINODE`-sized table, exactly like every other cache in
//! this kernel (`buf.rs`'s `BufCache`, `sched.rs`'s task table): no heap, a
//! linear scan for a free slot, content-addressed by `(dev, nr)`.
//!
//! An active inode holds its containing inode-table buffer pinned for as
//! long as its refcount is nonzero (`iget` reads it, `iput` releases it),
//! per §4.6.1 — the in-cache copy and the pinned buffer are kept in sync on
//! every mutation rather than the buffer being re-fetched each time.

use crate::buf::BufCache;
use crate::device::DeviceTable;
use crate::fs::layout::{DiskInode, DirEntry, IFDIR, NDIRECT, ZONES_PER_INDIRECT};
use crate::fs::superblock::SuperBlock;
use crate::param::{BSIZE, NINODE};
use crate::wait::Blocking;
use zerocopy::{AsBytes, FromBytes};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FsError {
    NoSpace,
    InvalidArgument,
    IsADirectory,
    NotADirectory,
}

struct CachedInode {
    dev: u32,
    nr: u16,
    refcnt: u32,
    buf_id: u32,
    disk: DiskInode,
}

impl CachedInode {
    const fn empty() -> Self {
        Self {
            dev: 0,
            nr: 0,
            refcnt: 0,
            buf_id: 0,
            disk: DiskInode {
                mode: 0,
                uid: 0,
                size: 0,
                mtime: 0,
                gid: 0,
                nlinks: 0,
                zones: [0; crate::fs::layout::NZONES],
            },
        }
    }
}

/// An inode cache slot id, used as the handle every other `fs/` module
/// passes around instead of a `(dev, nr)` pair.
pub type InodeRef = u32;

pub struct InodeCache {
    slots: [CachedInode; NINODE],
}

impl InodeCache {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| CachedInode::empty()),
        }
    }

    fn find(&self, dev: u32, nr: u16) -> Option<InodeRef> {
        self.slots.iter().position(|s| s.refcnt > 0 && s.dev == dev && s.nr == nr).map(|i| i as u32)
    }

    /// `iget(dev, nr)`: bumps refcount on a cache hit; on miss, finds a free
    /// slot and loads the inode-table block through the buffer cache,
    /// keeping that buffer pinned. Mount-point indirection (§4.6.1, "if the
    /// inode is a mount point...") is `dir.rs`/`mount.rs`'s concern, layered
    /// above this, since it needs the mount table this module doesn't know
    /// about.
    pub fn iget(
        &mut self,
        sb: &SuperBlock,
        nr: u16,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Option<InodeRef> {
        if let Some(existing) = self.find(sb.dev, nr) {
            self.slots[existing as usize].refcnt += 1;
            return Some(existing);
        }
        let free = self.slots.iter().position(|s| s.refcnt == 0)?;
        let buf_id = bufs.read(sb.dev, sb.inode_block(nr), devices, blocking);
        let off = sb.inode_offset(nr);
        let disk = DiskInode::read_from(&bufs.buffer(buf_id).data[off..off + core::mem::size_of::<DiskInode>()]).unwrap();
        self.slots[free] = CachedInode {
            dev: sb.dev,
            nr,
            refcnt: 1,
            buf_id,
            disk,
        };
        Some(free as u32)
    }

    pub fn inode(&self, ino: InodeRef) -> &DiskInode {
        &self.slots[ino as usize].disk
    }

    pub fn nr(&self, ino: InodeRef) -> u16 {
        self.slots[ino as usize].nr
    }

    pub fn dev(&self, ino: InodeRef) -> u32 {
        self.slots[ino as usize].dev
    }

    pub fn refcount(&self, ino: InodeRef) -> u32 {
        self.slots[ino as usize].refcnt
    }

    /// Mutates the cached descriptor and writes it straight through to the
    /// still-pinned inode-table buffer, marking it dirty.
    pub fn update(&mut self, ino: InodeRef, bufs: &mut BufCache, f: impl FnOnce(&mut DiskInode)) {
        let slot = &mut self.slots[ino as usize];
        f(&mut slot.disk);
        let buf_id = slot.buf_id;
        let off_nr = slot.nr;
        drop(slot);
        let sb_off = Self::offset_in_table(off_nr);
        slot_write(bufs, buf_id, sb_off, &self.slots[ino as usize].disk);
    }

    fn offset_in_table(nr: u16) -> usize {
        ((nr as usize - 1) % SuperBlock::INODES_PER_BLOCK) * core::mem::size_of::<DiskInode>()
    }

    /// `iput`: decrements refcount; at zero, releases the pinned buffer and
    /// frees the slot for reuse.
    pub fn iput(&mut self, ino: InodeRef, bufs: &mut BufCache, blocking: &mut impl Blocking) {
        let slot = &mut self.slots[ino as usize];
        assert!(slot.refcnt > 0, "iput: not referenced");
        slot.refcnt -= 1;
        if slot.refcnt == 0 {
            let buf_id = slot.buf_id;
            bufs.release(buf_id, blocking);
            self.slots[ino as usize] = CachedInode::empty();
        }
    }

    /// `bmap(inode, logical, create)`: translates a logical block number to
    /// a physical block, walking up to two levels of indirection. Returns
    /// `None` on a hole with `create = false`, or on allocation failure with
    /// `create = true`.
    pub fn bmap(
        &mut self,
        ino: InodeRef,
        mut logical: usize,
        create: bool,
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Option<u32> {
        if logical < NDIRECT {
            let zone = self.slots[ino as usize].disk.zones[logical];
            if zone != 0 {
                return Some(sb.zone_to_block(zone));
            }
            if !create {
                return None;
            }
            let new_zone = sb.balloc(bufs, devices, blocking)?;
            self.update(ino, bufs, |d| d.zones[logical] = new_zone);
            return Some(sb.zone_to_block(new_zone));
        }
        logical -= NDIRECT;

        if logical < ZONES_PER_INDIRECT {
            let indirect = self.ensure_indirect_zone(ino, NDIRECT, create, sb, bufs, devices, blocking)?;
            return self.indirect_entry(indirect, logical, create, sb, bufs, devices, blocking);
        }
        logical -= ZONES_PER_INDIRECT;

        if logical < ZONES_PER_INDIRECT * ZONES_PER_INDIRECT {
            let dindirect = self.ensure_indirect_zone(ino, NDIRECT + 1, create, sb, bufs, devices, blocking)?;
            let outer_idx = logical / ZONES_PER_INDIRECT;
            let inner_idx = logical % ZONES_PER_INDIRECT;
            let outer_zone = Self::indirect_slot(dindirect, outer_idx, create, sb, bufs, devices, blocking)?;
            return self.indirect_entry_raw(outer_zone, inner_idx, create, sb, bufs, devices, blocking);
        }
        None
    }

    fn ensure_indirect_zone(
        &mut self,
        ino: InodeRef,
        zone_slot: usize,
        create: bool,
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Option<u16> {
        let existing = self.slots[ino as usize].disk.zones[zone_slot];
        if existing != 0 {
            return Some(existing);
        }
        if !create {
            return None;
        }
        let new_zone = sb.balloc(bufs, devices, blocking)?;
        self.update(ino, bufs, |d| d.zones[zone_slot] = new_zone);
        Some(new_zone)
    }

    /// Reads/allocates entry `idx` of the indirect block at zone
    /// `indirect_zone`, returning the physical data block it names.
    fn indirect_entry(
        &mut self,
        indirect_zone: u16,
        idx: usize,
        create: bool,
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Option<u32> {
        let zone = Self::indirect_slot(indirect_zone, idx, create, sb, bufs, devices, blocking)?;
        Some(sb.zone_to_block(zone))
    }

    fn indirect_entry_raw(
        &mut self,
        indirect_zone: u16,
        idx: usize,
        create: bool,
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Option<u32> {
        self.indirect_entry(indirect_zone, idx, create, sb, bufs, devices, blocking)
    }

    /// Reads entry `idx` (a zone number, not a block) out of the indirect
    /// block at `indirect_zone`, allocating and writing it back if it's a
    /// hole and `create` is set.
    fn indirect_slot(
        indirect_zone: u16,
        idx: usize,
        create: bool,
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Option<u16> {
        let block = sb.zone_to_block(indirect_zone);
        let id = bufs.read(sb.dev, block, devices, blocking);
        let off = idx * 2;
        let entry = u16::from_le_bytes([bufs.buffer(id).data[off], bufs.buffer(id).data[off + 1]]);
        if entry != 0 {
            bufs.release(id, blocking);
            return Some(entry);
        }
        if !create {
            bufs.release(id, blocking);
            return None;
        }
        let new_zone = match sb.balloc(bufs, devices, blocking) {
            Some(z) => z,
            None => {
                bufs.release(id, blocking);
                return None;
            }
        };
        let bytes = new_zone.to_le_bytes();
        bufs.buffer_mut(id).data[off] = bytes[0];
        bufs.buffer_mut(id).data[off + 1] = bytes[1];
        bufs.mark_dirty(id, true);
        bufs.release(id, blocking);
        Some(new_zone)
    }

    /// `read(inode, buf, off)`: clamps to file size, walks block by block,
    /// zero-fills holes.
    pub fn read(
        &mut self,
        ino: InodeRef,
        buf: &mut [u8],
        off: u32,
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut (impl Blocking + ?Sized),
    ) -> usize {
        let size = self.slots[ino as usize].disk.size;
        if off >= size {
            return 0;
        }
        let want = (buf.len() as u32).min(size - off) as usize;
        let mut done = 0;
        while done < want {
            let file_off = off as usize + done;
            let logical = file_off / BSIZE;
            let block_off = file_off % BSIZE;
            let n = (BSIZE - block_off).min(want - done);
            match self.bmap(ino, logical, false, sb, bufs, devices, blocking) {
                Some(block) => {
                    let id = bufs.read(sb.dev, block, devices, blocking);
                    buf[done..done + n].copy_from_slice(&bufs.buffer(id).data[block_off..block_off + n]);
                    bufs.release(id, blocking);
                }
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        done
    }

    /// `write(inode, buf, off)`: iterates block by block with `create=true`,
    /// read-modify-write via the buffer cache, extends `size` if `off` now
    /// passes it.
    pub fn write(
        &mut self,
        ino: InodeRef,
        buf: &[u8],
        off: u32,
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Result<usize, FsError> {
        let mut done = 0;
        while done < buf.len() {
            let file_off = off as usize + done;
            let logical = file_off / BSIZE;
            let block_off = file_off % BSIZE;
            let n = (BSIZE - block_off).min(buf.len() - done);
            let block = self.bmap(ino, logical, true, sb, bufs, devices, blocking).ok_or(FsError::NoSpace)?;
            let id = bufs.get(sb.dev, block, devices, blocking);
            bufs.buffer_mut(id).data[block_off..block_off + n].copy_from_slice(&buf[done..done + n]);
            bufs.mark_dirty(id, true);
            bufs.release(id, blocking);
            done += n;
        }
        let new_end = off + done as u32;
        if new_end > self.slots[ino as usize].disk.size {
            self.update(ino, bufs, |d| d.size = new_end);
        }
        Ok(done)
    }

    /// `truncate(inode)`: frees every zone (direct, then single-indirect,
    /// then double-indirect), zeroes the zone array, resets size.
    pub fn truncate(&mut self, ino: InodeRef, sb: &SuperBlock, bufs: &mut BufCache, devices: &mut DeviceTable, blocking: &mut impl Blocking) {
        for i in 0..NDIRECT {
            let z = self.slots[ino as usize].disk.zones[i];
            if z != 0 {
                sb.bfree(z, bufs, devices, blocking);
            }
        }
        let indirect = self.slots[ino as usize].disk.zones[NDIRECT];
        if indirect != 0 {
            self.free_indirect_block(indirect, sb, bufs, devices, blocking);
            sb.bfree(indirect, bufs, devices, blocking);
        }
        let dindirect = self.slots[ino as usize].disk.zones[NDIRECT + 1];
        if dindirect != 0 {
            let block = sb.zone_to_block(dindirect);
            let id = bufs.read(sb.dev, block, devices, blocking);
            let outer_zones: arrayvec::ArrayVec<u16, ZONES_PER_INDIRECT> = (0..ZONES_PER_INDIRECT)
                .map(|i| u16::from_le_bytes([bufs.buffer(id).data[i * 2], bufs.buffer(id).data[i * 2 + 1]]))
                .collect();
            bufs.release(id, blocking);
            for z in outer_zones {
                if z != 0 {
                    self.free_indirect_block(z, sb, bufs, devices, blocking);
                    sb.bfree(z, bufs, devices, blocking);
                }
            }
            sb.bfree(dindirect, bufs, devices, blocking);
        }
        self.update(ino, bufs, |d| {
            d.zones = [0; crate::fs::layout::NZONES];
            d.size = 0;
        });
    }

    fn free_indirect_block(&self, indirect_zone: u16, sb: &SuperBlock, bufs: &mut BufCache, devices: &mut DeviceTable, blocking: &mut impl Blocking) {
        let block = sb.zone_to_block(indirect_zone);
        let id = bufs.read(sb.dev, block, devices, blocking);
        let zones: arrayvec::ArrayVec<u16, ZONES_PER_INDIRECT> = (0..ZONES_PER_INDIRECT)
            .map(|i| u16::from_le_bytes([bufs.buffer(id).data[i * 2], bufs.buffer(id).data[i * 2 + 1]]))
            .collect();
        bufs.release(id, blocking);
        for z in zones {
            if z != 0 {
                sb.bfree(z, bufs, devices, blocking);
            }
        }
    }

    /// Allocates a fresh inode via `sb.ialloc` and loads it straight into
    /// the cache, the way `mkdir`/`creat`/`mknod` all need.
    pub fn ialloc(
        &mut self,
        sb: &SuperBlock,
        mode: u16,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Option<InodeRef> {
        let nr = sb.ialloc(bufs, devices, blocking)?;
        let ino = self.iget(sb, nr, bufs, devices, blocking)?;
        self.update(ino, bufs, |d| {
            *d = DiskInode {
                mode,
                nlinks: 0,
                ..Default::default()
            };
        });
        Some(ino)
    }

    /// Scans a directory inode's entries for `name`, returning the child
    /// inode number on a match. Used by `dir.rs`'s directory ops directly
    /// (path resolution's own scan goes through the dentry cache instead).
    pub fn dir_lookup(
        &mut self,
        ino: InodeRef,
        name: &[u8],
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Option<(u16, u32)> {
        let size = self.slots[ino as usize].disk.size as usize;
        let mut off = 0;
        while off < size {
            let mut raw = [0u8; DirEntry::SIZE];
            self.read(ino, &mut raw, off as u32, sb, bufs, devices, blocking);
            let entry = DirEntry::read_from(&raw[..]).unwrap();
            if !entry.is_free() && entry.name_bytes() == name {
                return Some((entry.inum, off as u32));
            }
            off += DirEntry::SIZE;
        }
        None
    }

    /// Writes a new `(inum, name)` pair into the first free slot of a
    /// directory's entries, extending the directory if none is free.
    pub fn dir_link(
        &mut self,
        dir: InodeRef,
        name: &[u8],
        inum: u16,
        sb: &SuperBlock,
        bufs: &mut BufCache,
        devices: &mut DeviceTable,
        blocking: &mut impl Blocking,
    ) -> Result<(), FsError> {
        if !self.slots[dir as usize].disk.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let size = self.slots[dir as usize].disk.size as usize;
        let mut off = 0;
        let mut target = size;
        while off < size {
            let mut raw = [0u8; DirEntry::SIZE];
            self.read(dir, &mut raw, off as u32, sb, bufs, devices, blocking);
            let entry = DirEntry::read_from(&raw[..]).unwrap();
            if entry.is_free() {
                target = off;
                break;
            }
            off += DirEntry::SIZE;
        }
        let mut entry = DirEntry::empty();
        entry.inum = inum;
        entry.set_name(name);
        self.write(dir, entry.as_bytes(), target as u32, sb, bufs, devices, blocking)?;
        Ok(())
    }

    /// Zeroes the directory entry at byte offset `off` (used by `unlink`/
    /// `rmdir` to remove a name without shifting subsequent entries).
    pub fn dir_remove_at(&mut self, dir: InodeRef, off: u32, sb: &SuperBlock, bufs: &mut BufCache, devices: &mut DeviceTable, blocking: &mut impl Blocking) {
        let empty = DirEntry::empty();
        let _ = self.write(dir, empty.as_bytes(), off, sb, bufs, devices, blocking);
    }
}

fn slot_write(bufs: &mut BufCache, buf_id: u32, off: usize, disk: &DiskInode) {
    let bytes = disk.as_bytes();
    bufs.buffer_mut(buf_id).data[off..off + bytes.len()].copy_from_slice(bytes);
    bufs.mark_dirty(buf_id, true);
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// True if `mode`'s permission bits grant `want` (one of 4=r, 2=w, 1=x) to
/// `uid`/`gid` per the owner/group/other triad, the way `permission()` is
/// described in §7 ("fails the rwx/uid/gid check in permission()").
pub fn permission(disk: &DiskInode, uid: u16, gid: u16, want: u8) -> bool {
    if uid == 0 {
        return true;
    }
    let bits = disk.mode & 0o777;
    let shift = if disk.uid == uid {
        6
    } else if u16::from(disk.gid) == gid {
        3
    } else {
        0
    };
    (bits >> shift) as u8 & want == want
}

pub const IFDIR_MODE: u16 = IFDIR;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSubtype, DeviceType, DriverOps};
    use crate::fs::mkfs;
    use crate::wait::NeverBlocks;

    fn harness() -> (BufCache, DeviceTable, NeverBlocks) {
        let mut devices = DeviceTable::new();
        devices.register(0, DeviceType::Block, DeviceSubtype::RamDisk, None, ramdisk_ops());
        (BufCache::new(), devices, NeverBlocks)
    }

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

    fn mkfs_small() -> SuperBlock {
        mkfs::mkfs(0, 4096)
    }

    #[test]
    fn write_then_read_round_trips_within_one_block() {
        let (mut bufs, mut devices, mut blocking) = harness();
        let sb = mkfs_small();
        sb.write(&mut bufs, &mut devices, &mut blocking);
        let mut cache = InodeCache::new();
        let ino = cache.ialloc(&sb, IFDIR | 0o755, &mut bufs, &mut devices, &mut blocking).unwrap();
        let data = b"hello, file system";
        cache.write(ino, data, 0, &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        let mut out = [0u8; 32];
        let n = cache.read(ino, &mut out, 0, &sb, &mut bufs, &mut devices, &mut blocking);
        assert_eq!(n, data.len());
        assert_eq!(&out[..n], data);
    }

    #[test]
    fn write_past_end_extends_size_and_reads_back_holes_as_zero() {
        let (mut bufs, mut devices, mut blocking) = harness();
        let sb = mkfs_small();
        sb.write(&mut bufs, &mut devices, &mut blocking);
        let mut cache = InodeCache::new();
        let ino = cache.ialloc(&sb, IFDIR | 0o755, &mut bufs, &mut devices, &mut blocking).unwrap();
        cache.write(ino, b"tail", 4096, &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        assert_eq!(cache.inode(ino).size, 4100);
        let mut out = [0xffu8; 8192];
        let n = cache.read(ino, &mut out, 0, &sb, &mut bufs, &mut devices, &mut blocking);
        assert_eq!(n, 4100);
        assert!(out[0..4096].iter().all(|&b| b == 0));
        assert_eq!(&out[4096..4100], b"tail");
    }

    #[test]
    fn truncate_frees_zones_and_resets_size() {
        let (mut bufs, mut devices, mut blocking) = harness();
        let sb = mkfs_small();
        sb.write(&mut bufs, &mut devices, &mut blocking);
        let mut cache = InodeCache::new();
        let ino = cache.ialloc(&sb, IFDIR | 0o755, &mut bufs, &mut devices, &mut blocking).unwrap();
        cache.write(ino, b"some data", 0, &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        cache.truncate(ino, &sb, &mut bufs, &mut devices, &mut blocking);
        assert_eq!(cache.inode(ino).size, 0);
        assert!(cache.inode(ino).zones.iter().all(|&z| z == 0));
    }

    #[test]
    fn dir_link_then_lookup_finds_the_entry() {
        let (mut bufs, mut devices, mut blocking) = harness();
        let sb = mkfs_small();
        sb.write(&mut bufs, &mut devices, &mut blocking);
        let mut cache = InodeCache::new();
        let dir = cache.ialloc(&sb, IFDIR | 0o755, &mut bufs, &mut devices, &mut blocking).unwrap();
        let child = cache.ialloc(&sb, 0o100644, &mut bufs, &mut devices, &mut blocking).unwrap();
        let child_nr = cache.nr(child);
        cache.dir_link(dir, b"hello", child_nr, &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        let (found, _off) = cache.dir_lookup(dir, b"hello", &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        assert_eq!(found, child_nr);
    }

    #[test]
    fn iget_twice_shares_the_cache_slot() {
        let (mut bufs, mut devices, mut blocking) = harness();
        let sb = mkfs_small();
        sb.write(&mut bufs, &mut devices, &mut blocking);
        let mut cache = InodeCache::new();
        let a = cache.ialloc(&sb, 0o100644, &mut bufs, &mut devices, &mut blocking).unwrap();
        let nr = cache.nr(a);
        let b = cache.iget(&sb, nr, &mut bufs, &mut devices, &mut blocking).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.refcount(a), 2);
        cache.iput(a, &mut bufs, &mut blocking);
        assert_eq!(cache.refcount(a), 1);
    }
}
