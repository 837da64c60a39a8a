//! Fresh MINIX-v1 file system construction (`SPEC_FULL.md` §4.6.8), backing
//! the `mkfs` syscall and this module's own unit tests. Lays out the maps
//! and inode table by the same block arithmetic `superblock.rs` uses to
//! read them back, then preallocates and populates the root directory with
//! `.` and `..` both pointing at `ROOT_INUM`, per the "inode 1 is always
//! the root of a freshly made file system" rule.

use crate::buf::BufCache;
use crate::device::DeviceTable;
use crate::fs::inode::InodeCache;
use crate::fs::layout::{DirEntry, IFDIR, ROOT_INUM};
use crate::fs::superblock::{SuperBlock, IMAP_START};
use crate::param::BSIZE;
use crate::wait::Blocking;

/// Builds the in-memory superblock for a `nzones`-zone file system on
/// `dev`, choosing map sizes large enough to cover every inode/zone with
/// one bit each. Does not touch the disk; call `.write()` and then
/// `populate_root` to actually lay it out.
pub fn layout(dev: u32, nzones: u16) -> SuperBlock {
    let ninodes: u16 = 64;
    let imap_blocks = ceil_div(ninodes as usize + 1, BSIZE * 8) as u16;
    let zmap_blocks = ceil_div(nzones as usize + 1, BSIZE * 8) as u16;
    let inode_table_blocks = ceil_div(ninodes as usize, SuperBlock::INODES_PER_BLOCK) as u16;
    let firstdatazone = IMAP_START as u16 + imap_blocks + zmap_blocks + inode_table_blocks;
    SuperBlock {
        dev,
        ninodes,
        nzones,
        imap_blocks,
        zmap_blocks,
        firstdatazone,
        max_size: (nzones as u32) * BSIZE as u32,
    }
}

fn ceil_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

/// Writes the super-block, preallocates the root inode's bitmap bit and
/// inode-table entry, and populates its first data block with `.`/`..`.
/// Returns the `SuperBlock` ready for immediate use — the on-disk image is
/// left fully self-consistent, not merely superblock-valid.
pub fn mkfs_on(dev: u32, nzones: u16, bufs: &mut BufCache, devices: &mut DeviceTable, blocking: &mut impl Blocking) -> SuperBlock {
    let sb = layout(dev, nzones);
    sb.write(bufs, devices, blocking);
    sb.preallocate_root_inode(bufs, devices, blocking);

    let mut cache = InodeCache::new();
    let root = cache
        .iget(&sb, ROOT_INUM, bufs, devices, blocking)
        .expect("fresh inode cache has room for the root inode");
    cache.update(root, bufs, |d| {
        d.mode = IFDIR | 0o755;
        d.nlinks = 2;
    });

    let mut dot = DirEntry::empty();
    dot.inum = ROOT_INUM;
    dot.set_name(b".");
    let mut dotdot = DirEntry::empty();
    dotdot.inum = ROOT_INUM;
    dotdot.set_name(b"..");

    let mut block = [0u8; DirEntry::SIZE * 2];
    block[..DirEntry::SIZE].copy_from_slice(zerocopy::AsBytes::as_bytes(&dot));
    block[DirEntry::SIZE..].copy_from_slice(zerocopy::AsBytes::as_bytes(&dotdot));
    cache.write(root, &block, 0, &sb, bufs, devices, blocking).expect("root directory's first block always has room");
    cache.iput(root, bufs, blocking);

    sb
}

/// Test/demo convenience: builds a fresh file system entirely in memory
/// via the already-registered ramdisk device, matching `inode.rs`'s test
/// harness shape.
#[cfg(test)]
pub fn mkfs(dev: u32, nzones: u16) -> SuperBlock {
    use crate::device::{DeviceSubtype, DeviceType, DriverOps};
    use crate::wait::NeverBlocks;

    let mut devices = DeviceTable::new();
    devices.register(
        dev as usize,
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
    let mut bufs = BufCache::new();
    let mut blocking = NeverBlocks;
    mkfs_on(dev, nzones, &mut bufs, &mut devices, &mut blocking)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSubtype, DeviceType, DriverOps};
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
    fn fresh_root_directory_contains_dot_and_dotdot() {
        let (mut bufs, mut devices, mut blocking) = harness();
        let sb = mkfs_on(0, 4096, &mut bufs, &mut devices, &mut blocking);
        let mut cache = InodeCache::new();
        let root = cache.iget(&sb, ROOT_INUM, &mut bufs, &mut devices, &mut blocking).unwrap();
        assert!(cache.inode(root).is_dir());
        assert_eq!(cache.inode(root).nlinks, 2);
        let (inum, _) = cache.dir_lookup(root, b".", &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        assert_eq!(inum, ROOT_INUM);
        let (inum, _) = cache.dir_lookup(root, b"..", &sb, &mut bufs, &mut devices, &mut blocking).unwrap();
        assert_eq!(inum, ROOT_INUM);
    }

    #[test]
    fn layout_places_firstdatazone_after_every_fixed_region() {
        let sb = layout(0, 4096);
        assert!(sb.firstdatazone as u32 > sb.inode_table_start());
    }
}
