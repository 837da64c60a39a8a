//! L3: the buffer cache (`SPEC_FULL.md` §4.4).
//!
//! Content-addressed by `(dev, block)`, with exactly one buffer per block.
//! Backed by a fixed array, a bump allocator for the initial fill, and
//! reuse by LRU once the array is exhausted — there is no heap here, so a
//! buffer's lifetime is "however long it sits in this array", not tied to
//! any `Drop`.

use crate::device::DeviceTable;
use crate::list::{IndexList, Link, NIL};
use crate::param::{BSIZE, NBUF, SECTORS_PER_BLOCK};
use crate::wait::Blocking;

const fn next_pow2(n: usize) -> usize {
    let mut p = 1;
    while p < n {
        p <<= 1;
    }
    p
}

const HASH_BUCKETS: usize = next_pow2(NBUF);

/// Standard integer mixer (splitmix-style) over `dev ^ block`.
fn hash(dev: u32, block: u32) -> usize {
    let mut x = dev ^ block;
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    (x as usize) & (HASH_BUCKETS - 1)
}

pub struct Buffer {
    dev: u32,
    block: u32,
    refcnt: u32,
    valid: bool,
    dirty: bool,
    hash_link: Link,
    lru_link: Link,
    dirty_link: Link,
    pub data: [u8; BSIZE],
}

impl Buffer {
    const fn empty() -> Self {
        Self {
            dev: 0,
            block: 0,
            refcnt: 0,
            valid: false,
            dirty: false,
            hash_link: Link::unlinked(),
            lru_link: Link::unlinked(),
            dirty_link: Link::unlinked(),
            data: [0; BSIZE],
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn block(&self) -> u32 {
        self.block
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Wait channel for tasks blocked in `get` with no buffer to reuse.
const BUF_FREE_CHANNEL: usize = usize::MAX;

pub struct BufCache {
    bufs: [Buffer; NBUF],
    hash: [u32; HASH_BUCKETS],
    lru: IndexList,
    dirty: IndexList,
    next_free: usize,
}

impl BufCache {
    pub fn new() -> Self {
        Self {
            bufs: core::array::from_fn(|_| Buffer::empty()),
            hash: [NIL; HASH_BUCKETS],
            lru: IndexList::new(),
            dirty: IndexList::new(),
            next_free: 0,
        }
    }

    fn hash_link_of(bufs: *mut [Buffer; NBUF], i: u32) -> *mut Link {
        unsafe { &mut (*bufs)[i as usize].hash_link as *mut Link }
    }

    fn lru_link_of(bufs: *mut [Buffer; NBUF], i: u32) -> *mut Link {
        unsafe { &mut (*bufs)[i as usize].lru_link as *mut Link }
    }

    fn dirty_link_of(bufs: *mut [Buffer; NBUF], i: u32) -> *mut Link {
        unsafe { &mut (*bufs)[i as usize].dirty_link as *mut Link }
    }

    fn find(&self, dev: u32, block: u32) -> Option<u32> {
        let mut cur = self.hash[hash(dev, block)];
        while cur != NIL {
            let b = &self.bufs[cur as usize];
            if b.dev == dev && b.block == block {
                return Some(cur);
            }
            cur = b.hash_link.next;
        }
        None
    }

    fn insert_hash(&mut self, id: u32) {
        let bucket = hash(self.bufs[id as usize].dev, self.bufs[id as usize].block);
        let head = self.hash[bucket];
        self.bufs[id as usize].hash_link = Link { prev: NIL, next: head };
        if head != NIL {
            self.bufs[head as usize].hash_link.prev = id;
        }
        self.hash[bucket] = id;
    }

    fn remove_hash(&mut self, id: u32) {
        let bucket = hash(self.bufs[id as usize].dev, self.bufs[id as usize].block);
        let (prev, next) = {
            let link = &self.bufs[id as usize].hash_link;
            (link.prev, link.next)
        };
        if prev == NIL {
            self.hash[bucket] = next;
        } else {
            self.bufs[prev as usize].hash_link.next = next;
        }
        if next != NIL {
            self.bufs[next as usize].hash_link.prev = prev;
        }
        self.bufs[id as usize].hash_link = Link::unlinked();
    }

    /// `get(dev, block)`: hash lookup, or free-buffer acquisition on miss
    /// (bump allocation, then LRU reuse, then block-and-retry), per
    /// `SPEC_FULL.md` §4.4.
    pub fn get(&mut self, dev: u32, block: u32, devices: &mut DeviceTable, blocking: &mut impl Blocking) -> u32 {
        loop {
            if let Some(id) = self.find(dev, block) {
                if self.bufs[id as usize].refcnt == 0 {
                    let bufs_ptr: *mut [Buffer; NBUF] = &mut self.bufs;
                    self.lru.remove(id, move |i| Self::lru_link_of(bufs_ptr, i));
                }
                self.bufs[id as usize].refcnt += 1;
                return id;
            }

            if self.next_free < NBUF {
                let id = self.next_free as u32;
                self.next_free += 1;
                self.bufs[id as usize].dev = dev;
                self.bufs[id as usize].block = block;
                self.bufs[id as usize].valid = false;
                self.bufs[id as usize].refcnt = 1;
                self.insert_hash(id);
                return id;
            }

            if let Some(victim) = self.lru.back() {
                let bufs_ptr: *mut [Buffer; NBUF] = &mut self.bufs;
                self.lru.remove(victim, move |i| Self::lru_link_of(bufs_ptr, i));
                if self.bufs[victim as usize].dirty {
                    self.write(victim, devices, blocking);
                }
                self.remove_hash(victim);
                self.bufs[victim as usize].dev = dev;
                self.bufs[victim as usize].block = block;
                self.bufs[victim as usize].valid = false;
                self.bufs[victim as usize].refcnt = 1;
                self.insert_hash(victim);
                return victim;
            }

            blocking.block_on(BUF_FREE_CHANNEL);
        }
    }

    /// `read(dev, block)`: `get`, then fill from disk if not already valid.
    pub fn read(&mut self, dev: u32, block: u32, devices: &mut DeviceTable, blocking: &mut impl Blocking) -> u32 {
        let id = self.get(dev, block, devices, blocking);
        if !self.bufs[id as usize].valid {
            self.submit(id, false, devices, blocking);
            self.bufs[id as usize].valid = true;
        }
        id
    }

    /// `write(buffer)`: no-op if clean; otherwise submits a write request
    /// and clears the dirty bit.
    pub fn write(&mut self, id: u32, devices: &mut DeviceTable, blocking: &mut impl Blocking) {
        if !self.bufs[id as usize].dirty {
            return;
        }
        self.submit(id, true, devices, blocking);
        self.bufs[id as usize].dirty = false;
        self.bufs[id as usize].valid = true;
        let bufs_ptr: *mut [Buffer; NBUF] = &mut self.bufs;
        self.dirty.remove(id, move |i| Self::dirty_link_of(bufs_ptr, i));
    }

    fn submit(&mut self, id: u32, write: bool, devices: &mut DeviceTable, blocking: &mut impl Blocking) {
        let dev = self.bufs[id as usize].dev;
        let block = self.bufs[id as usize].block;
        let sector_offset = block * SECTORS_PER_BLOCK as u32;
        let (req_id, must_block) = devices
            .enqueue(dev as usize, sector_offset, SECTORS_PER_BLOCK as u32, write, id)
            .expect("buffer cache: device request queue exhausted");
        if must_block {
            blocking.block_on(req_id as usize);
        }
        let phys = devices.physical_device(dev as usize);
        let (_ok, next) = devices.run_head(phys, &mut self.bufs[id as usize].data);
        if let Some(next_req) = next {
            blocking.wake(next_req as usize);
        }
    }

    /// `release(buffer)`: decrement refcount; at zero, push onto the LRU
    /// (as most-recently-released) and wake one task waiting for a free
    /// buffer.
    pub fn release(&mut self, id: u32, blocking: &mut impl Blocking) {
        let b = &mut self.bufs[id as usize];
        assert!(b.refcnt > 0, "release of a buffer with no outstanding reference");
        b.refcnt -= 1;
        if b.refcnt == 0 {
            let bufs_ptr: *mut [Buffer; NBUF] = &mut self.bufs;
            self.lru.push_front(id, move |i| Self::lru_link_of(bufs_ptr, i));
            blocking.wake(BUF_FREE_CHANNEL);
        }
    }

    /// `mark_dirty(buffer, dirty)`: maintains dirty-list membership,
    /// independent of refcount; idempotent.
    pub fn mark_dirty(&mut self, id: u32, dirty: bool) {
        let was_dirty = self.bufs[id as usize].dirty;
        self.bufs[id as usize].dirty = dirty;
        if dirty == was_dirty {
            return;
        }
        let bufs_ptr: *mut [Buffer; NBUF] = &mut self.bufs;
        if dirty {
            self.dirty.push_back(id, move |i| Self::dirty_link_of(bufs_ptr, i));
        } else {
            self.dirty.remove(id, move |i| Self::dirty_link_of(bufs_ptr, i));
        }
    }

    /// `sync()`: writes every dirty buffer. Saves `next` before each write,
    /// since `write` unlinks the buffer it just wrote.
    pub fn sync(&mut self, devices: &mut DeviceTable, blocking: &mut impl Blocking) {
        let mut cur = self.dirty.front().unwrap_or(NIL);
        while cur != NIL {
            let next = self.bufs[cur as usize].dirty_link.next;
            self.write(cur, devices, blocking);
            cur = next;
        }
    }

    pub fn buffer(&self, id: u32) -> &Buffer {
        &self.bufs[id as usize]
    }

    pub fn buffer_mut(&mut self, id: u32) -> &mut Buffer {
        &mut self.bufs[id as usize]
    }
}

impl Default for BufCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSubtype, DeviceType, DriverOps};
    use crate::wait::NeverBlocks;

    fn ramdisk_ops() -> DriverOps {
        DriverOps {
            ioctl: |_dev, _cmd| 0,
            read: |_dev, _sector, _count, buf| {
                buf.fill(0xAB);
                true
            },
            write: |_dev, _sector, _count, _buf| true,
        }
    }

    fn harness() -> (BufCache, DeviceTable, NeverBlocks) {
        let mut devices = DeviceTable::new();
        devices.register(0, DeviceType::Block, DeviceSubtype::RamDisk, None, ramdisk_ops());
        (BufCache::new(), devices, NeverBlocks)
    }

    #[test]
    fn get_then_get_again_shares_the_same_buffer() {
        let (mut cache, mut devices, mut blocking) = harness();
        let a = cache.get(0, 5, &mut devices, &mut blocking);
        let b = cache.get(0, 5, &mut devices, &mut blocking);
        assert_eq!(a, b);
        assert_eq!(cache.bufs[a as usize].refcnt, 2);
    }

    #[test]
    fn release_to_zero_moves_buffer_onto_lru() {
        let (mut cache, mut devices, mut blocking) = harness();
        let id = cache.get(0, 5, &mut devices, &mut blocking);
        cache.release(id, &mut blocking);
        assert_eq!(cache.bufs[id as usize].refcnt, 0);
        assert_eq!(cache.lru.front(), Some(id));
    }

    #[test]
    fn read_fills_buffer_and_marks_valid() {
        let (mut cache, mut devices, mut blocking) = harness();
        let id = cache.read(0, 2, &mut devices, &mut blocking);
        assert!(cache.buffer(id).is_valid());
        assert_eq!(cache.buffer(id).data[0], 0xAB);
    }

    #[test]
    fn mark_dirty_is_idempotent_on_membership() {
        let (mut cache, mut devices, mut blocking) = harness();
        let id = cache.get(0, 1, &mut devices, &mut blocking);
        cache.mark_dirty(id, true);
        cache.mark_dirty(id, true);
        assert_eq!(cache.dirty.len(), 1);
        cache.mark_dirty(id, false);
        assert_eq!(cache.dirty.len(), 0);
    }

    #[test]
    fn write_clears_dirty_and_removes_from_dirty_list() {
        let (mut cache, mut devices, mut blocking) = harness();
        let id = cache.get(0, 1, &mut devices, &mut blocking);
        cache.mark_dirty(id, true);
        cache.write(id, &mut devices, &mut blocking);
        assert!(!cache.buffer(id).dirty);
        assert_eq!(cache.dirty.len(), 0);
    }
}
