//! L3: the device table and the elevator (C-SCAN) block-request queue
//! (`SPEC_FULL.md` §4.5, §6.6).
//!
//! Drivers (console, keyboard, IDE, RAM-disk, serial — external
//! collaborators per §1) register here through three function pointers and
//! a handful of `ioctl` commands; the core never reaches into a driver's
//! own state.
//! This module owns only the request-ordering policy and the blocking glue
//! that gives every device at most one request in flight.

use crate::list::{IndexList, Link, NIL};
use crate::param::{NDEV, NREQUEST};

pub const DEV_CMD_SECTOR_START: u32 = 1;
pub const DEV_CMD_SECTOR_SIZE: u32 = 2;
/// Tells a character device (the console) to blank its display, the way
/// `original_source`'s `console_clear` does for the VGA text buffer.
pub const DEV_CMD_CLEAR: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceType {
    Null,
    Char,
    Block,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceSubtype {
    Console,
    Keyboard,
    IdeDisk,
    IdePart,
    Serial,
    RamDisk,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Up,
    Down,
}

/// The function pointers a driver registers. `ioctl` answers
/// `DEV_CMD_SECTOR_START`/`_SIZE`; `read`/`write` move `count` sectors
/// starting at absolute `sector` through `buf`.
pub struct DriverOps {
    pub ioctl: fn(dev: usize, cmd: u32) -> i64,
    pub read: fn(dev: usize, sector: u32, count: u32, buf: &mut [u8]) -> bool,
    pub write: fn(dev: usize, sector: u32, count: u32, buf: &[u8]) -> bool,
}

/// One queued I/O, sorted into its device's request list by absolute
/// sector (`SPEC_FULL.md` §4.5 step 2).
#[derive(Clone, Copy)]
pub struct Request {
    pub dev: usize,
    pub sector: u32,
    pub count: u32,
    pub write: bool,
    /// Identifies the waiting task, for `task_unblock` by the caller.
    pub waiter: u32,
    /// Set by the request layer once the driver call completes.
    pub done: bool,
    pub ok: bool,
    link: Link,
}

impl Request {
    const fn empty() -> Self {
        Self {
            dev: 0,
            sector: 0,
            count: 0,
            write: false,
            waiter: 0,
            done: false,
            ok: false,
            link: Link::unlinked(),
        }
    }
}

pub struct DeviceEntry {
    pub kind: DeviceType,
    pub subtype: DeviceSubtype,
    pub parent: Option<usize>,
    pub ops: Option<DriverOps>,
    requests: IndexList,
    direction: Direction,
    present: bool,
}

impl DeviceEntry {
    const fn empty() -> Self {
        Self {
            kind: DeviceType::Null,
            subtype: DeviceSubtype::Console,
            parent: None,
            ops: None,
            requests: IndexList::new(),
            direction: Direction::Up,
            present: false,
        }
    }
}

/// Fixed-size device table plus a shared pool of request records, so the
/// whole layer is allocation-free.
pub struct DeviceTable {
    devices: [DeviceEntry; NDEV],
    requests: [Request; NREQUEST],
    free_requests: IndexList,
}

impl DeviceTable {
    pub fn new() -> Self {
        let mut table = Self {
            devices: core::array::from_fn(|_| DeviceEntry::empty()),
            requests: core::array::from_fn(|_| Request::empty()),
            free_requests: IndexList::new(),
        };
        for i in (0..NREQUEST as u32).rev() {
            let requests_ptr: *mut [Request; NREQUEST] = &mut table.requests;
            table
                .free_requests
                .push_front(i, move |j| unsafe { &mut (*requests_ptr)[j as usize].link as *mut Link });
        }
        table
    }

    pub fn register(
        &mut self,
        dev: usize,
        kind: DeviceType,
        subtype: DeviceSubtype,
        parent: Option<usize>,
        ops: DriverOps,
    ) {
        let entry = &mut self.devices[dev];
        entry.kind = kind;
        entry.subtype = subtype;
        entry.parent = parent;
        entry.ops = Some(ops);
        entry.present = true;
    }

    fn resolve_physical(&self, dev: usize) -> usize {
        let mut d = dev;
        while let Some(p) = self.devices[d].parent {
            d = p;
        }
        d
    }

    /// The physical device backing `dev` (itself, if `dev` has no parent),
    /// for callers that need to pass it to `run_head`.
    pub fn physical_device(&self, dev: usize) -> usize {
        self.resolve_physical(dev)
    }

    /// Issues a raw `ioctl` to `dev`'s own driver (not its physical parent,
    /// unlike `sector_start` — a command like `DEV_CMD_CLEAR` is meaningless
    /// on a partition's backing disk). Returns `-1` if `dev` has no driver.
    pub fn ioctl(&self, dev: usize, cmd: u32) -> i64 {
        match self.devices[dev].ops.as_ref() {
            Some(ops) => (ops.ioctl)(dev, cmd),
            None => -1,
        }
    }

    fn sector_start(&self, dev: usize) -> u32 {
        let phys = self.resolve_physical(dev);
        match self.devices[dev].ops.as_ref().or(self.devices[phys].ops.as_ref()) {
            Some(ops) => (ops.ioctl)(dev, DEV_CMD_SECTOR_START).max(0) as u32,
            None => 0,
        }
    }

    /// `request(dev, buf, count, block, flags, type)` from §4.5, split into
    /// the enqueue half (steps 1-3) and a completion step the caller
    /// invokes once its block has finished (steps 4-6), since blocking
    /// itself is the scheduler's job, not this layer's.
    ///
    /// Returns `(request_id, must_block)`. If `must_block` is `false`, the
    /// request is already at the head and the caller should run the driver
    /// immediately; otherwise the caller blocks `waiter` until woken, then
    /// calls `run_head`.
    pub fn enqueue(&mut self, dev: usize, sector_offset: u32, count: u32, write: bool, waiter: u32) -> Option<(u32, bool)> {
        let abs_sector = self.sector_start(dev) + sector_offset;
        let phys = self.resolve_physical(dev);
        let requests_ptr: *mut [Request; NREQUEST] = &mut self.requests;
        let link_of = move |i: u32| unsafe { &mut (*requests_ptr)[i as usize].link as *mut Link };
        let id = self.free_requests.pop_front(link_of)?;
        {
            let r = &mut self.requests[id as usize];
            r.dev = phys;
            r.sector = abs_sector;
            r.count = count;
            r.write = write;
            r.waiter = waiter;
            r.done = false;
            r.ok = false;
        }
        let was_empty = self.devices[phys].requests.is_empty();
        self.insert_sorted(phys, id);
        Some((id, !was_empty))
    }

    /// Keeps the list ordered the way the elevator is currently sweeping:
    /// ascending while `direction` is `Up`, descending while it's `Down`
    /// (§4.5 step 2), so `run_head` can always just service the front.
    fn insert_sorted(&mut self, phys: usize, id: u32) {
        let sector = self.requests[id as usize].sector;
        let direction = self.devices[phys].direction;
        let anchor = {
            let list = &self.devices[phys].requests;
            let mut cur = list.front().unwrap_or(NIL);
            let mut found = NIL;
            while cur != NIL {
                let at = self.requests[cur as usize].sector;
                let past = match direction {
                    Direction::Up => at >= sector,
                    Direction::Down => at <= sector,
                };
                if past {
                    found = cur;
                    break;
                }
                cur = self.requests[cur as usize].link.next;
            }
            found
        };
        let requests_ptr: *mut [Request; NREQUEST] = &mut self.requests;
        let link_of = move |i: u32| unsafe { &mut (*requests_ptr)[i as usize].link as *mut Link };
        self.devices[phys].requests.insert_before(anchor, id, link_of);
    }

    /// Runs the driver synchronously for the request at the head of its
    /// device's list (step 4), then advances the elevator (step 5) and
    /// frees the record (step 6). Returns the id of the next request now
    /// at the head, if the caller should unblock its waiter.
    pub fn run_head(&mut self, phys_dev: usize, buf: &mut [u8]) -> (bool, Option<u32>) {
        let id = match self.devices[phys_dev].requests.front() {
            Some(i) => i,
            None => return (false, None),
        };
        let (sector, count, write) = {
            let r = &self.requests[id as usize];
            (r.sector, r.count, r.write)
        };
        let ok = match &self.devices[phys_dev].ops {
            Some(ops) if write => (ops.write)(phys_dev, sector, count, buf),
            Some(ops) => (ops.read)(phys_dev, sector, count, buf),
            None => false,
        };
        self.advance_elevator(phys_dev, id);
        let requests_ptr: *mut [Request; NREQUEST] = &mut self.requests;
        let link_of = move |i: u32| unsafe { &mut (*requests_ptr)[i as usize].link as *mut Link };
        self.devices[phys_dev].requests.remove(id, link_of);
        self.free_requests.push_front(id, link_of);
        let next = self.devices[phys_dev].requests.front();
        (ok, next)
    }

    fn advance_elevator(&mut self, phys_dev: usize, completed: u32) {
        let list = &self.devices[phys_dev].requests;
        let at_tail = list.back() == Some(completed);
        let at_head = list.front() == Some(completed);
        if at_tail && self.devices[phys_dev].direction == Direction::Up {
            self.devices[phys_dev].direction = Direction::Down;
        } else if at_head && self.devices[phys_dev].direction == Direction::Down {
            self.devices[phys_dev].direction = Direction::Up;
        }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_ops() -> DriverOps {
        DriverOps {
            ioctl: |_dev, cmd| if cmd == DEV_CMD_SECTOR_START { 0 } else { 512 },
            read: |_dev, _sector, _count, _buf| true,
            write: |_dev, _sector, _count, _buf| true,
        }
    }

    #[test]
    fn requests_are_sorted_by_ascending_sector() {
        let mut table = DeviceTable::new();
        table.register(0, DeviceType::Block, DeviceSubtype::RamDisk, None, noop_ops());
        let (_id1, must_block1) = table.enqueue(0, 30, 1, false, 1).unwrap();
        assert!(!must_block1);
        let (_id2, must_block2) = table.enqueue(0, 10, 1, false, 2).unwrap();
        assert!(must_block2);
        let (_id3, _) = table.enqueue(0, 20, 1, false, 3).unwrap();

        let front = table.devices[0].requests.front().unwrap();
        assert_eq!(table.requests[front as usize].sector, 10);
        let back = table.devices[0].requests.back().unwrap();
        assert_eq!(table.requests[back as usize].sector, 30);
    }

    #[test]
    fn ioctl_reaches_the_registered_driver_directly_not_its_physical_parent() {
        let mut table = DeviceTable::new();
        table.register(
            0,
            DeviceType::Char,
            DeviceSubtype::Console,
            None,
            DriverOps {
                ioctl: |_dev, cmd| if cmd == DEV_CMD_CLEAR { 0 } else { -1 },
                read: |_dev, _sector, _count, _buf| true,
                write: |_dev, _sector, _count, _buf| true,
            },
        );
        assert_eq!(table.ioctl(0, DEV_CMD_CLEAR), 0);
        assert_eq!(table.ioctl(1, DEV_CMD_CLEAR), -1);
    }

    #[test]
    fn elevator_reverses_direction_at_the_tail_and_sorts_descending_on_the_way_down() {
        let mut table = DeviceTable::new();
        table.register(0, DeviceType::Block, DeviceSubtype::RamDisk, None, noop_ops());
        let mut buf = [0u8; 512];
        table.enqueue(0, 10, 1, false, 1).unwrap();
        table.enqueue(0, 30, 1, false, 2).unwrap();
        table.enqueue(0, 20, 1, false, 3).unwrap();
        // Services 10, reaching neither end yet; direction stays Up.
        table.run_head(0, &mut buf);
        assert_eq!(table.devices[0].direction, Direction::Up);
        // Services 20, the new front — still ascending order, still at the
        // list's tail relative to nothing remaining above it yet.
        table.run_head(0, &mut buf);
        // Only 30 left: it is both head and tail, so servicing it flips
        // the elevator to Down for whatever is queued next.
        table.run_head(0, &mut buf);
        assert_eq!(table.devices[0].direction, Direction::Down);
        assert!(table.devices[0].requests.is_empty());

        let (_id, _) = table.enqueue(0, 15, 1, false, 4).unwrap();
        table.enqueue(0, 5, 1, false, 5).unwrap();
        // Now sweeping down: the list is kept in descending order, so the
        // higher sector is serviced first.
        let front = table.devices[0].requests.front().unwrap();
        assert_eq!(table.requests[front as usize].sector, 15);
    }

    #[test]
    fn run_head_frees_the_record_for_reuse() {
        let mut table = DeviceTable::new();
        table.register(0, DeviceType::Block, DeviceSubtype::RamDisk, None, noop_ops());
        let mut buf = [0u8; 512];
        table.enqueue(0, 10, 1, false, 1).unwrap();
        let (ok, next) = table.run_head(0, &mut buf);
        assert!(ok);
        assert!(next.is_none());
        assert!(table.devices[0].requests.is_empty());
    }
}
