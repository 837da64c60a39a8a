//! Process lifecycle: the PCB table, fork, exit, and waitpid
//! (`SPEC_FULL.md` §4.8).
//!
//! A task's pid is the index of its slot in the fixed `NPROC`-sized table.
//! That same index is used as its `sched::TaskId`: the process table is the
//! single authority on which slot a new task gets (`fork`/`create_init`
//! pick the slot, then hand it to `sched::Scheduler::spawn_at`), so the two
//! tables never disagree about what a given id names. A pid is only made
//! available for reuse once its parent reaps it in `waitpid` — exiting only
//! detaches a task from the scheduler (`retire_running`), it does not free
//! the pid.

use crate::kalloc::PageFrameAllocator;
use crate::list::{IndexList, Link, NIL};
use crate::param::{MAXPROCNAME, NOFILE, NPROC};
use crate::sched::{Scheduler, TaskId};
use crate::vm::AddressSpace;
use crate::wait::Blocking;

pub type Pid = i32;

/// pid of the task every exiting process's orphaned children are reparented
/// to. Created once at boot by `TaskTable::create_init`, never itself
/// waited on (it has no parent), so `exit`'s reparenting step always has a
/// valid target.
pub const INIT_PID: Pid = 1;

/// Wildcard for `waitpid`'s `pid` argument: match any child.
pub const ANY_CHILD: i32 = -1;

const CANARY: u32 = 0xDEAD_C0DE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Waiting,
    Died,
}

pub struct Task {
    pub state: ProcState,
    pub pid: Pid,
    pub ppid: Pid,
    pub exit_status: i32,
    pub wait_target: i32,
    pub uid: u16,
    pub gid: u16,
    pub umask: u16,
    pub name: [u8; MAXPROCNAME],
    pub address_space: Option<AddressSpace>,
    pub heap_end: usize,
    pub image_text: usize,
    pub image_data: usize,
    pub image_end: usize,
    /// Pinned `fs::inode::InodeRef`s (an `iget` the task itself owns until
    /// `exit`/`sys_chdir` drops it with `iput`).
    pub root_inode: Option<u32>,
    pub cwd_inode: Option<u32>,
    /// File-object ids into `file::FileTable`.
    pub fds: [Option<u32>; NOFILE],
    canary: u32,
    children: IndexList,
    sibling_link: Link,
}

impl Task {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            ppid: 0,
            exit_status: 0,
            wait_target: ANY_CHILD,
            uid: 0,
            gid: 0,
            umask: 0o022,
            name: [0; MAXPROCNAME],
            address_space: None,
            heap_end: 0,
            image_text: 0,
            image_data: 0,
            image_end: 0,
            root_inode: None,
            cwd_inode: None,
            fds: [None; NOFILE],
            canary: CANARY,
            children: IndexList::new(),
            sibling_link: Link::unlinked(),
        }
    }

    pub fn canary_intact(&self) -> bool {
        self.canary == CANARY
    }
}

pub struct TaskTable {
    tasks: [Task; NPROC],
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: array_macro::array![_ => Task::new(); NPROC],
        }
    }

    pub fn get(&self, pid: Pid) -> &Task {
        &self.tasks[pid as usize]
    }

    /// Mutable access for syscalls (`sysfile.rs`'s fd-table and
    /// cwd/root-inode operations) that need to mutate fields besides the
    /// address space.
    pub fn get_mut(&mut self, pid: Pid) -> &mut Task {
        &mut self.tasks[pid as usize]
    }

    /// Mutable access to `pid`'s address space, for syscalls (`sys_brk`,
    /// eventually `sys_mmap`/`sys_munmap`) that operate on it directly
    /// without going through `fork`/`exit`/`exec`.
    pub fn address_space_mut(&mut self, pid: Pid) -> Option<&mut AddressSpace> {
        self.tasks[pid as usize].address_space.as_mut()
    }

    /// Test-only escape hatch for other modules' unit tests (`sysproc.rs`,
    /// `syscall.rs`) to stand up a runnable task without an `AddressSpace`,
    /// the same role `kalloc.rs`'s `set_range_for_test` plays there.
    #[cfg(test)]
    pub(crate) fn debug_spawn_for_test(&mut self, pid: Pid, ppid: Pid) {
        let t = &mut self.tasks[pid as usize];
        t.state = ProcState::Ready;
        t.pid = pid;
        t.ppid = ppid;
    }

    fn sibling_link_of(&mut self) -> impl Fn(u32) -> *mut Link {
        let ptr: *mut [Task; NPROC] = &mut self.tasks;
        move |i: u32| unsafe { &mut (*ptr)[i as usize].sibling_link as *mut Link }
    }

    fn link_child(&mut self, parent: Pid, child: Pid) {
        let link_of = self.sibling_link_of();
        self.tasks[parent as usize].children.push_back(child as u32, link_of);
    }

    fn unlink_child(&mut self, parent: Pid, child: Pid) {
        let link_of = self.sibling_link_of();
        self.tasks[parent as usize].children.remove(child as u32, link_of);
    }

    /// Splices every child of `from` onto `to`'s children list, fixing up
    /// `ppid` as it goes. Used by `exit` to reparent orphans to init.
    fn reparent_children(&mut self, from: Pid, to: Pid) {
        loop {
            let link_of = self.sibling_link_of();
            let child = match self.tasks[from as usize].children.pop_front(link_of) {
                Some(c) => c,
                None => break,
            };
            self.tasks[child as usize].ppid = to;
            let link_of = self.sibling_link_of();
            self.tasks[to as usize].children.push_back(child, link_of);
        }
    }

    /// Finds a child of `parent` matching `target` (`ANY_CHILD` or a
    /// specific pid). Returns `(pid, already_died)`; prefers a Died match
    /// so `waitpid` doesn't keep scanning once one is available to reap.
    fn find_matching_child(&self, parent: Pid, target: i32) -> Option<(Pid, bool)> {
        let mut cur = self.tasks[parent as usize].children.front();
        let mut any = None;
        while let Some(idx) = cur {
            let c = &self.tasks[idx as usize];
            if target == ANY_CHILD || c.pid == target {
                if c.state == ProcState::Died {
                    return Some((c.pid, true));
                }
                any.get_or_insert(c.pid);
            }
            cur = if c.sibling_link.next == NIL {
                None
            } else {
                Some(c.sibling_link.next)
            };
        }
        any.map(|pid| (pid, false))
    }

    /// Constructs pid 1 directly, the way boot brings up `init`: not via
    /// `fork` (there is no parent to copy from), a freshly allocated empty
    /// address space instead.
    pub fn create_init(&mut self, scheduler: &mut Scheduler, frames: &mut PageFrameAllocator) -> Pid {
        debug_assert_eq!(self.tasks[INIT_PID as usize].state, ProcState::Unused);
        let address_space = AddressSpace::new(frames).expect("out of frames during boot");
        scheduler.spawn_at(INIT_PID as TaskId, 0);
        let t = &mut self.tasks[INIT_PID as usize];
        t.state = ProcState::Ready;
        t.pid = INIT_PID;
        t.ppid = 0;
        t.address_space = Some(address_space);
        let name = b"init";
        t.name[..name.len()].copy_from_slice(name);
        INIT_PID
    }

    /// Copies `parent`'s PCB state and clones its address space via CoW.
    /// Returns the child's pid, already Ready in the scheduler.
    pub fn fork(&mut self, scheduler: &mut Scheduler, frames: &mut PageFrameAllocator, parent: Pid) -> Option<Pid> {
        let child_as = self.tasks[parent as usize].address_space.as_ref()?.copy_pde(frames)?;

        let child_pid = (1..NPROC as i32).find(|&i| self.tasks[i as usize].state == ProcState::Unused);
        let child_pid = match child_pid {
            Some(pid) => pid,
            None => {
                child_as.free_pde(frames);
                return None;
            }
        };
        scheduler.spawn_at(child_pid as TaskId, 0);

        let (ppid, uid, gid, umask, name, heap_end, image_text, image_data, image_end, root_inode, cwd_inode, fds) = {
            let p = &self.tasks[parent as usize];
            (
                p.pid, p.uid, p.gid, p.umask, p.name, p.heap_end, p.image_text, p.image_data,
                p.image_end, p.root_inode, p.cwd_inode, p.fds,
            )
        };

        let child = &mut self.tasks[child_pid as usize];
        child.state = ProcState::Ready;
        child.pid = child_pid;
        child.ppid = ppid;
        child.exit_status = 0;
        child.wait_target = ANY_CHILD;
        child.uid = uid;
        child.gid = gid;
        child.umask = umask;
        child.name = name;
        child.address_space = Some(child_as);
        child.heap_end = heap_end;
        child.image_text = image_text;
        child.image_data = image_data;
        child.image_end = image_end;
        // TODO(fs): bump these inodes' refcounts via iget once the inode
        // cache exists; for now the ids are copied without a matching iget.
        child.root_inode = root_inode;
        child.cwd_inode = cwd_inode;
        // TODO(fs): bump each open file object's refcount via its own dup.
        child.fds = fds;

        self.link_child(parent, child_pid);
        Some(child_pid)
    }

    /// Tears down `pid`'s resources and reparents its children to init.
    /// Marks the task Died; the slot itself is freed only by `waitpid`.
    /// The caller must invoke `scheduler.schedule()` immediately after —
    /// this task never runs again.
    pub fn exit(&mut self, scheduler: &mut Scheduler, frames: &mut PageFrameAllocator, pid: Pid, status: i32) {
        if let Some(address_space) = self.tasks[pid as usize].address_space.take() {
            address_space.free_pde(frames);
        }
        // `root_inode`/`cwd_inode`/`fds` are cleared here unconditionally
        // (so a dying task never looks like it still holds them), but the
        // matching `iput`/`close` calls are the caller's job first —
        // `sysfile::FileSyscalls::sys_exit_fs`, which this method's own
        // caller (`kernel.rs`'s `sys_exit` glue) runs before `exit` itself,
        // since releasing them needs the `fs`/`file` state this table
        // deliberately doesn't borrow.
        self.tasks[pid as usize].root_inode = None;
        self.tasks[pid as usize].cwd_inode = None;
        self.tasks[pid as usize].fds = [None; NOFILE];

        self.reparent_children(pid, INIT_PID);

        self.tasks[pid as usize].exit_status = status;
        self.tasks[pid as usize].state = ProcState::Died;

        let ppid = self.tasks[pid as usize].ppid;
        if ppid != 0 {
            let p = &self.tasks[ppid as usize];
            let waiting = p.state == ProcState::Waiting
                && (p.wait_target == ANY_CHILD || p.wait_target == pid);
            if waiting {
                scheduler.wake(ppid as usize);
            }
        }

        scheduler.retire_running();
    }

    /// Blocks `pid` until a matching child is Died, reaps it, and returns
    /// its pid and status. Returns `-1` immediately if no matching child
    /// exists at all (spec's "no child" case).
    pub fn waitpid(&mut self, scheduler: &mut Scheduler, pid: Pid, target: i32, status_out: &mut i32) -> Pid {
        loop {
            match self.find_matching_child(pid, target) {
                Some((child, true)) => {
                    *status_out = self.tasks[child as usize].exit_status;
                    self.unlink_child(pid, child);
                    self.tasks[child as usize] = Task::new();
                    return child;
                }
                Some((_, false)) => {
                    self.tasks[pid as usize].state = ProcState::Waiting;
                    self.tasks[pid as usize].wait_target = target;
                    scheduler.block_on(pid as usize);
                    self.tasks[pid as usize].state = ProcState::Running;
                }
                None => return -1,
            }
        }
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Registers a child of `parent` the way `fork` would, without touching
    /// `AddressSpace` (which dereferences real page-table windows and has
    /// no host-testable path, the same boundary `vm.rs`'s own tests keep).
    fn spawn_child(tasks: &mut TaskTable, scheduler: &mut Scheduler, parent: Pid) -> Pid {
        let child_pid = (1..NPROC as i32)
            .find(|&i| tasks.tasks[i as usize].state == ProcState::Unused)
            .unwrap();
        scheduler.spawn_at(child_pid as TaskId, 0);
        let ppid = tasks.tasks[parent as usize].pid;
        let c = &mut tasks.tasks[child_pid as usize];
        c.state = ProcState::Ready;
        c.pid = child_pid;
        c.ppid = ppid;
        tasks.link_child(parent, child_pid);
        child_pid
    }

    fn init_only(tasks: &mut TaskTable) {
        let t = &mut tasks.tasks[INIT_PID as usize];
        t.state = ProcState::Ready;
        t.pid = INIT_PID;
        t.ppid = 0;
    }

    #[test]
    fn fresh_table_has_every_slot_unused() {
        let tasks = TaskTable::new();
        for pid in 0..NPROC as i32 {
            assert_eq!(tasks.get(pid).state, ProcState::Unused);
            assert!(tasks.get(pid).canary_intact());
        }
    }

    #[test]
    fn waitpid_returns_minus_one_with_no_children() {
        let mut tasks = TaskTable::new();
        let mut scheduler = Scheduler::new();
        init_only(&mut tasks);
        let mut status = 0;
        assert_eq!(tasks.waitpid(&mut scheduler, INIT_PID, ANY_CHILD, &mut status), -1);
    }

    #[test]
    fn waitpid_reaps_a_died_child_immediately() {
        let mut tasks = TaskTable::new();
        let mut scheduler = Scheduler::new();
        init_only(&mut tasks);
        let child = spawn_child(&mut tasks, &mut scheduler, INIT_PID);
        tasks.tasks[child as usize].state = ProcState::Died;
        tasks.tasks[child as usize].exit_status = 7;

        let mut status = 0;
        let reaped = tasks.waitpid(&mut scheduler, INIT_PID, ANY_CHILD, &mut status);
        assert_eq!(reaped, child);
        assert_eq!(status, 7);
        assert_eq!(tasks.get(child).state, ProcState::Unused);
    }

    #[test]
    fn waiting_on_a_live_child_blocks_the_parent_on_its_own_pid_channel() {
        // Exercises the scheduler interaction `waitpid` relies on directly,
        // since the full blocks-until-woken loop needs a real context
        // switch (trap.rs) to suspend and resume a call stack, which this
        // kernel doesn't have yet.
        let mut tasks = TaskTable::new();
        let mut scheduler = Scheduler::new();
        init_only(&mut tasks);
        scheduler.spawn_at(INIT_PID as TaskId, 0);
        let child = spawn_child(&mut tasks, &mut scheduler, INIT_PID);
        scheduler.schedule();
        assert_eq!(scheduler.current(), Some(INIT_PID as TaskId));

        assert_eq!(tasks.find_matching_child(INIT_PID, ANY_CHILD), Some((child, false)));
        tasks.tasks[INIT_PID as usize].state = ProcState::Waiting;
        tasks.tasks[INIT_PID as usize].wait_target = ANY_CHILD;
        scheduler.block_on(INIT_PID as usize);
        assert_eq!(scheduler.state_of(INIT_PID as TaskId), crate::sched::TaskState::Blocked);

        tasks.tasks[child as usize].state = ProcState::Died;
        scheduler.wake(INIT_PID as usize);
        assert_eq!(scheduler.state_of(INIT_PID as TaskId), crate::sched::TaskState::Ready);
    }

    #[test]
    fn exit_reparents_orphans_to_init() {
        let mut tasks = TaskTable::new();
        let mut scheduler = Scheduler::new();
        init_only(&mut tasks);
        let parent = spawn_child(&mut tasks, &mut scheduler, INIT_PID);
        let grandchild = spawn_child(&mut tasks, &mut scheduler, parent);

        tasks.reparent_children(parent, INIT_PID);
        assert_eq!(tasks.get(grandchild).ppid, INIT_PID);
        assert_eq!(
            tasks.find_matching_child(INIT_PID, grandchild).map(|(p, _)| p),
            Some(grandchild)
        );
    }

    #[test]
    fn pid_slot_is_reused_only_after_reaping() {
        let mut tasks = TaskTable::new();
        let mut scheduler = Scheduler::new();
        init_only(&mut tasks);
        let child = spawn_child(&mut tasks, &mut scheduler, INIT_PID);
        tasks.tasks[child as usize].state = ProcState::Died;

        // A second fork-style allocation must skip the zombie slot.
        let other = spawn_child(&mut tasks, &mut scheduler, INIT_PID);
        assert_ne!(other, child);

        let mut status = 0;
        tasks.waitpid(&mut scheduler, INIT_PID, child, &mut status);
        assert_eq!(tasks.get(child).state, ProcState::Unused);
    }
}
