//! CFS-style scheduler: a ready queue ordered by `vruntime`, a sleep list
//! ordered by wakeup tick, and a single blocked-task list multiplexed by an
//! opaque channel value (see `wait::Blocking`).
//!
//! This module only knows about scheduling: nice/weight/vruntime/slice and
//! the Ready/Running/Blocked/Sleeping states. The rest of a task (pid, file
//! table, address space, ...) is `proc.rs`'s concern; it indexes the same
//! `TaskId` space so a `Scheduler` can be embedded in the kernel context
//! alongside the task table.

use arrayvec::ArrayVec;

use crate::list::{IndexList, Link, NIL};
use crate::param::{
    MIN_TIMESLICE_TICKS, NICE0_WEIGHT, NPROC, SCHED_LATENCY_TICKS, SCHED_WAKEUP_GRAN_TICKS,
    TICK_MS,
};
use crate::wait::Blocking;

pub type TaskId = u32;

/// Reserved id for the idle task. Never enters the ready tree; `schedule`
/// falls back to it when the tree is empty.
pub const IDLE: TaskId = 0;

const NICE_MIN: i32 = -20;
const NICE_MAX: i32 = 19;

/// Standard CFS nice-to-weight table. Index 20 (nice 0) is `NICE0_WEIGHT`.
const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, 9548, 7620, 6100, 4904,
    3906, 3121, 2501, 1991, 1586, 1277, 1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, 110,
    87, 70, 56, 45, 36, 29, 23, 18, 15,
];

fn weight_for_nice(nice: i32) -> u64 {
    let nice = nice.clamp(NICE_MIN, NICE_MAX);
    NICE_TO_WEIGHT[(nice - NICE_MIN) as usize] as u64
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    Unused,
    Ready,
    Running,
    Blocked,
    Sleeping,
}

#[derive(Clone, Copy)]
struct SchedEntity {
    state: TaskState,
    weight: u64,
    vruntime: u64,
    slice_ticks: u64,
    remaining_ticks: u64,
    wakeup_tick: u64,
    channel: usize,
    ready_link: Link,
    sleep_link: Link,
    block_link: Link,
}

impl SchedEntity {
    const fn unused() -> Self {
        Self {
            state: TaskState::Unused,
            weight: NICE0_WEIGHT,
            vruntime: 0,
            slice_ticks: 0,
            remaining_ticks: 0,
            wakeup_tick: 0,
            channel: 0,
            ready_link: Link::unlinked(),
            sleep_link: Link::unlinked(),
            block_link: Link::unlinked(),
        }
    }
}

pub struct Scheduler {
    tasks: [SchedEntity; NPROC],
    ready: IndexList,
    sleeping: IndexList,
    blocked: IndexList,
    total_weight: u64,
    min_vruntime: u64,
    current: Option<TaskId>,
    ticks: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        let mut tasks = [SchedEntity::unused(); NPROC];
        tasks[IDLE as usize].state = TaskState::Running;
        Self {
            tasks,
            ready: IndexList::new(),
            sleeping: IndexList::new(),
            blocked: IndexList::new(),
            total_weight: 0,
            min_vruntime: 0,
            current: Some(IDLE),
            ticks: 0,
        }
    }

    fn ready_link_of(&mut self) -> impl Fn(u32) -> *mut Link {
        let ptr: *mut [SchedEntity; NPROC] = &mut self.tasks;
        move |i: u32| unsafe { &mut (*ptr)[i as usize].ready_link as *mut Link }
    }

    fn sleep_link_of(&mut self) -> impl Fn(u32) -> *mut Link {
        let ptr: *mut [SchedEntity; NPROC] = &mut self.tasks;
        move |i: u32| unsafe { &mut (*ptr)[i as usize].sleep_link as *mut Link }
    }

    fn block_link_of(&mut self) -> impl Fn(u32) -> *mut Link {
        let ptr: *mut [SchedEntity; NPROC] = &mut self.tasks;
        move |i: u32| unsafe { &mut (*ptr)[i as usize].block_link as *mut Link }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current.filter(|&id| id != IDLE)
    }

    pub fn state_of(&self, id: TaskId) -> TaskState {
        self.tasks[id as usize].state
    }

    /// Finds a free task slot, gives it the queue's current fair share of
    /// vruntime, and marks it Ready. Slot 0 is reserved for the idle task.
    pub fn spawn(&mut self, nice: i32) -> Option<TaskId> {
        let id = (1..NPROC as u32).find(|&i| self.tasks[i as usize].state == TaskState::Unused)?;
        self.spawn_at(id, nice);
        Some(id)
    }

    /// Initializes slot `id`, which the caller already knows is free, the
    /// same way `spawn` does, without scanning for one. `proc.rs` uses this
    /// because it is itself the authority on which pid a new task gets
    /// (fork's child must land in the pid slot the process table chose);
    /// letting the scheduler pick independently would let the two tables
    /// disagree about which slot id names which task.
    pub fn spawn_at(&mut self, id: TaskId, nice: i32) {
        debug_assert_ne!(id, IDLE);
        debug_assert_eq!(self.tasks[id as usize].state, TaskState::Unused);
        {
            let t = &mut self.tasks[id as usize];
            t.weight = weight_for_nice(nice);
            t.vruntime = self.min_vruntime;
            t.slice_ticks = 0;
            t.remaining_ticks = 0;
        }
        self.make_ready(id);
    }

    /// Frees a task's scheduling slot. Caller must already have removed it
    /// from every list (it must not be Ready/Running/Blocked/Sleeping).
    pub fn retire(&mut self, id: TaskId) {
        debug_assert_ne!(id, IDLE);
        self.tasks[id as usize] = SchedEntity::unused();
    }

    /// Detaches the running task from scheduling permanently (`exit`): it
    /// will not be reinserted by the next `schedule`. Unlike `retire`, this
    /// does not imply the pid slot is free for reuse — `proc.rs` only frees
    /// that once the parent reaps the zombie via `waitpid`, so a stale
    /// `SchedEntity` lingering here is harmless and never looked at again.
    pub fn retire_running(&mut self) {
        let id = self.current.take().expect("retire_running with no running task");
        self.retire(id);
    }

    fn insert_ready(&mut self, id: TaskId) {
        let weight = self.tasks[id as usize].weight;
        self.total_weight += weight;
        let vr = self.tasks[id as usize].vruntime;
        let mut anchor = NIL;
        {
            let tasks = &self.tasks;
            self.ready.for_each(
                |i| tasks[i as usize].ready_link,
                |i| {
                    if anchor == NIL && (tasks[i as usize].vruntime, i) > (vr, id) {
                        anchor = i;
                    }
                },
            );
        }
        let link_of = self.ready_link_of();
        self.ready.insert_before(anchor, id, link_of);
    }

    fn remove_ready(&mut self, id: TaskId) {
        self.total_weight -= self.tasks[id as usize].weight;
        let link_of = self.ready_link_of();
        self.ready.remove(id, link_of);
    }

    fn insert_sleep(&mut self, id: TaskId) {
        let wakeup = self.tasks[id as usize].wakeup_tick;
        let mut anchor = NIL;
        {
            let tasks = &self.tasks;
            self.sleeping.for_each(
                |i| tasks[i as usize].sleep_link,
                |i| {
                    if anchor == NIL && tasks[i as usize].wakeup_tick > wakeup {
                        anchor = i;
                    }
                },
            );
        }
        let link_of = self.sleep_link_of();
        self.sleeping.insert_before(anchor, id, link_of);
    }

    fn remove_sleep(&mut self, id: TaskId) {
        let link_of = self.sleep_link_of();
        self.sleeping.remove(id, link_of);
    }

    fn remove_block(&mut self, id: TaskId) {
        let link_of = self.block_link_of();
        self.blocked.remove(id, link_of);
    }

    /// Marks `id` Ready and inserts it into the tree, clamping its vruntime
    /// up to `min_vruntime` so a task that was away a long time doesn't get
    /// an unbounded head start over everyone who stayed ready.
    fn make_ready(&mut self, id: TaskId) {
        let t = &mut self.tasks[id as usize];
        if t.vruntime < self.min_vruntime {
            t.vruntime = self.min_vruntime;
        }
        t.state = TaskState::Ready;
        self.insert_ready(id);
    }

    fn charge_vruntime(&mut self, id: TaskId) {
        if id == IDLE {
            return;
        }
        let t = &mut self.tasks[id as usize];
        let elapsed = t.slice_ticks.saturating_sub(t.remaining_ticks);
        t.vruntime += elapsed * NICE0_WEIGHT / t.weight.max(1);
    }

    fn assign_slice(&mut self, id: TaskId) {
        if id == IDLE {
            return;
        }
        let weight = self.tasks[id as usize].weight;
        // The incoming task is not in `total_weight` (it was just popped),
        // but it is still contending for the latency window, so add it back.
        let total = self.total_weight + weight;
        let slice = (weight * SCHED_LATENCY_TICKS / total.max(1)).max(MIN_TIMESLICE_TICKS);
        let t = &mut self.tasks[id as usize];
        t.slice_ticks = slice;
        t.remaining_ticks = slice;
    }

    /// Must be called with interrupts disabled (the caller's concern).
    /// Returns the task now Running.
    pub fn schedule(&mut self) -> TaskId {
        if let Some(out) = self.current.take() {
            self.charge_vruntime(out);
            if out != IDLE && self.tasks[out as usize].state == TaskState::Running {
                self.make_ready(out);
            }
        }
        let next = match self.ready.front() {
            Some(id) => {
                self.min_vruntime = self.min_vruntime.max(self.tasks[id as usize].vruntime);
                self.remove_ready(id);
                id
            }
            None => IDLE,
        };
        self.assign_slice(next);
        self.tasks[next as usize].state = TaskState::Running;
        self.current = Some(next);
        next
    }

    /// Keeps running unless a strictly more-deserving task exists; the
    /// outgoing task's state is left `Running`, so `schedule` reinserts it.
    pub fn yield_now(&mut self) -> TaskId {
        self.schedule()
    }

    fn wake_due_sleepers(&mut self) -> bool {
        let mut woke = false;
        loop {
            let head = match self.sleeping.front() {
                Some(h) => h,
                None => break,
            };
            if self.tasks[head as usize].wakeup_tick > self.ticks {
                break;
            }
            self.remove_sleep(head);
            self.make_ready(head);
            woke = true;
        }
        woke
    }

    /// Forces an immediate sweep of the sleep list. Returns whether anything
    /// was woken.
    pub fn wakeup(&mut self) -> bool {
        self.wake_due_sleepers()
    }

    /// Clock tick. Returns whether the caller should invoke `schedule`.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        let woke = self.wake_due_sleepers();
        match self.current {
            Some(IDLE) => !self.ready.is_empty(),
            Some(cur) => {
                let t = &mut self.tasks[cur as usize];
                if t.remaining_ticks > 0 {
                    t.remaining_ticks -= 1;
                }
                t.remaining_ticks == 0 || (woke && !self.ready.is_empty())
            }
            None => false,
        }
    }

    /// Puts the running task to sleep for at least `ms` milliseconds.
    pub fn sleep(&mut self, ms: u64) {
        let id = self.current.expect("sleep with no running task");
        debug_assert_ne!(id, IDLE, "the idle task never sleeps");
        let ticks = (ms + TICK_MS - 1) / TICK_MS;
        let ticks = ticks.max(1);
        let t = &mut self.tasks[id as usize];
        t.wakeup_tick = self.ticks + ticks;
        t.state = TaskState::Sleeping;
        self.insert_sleep(id);
        self.schedule();
    }

    /// Blocks the running task on `channel` until `wake(channel)` is called.
    fn block_current(&mut self, channel: usize) {
        let id = self.current.expect("block with no running task");
        debug_assert_ne!(id, IDLE, "the idle task never blocks");
        let t = &mut self.tasks[id as usize];
        t.channel = channel;
        t.state = TaskState::Blocked;
        let link_of = self.block_link_of();
        self.blocked.push_back(id, link_of);
        self.schedule();
    }

    /// Removes `id` from whatever it's blocked on and applies the sleeper
    /// fairness credit before making it Ready.
    fn unblock(&mut self, id: TaskId) {
        self.remove_block(id);
        let weight = self.tasks[id as usize].weight;
        let bonus = SCHED_WAKEUP_GRAN_TICKS * NICE0_WEIGHT / weight.max(1);
        let t = &mut self.tasks[id as usize];
        t.vruntime = t.vruntime.saturating_sub(bonus);
        self.make_ready(id);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Blocking for Scheduler {
    fn block_on(&mut self, channel: usize) {
        self.block_current(channel);
    }

    fn wake(&mut self, channel: usize) {
        let mut hits: ArrayVec<TaskId, NPROC> = ArrayVec::new();
        {
            let tasks = &self.tasks;
            self.blocked.for_each(
                |i| tasks[i as usize].block_link,
                |i| {
                    if tasks[i as usize].channel == channel {
                        let _ = hits.try_push(i);
                    }
                },
            );
        }
        for id in hits {
            self.unblock(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_zero_has_the_canonical_weight() {
        assert_eq!(weight_for_nice(0), NICE0_WEIGHT);
    }

    #[test]
    fn spawn_inserts_into_the_ready_tree_and_schedule_picks_it() {
        let mut s = Scheduler::new();
        let a = s.spawn(0).unwrap();
        assert_eq!(s.state_of(a), TaskState::Ready);
        let next = s.schedule();
        assert_eq!(next, a);
        assert_eq!(s.state_of(a), TaskState::Running);
        assert_eq!(s.current(), Some(a));
    }

    #[test]
    fn schedule_with_empty_tree_falls_back_to_idle() {
        let mut s = Scheduler::new();
        let next = s.schedule();
        assert_eq!(next, IDLE);
        assert_eq!(s.current(), None);
    }

    #[test]
    fn lower_vruntime_task_is_dispatched_first() {
        let mut s = Scheduler::new();
        let a = s.spawn(0).unwrap();
        let b = s.spawn(0).unwrap();
        // Give b a head start so it has run already and accrued vruntime.
        s.tasks[b as usize].vruntime = 1_000_000;
        let next = s.schedule();
        assert_eq!(next, a);
    }

    #[test]
    fn running_to_completion_accrues_vruntime_proportional_to_ticks() {
        let mut s = Scheduler::new();
        let a = s.spawn(0).unwrap();
        s.schedule();
        assert_eq!(s.current(), Some(a));
        let slice = s.tasks[a as usize].slice_ticks;
        for _ in 0..slice {
            s.tick();
        }
        assert_eq!(s.tasks[a as usize].remaining_ticks, 0);
        s.schedule();
        assert_eq!(s.tasks[a as usize].vruntime, slice * NICE0_WEIGHT / weight_for_nice(0));
    }

    #[test]
    fn sleep_list_wakes_in_ascending_order() {
        let mut s = Scheduler::new();
        let a = s.spawn(0).unwrap();
        s.schedule();
        s.tasks[a as usize].state = TaskState::Running;
        s.current = Some(a);
        s.sleep(30);
        assert_eq!(s.state_of(a), TaskState::Sleeping);

        for _ in 0..2 {
            assert!(!s.tick());
        }
        assert!(s.tick());
        assert_eq!(s.state_of(a), TaskState::Ready);
    }

    #[test]
    fn blocking_and_waking_by_channel_round_trips() {
        let mut s = Scheduler::new();
        let a = s.spawn(0).unwrap();
        s.schedule();
        s.tasks[a as usize].state = TaskState::Running;
        s.current = Some(a);
        s.block_on(42);
        assert_eq!(s.state_of(a), TaskState::Blocked);

        s.wake(7); // unrelated channel: no effect
        assert_eq!(s.state_of(a), TaskState::Blocked);

        s.wake(42);
        assert_eq!(s.state_of(a), TaskState::Ready);
    }

    #[test]
    fn retire_clears_the_slot_for_reuse() {
        let mut s = Scheduler::new();
        let a = s.spawn(0).unwrap();
        s.remove_ready(a);
        s.retire(a);
        assert_eq!(s.state_of(a), TaskState::Unused);
        let b = s.spawn(0).unwrap();
        assert_eq!(a, b);
    }
}
