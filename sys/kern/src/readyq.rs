// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-core priority-ordered ready queue.
//!
//! Priority levels are represented as a two-level bitmap: one summary word
//! with a bit per group of 32 priorities, and one group word each with
//! a bit per priority. A priority's bit is set exactly when its FIFO is
//! non-empty, so the highest occupied priority falls out of two
//! count-leading-zeros operations, making `find_highest` O(1).
//!
//! Within one priority, tasks are kept in FIFO order using an intrusive
//! "next task index" arena; a task appears in the queue at most once (a
//! task's additional pending activations are counted on the task itself,
//! not queued separately).
//!
//! All operations require the caller to hold the core-local interrupt lock;
//! nothing here blocks. Structural impossibilities (double enqueue, dequeue
//! of an absent task) are corruption of kernel state and escalate to the
//! panic path rather than returning an error.

use crate::descs::{MAX_TASKS, NUM_PRIORITIES, PRIO_GROUPS};
use crate::fail;
use abi::NONE_INDEX;

/// Link value meaning "this task is not queued at all", as opposed to
/// [`NONE_INDEX`] which terminates a FIFO chain.
const UNQUEUED: u16 = NONE_INDEX - 1;

#[derive(Clone)]
pub struct ReadyQueue {
    /// Bit `g` set iff `groups[g] != 0`.
    summary: u32,
    /// Bit `p % 32` of `groups[p / 32]` set iff the FIFO at priority `p` is
    /// non-empty.
    groups: [u32; PRIO_GROUPS],
    head: [u16; NUM_PRIORITIES],
    tail: [u16; NUM_PRIORITIES],
    /// Intrusive FIFO links, indexed by task.
    next: [u16; MAX_TASKS],
    /// Cached index of the current highest-priority head, maintained
    /// incrementally so the dispatcher never rescans.
    highest: u16,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            summary: 0,
            groups: [0; PRIO_GROUPS],
            head: [NONE_INDEX; NUM_PRIORITIES],
            tail: [NONE_INDEX; NUM_PRIORITIES],
            next: [UNQUEUED; MAX_TASKS],
            highest: NONE_INDEX,
        }
    }

    /// Appends `task` to the FIFO at `prio`.
    ///
    /// Escalates to the panic path if `task` is already queued; each task
    /// has exactly one queue slot, so a double enqueue means the activation
    /// bookkeeping upstream is corrupt.
    pub fn enqueue(&mut self, task: u16, prio: u8) {
        let p = usize::from(prio);
        if self.next[usize::from(task)] != UNQUEUED {
            fail::die("ready queue: task already queued");
        }
        self.next[usize::from(task)] = NONE_INDEX;
        match self.tail[p] {
            NONE_INDEX => {
                self.head[p] = task;
                self.set_bit(p);
            }
            t => self.next[usize::from(t)] = task,
        }
        self.tail[p] = task;

        self.update_highest_for_insert(task, prio);
    }

    /// Inserts `task` at the *head* of the FIFO at `prio`. Used when a
    /// running task returns to its base priority after releasing a ceiling
    /// lock: it had already won its place at that priority.
    fn enqueue_front(&mut self, task: u16, prio: u8) {
        let p = usize::from(prio);
        if self.next[usize::from(task)] != UNQUEUED {
            fail::die("ready queue: task already queued");
        }
        match self.head[p] {
            NONE_INDEX => {
                self.tail[p] = task;
                self.next[usize::from(task)] = NONE_INDEX;
                self.set_bit(p);
            }
            h => self.next[usize::from(task)] = h,
        }
        self.head[p] = task;

        self.update_highest_for_insert(task, prio);
    }

    /// Removes `task` from the FIFO at `prio`.
    ///
    /// Escalates to the panic path if the task is not queued there; asking
    /// to dequeue an absent task means task state and queue state disagree.
    pub fn dequeue(&mut self, task: u16, prio: u8) {
        let p = usize::from(prio);
        let mut cur = self.head[p];
        let mut prev = NONE_INDEX;
        while cur != NONE_INDEX && cur != task {
            prev = cur;
            cur = self.next[usize::from(cur)];
        }
        if cur == NONE_INDEX {
            fail::die("ready queue: dequeue of absent task");
        }

        let after = self.next[usize::from(task)];
        if prev == NONE_INDEX {
            self.head[p] = after;
        } else {
            self.next[usize::from(prev)] = after;
        }
        if self.tail[p] == task {
            self.tail[p] = prev;
        }
        if self.head[p] == NONE_INDEX {
            self.clear_bit(p);
        }
        self.next[usize::from(task)] = UNQUEUED;

        if self.highest == task {
            self.recompute_highest();
        }
    }

    /// Returns the task that should run: the FIFO head of the numerically
    /// highest occupied priority, or `None` if nothing is ready.
    pub fn find_highest(&self) -> Option<u16> {
        if self.highest == NONE_INDEX {
            None
        } else {
            Some(self.highest)
        }
    }

    /// Repositions `task` from `old` to the more important `new` priority,
    /// keeping FIFO fairness at the destination. Used when a task acquires
    /// a priority-ceiling lock.
    pub fn raise(&mut self, task: u16, old: u8, new: u8) {
        debug_assert!(new > old);
        self.dequeue(task, old);
        self.enqueue(task, new);
    }

    /// Repositions `task` from `old` down to `new`. The task keeps its
    /// claim at the destination priority (it was already running), so it is
    /// inserted at the head, ahead of tasks that arrived while it held the
    /// lock.
    pub fn lower(&mut self, task: u16, old: u8, new: u8) {
        debug_assert!(new < old);
        self.dequeue(task, old);
        self.enqueue_front(task, new);
    }

    /// True if `task` currently occupies a queue slot.
    pub fn contains(&self, task: u16) -> bool {
        self.next[usize::from(task)] != UNQUEUED
    }

    fn set_bit(&mut self, p: usize) {
        self.groups[p / 32] |= 1 << (p % 32);
        self.summary |= 1 << (p / 32);
    }

    fn clear_bit(&mut self, p: usize) {
        self.groups[p / 32] &= !(1 << (p % 32));
        if self.groups[p / 32] == 0 {
            self.summary &= !(1 << (p / 32));
        }
    }

    /// O(1) scan of the bitmap for the highest occupied priority.
    fn highest_occupied(&self) -> Option<usize> {
        if self.summary == 0 {
            return None;
        }
        let g = 31 - self.summary.leading_zeros() as usize;
        let b = 31 - self.groups[g].leading_zeros() as usize;
        Some(g * 32 + b)
    }

    fn recompute_highest(&mut self) {
        self.highest = match self.highest_occupied() {
            Some(p) => self.head[p],
            None => NONE_INDEX,
        };
    }

    /// Incremental cache maintenance: a newly inserted task only displaces
    /// the cached head if its priority strictly dominates, or if it became
    /// the head of the cache's own priority (front insert).
    fn update_highest_for_insert(&mut self, task: u16, prio: u8) {
        match self.highest_occupied() {
            Some(p) if p == usize::from(prio) => {
                if self.head[p] == task || self.highest == NONE_INDEX {
                    self.highest = self.head[p];
                }
            }
            Some(p) => {
                // Not the top priority; the cache can only be stale if it
                // was empty before.
                if self.highest == NONE_INDEX {
                    self.highest = self.head[p];
                }
            }
            None => unreachable!(),
        }
    }
}
