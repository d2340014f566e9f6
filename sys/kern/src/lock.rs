// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lock manager.
//!
//! There are two layers here. The *raw* layer ([`LockTable`]) hands out
//! short kernel-internal critical sections: taking a lock disables local
//! interrupts, spins for the underlying primitive, and returns a guard that
//! releases the primitive and restores the exact previous interrupt state
//! when dropped, so sections nest without the layers having to coordinate
//! interrupt policy.
//!
//! Locks come in two tiers by index. The first [`HW_LOCKS`] map directly
//! onto hardware lock primitives. The rest are software locks: their held
//! flags are guarded by reserved hardware lock 0, and contention is handled
//! by a release-and-retry loop that restores interrupts between attempts so
//! a contended lock never extends the interrupt-disabled window.
//!
//! The *ceiling* layer ([`CeilingState`]) implements the user-facing
//! acquire/release service on top: occupying a lock raises the task to the
//! lock's configured ceiling priority, bounding priority inversion, and
//! release restores the saved priority and checks the hold-time budget.

use core::cell::Cell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::{LockId, Priority, ProtectionFault, ServiceError, NONE_INDEX};

use crate::descs::{LockDesc, HW_LOCKS, MAX_TASKS, NUM_LOCKS, SW_LOCKS};
use crate::err::UserError;
use crate::fail;
use crate::readyq::ReadyQueue;
use crate::task::Task;

/// Index of the hardware lock reserved as the software tier's guard. Not
/// available through [`LockTable::take`].
const SW_GUARD: usize = 0;

/// Core-local interrupt-enable state.
///
/// The architecture-specific enable/disable instructions are out of scope;
/// this models their effect so the nesting discipline is real and testable.
/// One per core, never shared.
pub struct IrqControl {
    enabled: Cell<bool>,
}

impl Default for IrqControl {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqControl {
    pub fn new() -> Self {
        IrqControl {
            enabled: Cell::new(true),
        }
    }

    /// Disables interrupts, returning the previous state for exact
    /// restoration.
    pub fn disable(&self) -> bool {
        self.enabled.replace(false)
    }

    pub fn restore(&self, prev: bool) {
        self.enabled.set(prev);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }
}

/// One hardware lock primitive, modeled as an atomic flag.
struct HwLock {
    held: AtomicBool,
}

impl HwLock {
    const fn new() -> Self {
        HwLock {
            held: AtomicBool::new(false),
        }
    }

    fn try_take(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn take(&self) {
        while !self.try_take() {
            spin_loop();
        }
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// The image-wide lock table, shared by all cores.
pub struct LockTable {
    hw: [HwLock; HW_LOCKS],
    /// Held flags of the software tier, guarded by `hw[SW_GUARD]`. Atomics
    /// so remote cores' reads are well-defined, though every write happens
    /// under the guard.
    sw: [AtomicBool; SW_LOCKS],
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub const fn new() -> Self {
        // No Copy impls on the lock primitives, so spell the arrays out via
        // const blocks.
        LockTable {
            hw: [const { HwLock::new() }; HW_LOCKS],
            sw: [const { AtomicBool::new(false) }; SW_LOCKS],
        }
    }

    /// Takes lock `id`, disabling local interrupts first. The returned
    /// guard restores everything on drop.
    ///
    /// An out-of-range index, or the reserved guard lock, is a
    /// configuration defect and dies.
    pub fn take<'a>(&'a self, id: LockId, irq: &'a IrqControl) -> LockGuard<'a> {
        let i = id.index();
        if i >= NUM_LOCKS || i == SW_GUARD {
            fail::die("lock index out of range");
        }
        let prev = irq.disable();
        if i < HW_LOCKS {
            self.hw[i].take();
        } else {
            self.take_sw(i - HW_LOCKS, irq, prev);
        }
        LockGuard {
            table: self,
            id,
            irq,
            prev,
        }
    }

    /// Acquires software lock `s` under the guard lock. On contention the
    /// interrupt state is restored for the retry gap, then re-disabled, so
    /// a long-held software lock on another core cannot stretch this core's
    /// interrupt latency.
    fn take_sw(&self, s: usize, irq: &IrqControl, prev: bool) {
        loop {
            self.hw[SW_GUARD].take();
            let free = !self.sw[s].load(Ordering::Relaxed);
            if free {
                self.sw[s].store(true, Ordering::Relaxed);
            }
            self.hw[SW_GUARD].release();
            if free {
                return;
            }
            irq.restore(prev);
            spin_loop();
            irq.disable();
        }
    }

    fn release(&self, id: LockId) {
        let i = id.index();
        if i < HW_LOCKS {
            self.hw[i].release();
        } else {
            let s = i - HW_LOCKS;
            self.hw[SW_GUARD].take();
            self.sw[s].store(false, Ordering::Relaxed);
            self.hw[SW_GUARD].release();
        }
    }
}

/// An owned critical section. Dropping it releases the lock and restores
/// the interrupt state captured at `take`, in that order.
#[must_use]
pub struct LockGuard<'a> {
    table: &'a LockTable,
    id: LockId,
    irq: &'a IrqControl,
    prev: bool,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.id);
        self.irq.restore(self.prev);
    }
}

/// Per-core ceiling bookkeeping for the user-facing lock service.
///
/// `owner`/`saved_prio` are indexed by lock; `held_head` plus the
/// `prev_held` links form a per-task stack of occupied locks, enforcing
/// strictly nested (LIFO) release.
pub struct CeilingState {
    owner: [u16; NUM_LOCKS],
    saved_prio: [Priority; NUM_LOCKS],
    taken_at: [u64; NUM_LOCKS],
    prev_held: [u16; NUM_LOCKS],
    held_head: [u16; MAX_TASKS],
}

impl Default for CeilingState {
    fn default() -> Self {
        Self::new()
    }
}

impl CeilingState {
    pub fn new() -> Self {
        CeilingState {
            owner: [NONE_INDEX; NUM_LOCKS],
            saved_prio: [Priority(0); NUM_LOCKS],
            taken_at: [0; NUM_LOCKS],
            prev_held: [NONE_INDEX; NUM_LOCKS],
            held_head: [NONE_INDEX; MAX_TASKS],
        }
    }

    /// Occupies `lock` for `task`, raising it to the ceiling if that is
    /// more important than its current priority.
    pub fn acquire(
        &mut self,
        lock: LockId,
        desc: &LockDesc,
        task: u16,
        tasks: &mut [Task],
        rq: &mut ReadyQueue,
        now: u64,
    ) -> Result<(), ServiceError> {
        let l = lock.index();
        if self.owner[l] != NONE_INDEX {
            return Err(ServiceError::Resource);
        }
        let t = &mut tasks[usize::from(task)];
        if t.priority().is_more_important_than(desc.ceiling) {
            // The configuration promises the ceiling dominates every user;
            // a caller above the ceiling is using someone else's lock.
            return Err(ServiceError::Access);
        }

        self.owner[l] = task;
        self.saved_prio[l] = t.priority();
        self.taken_at[l] = now;
        self.prev_held[l] = self.held_head[usize::from(task)];
        self.held_head[usize::from(task)] = l as u16;

        if desc.ceiling.is_more_important_than(t.priority()) {
            rq.raise(task, t.priority().0, desc.ceiling.0);
            t.set_priority(desc.ceiling);
        }
        Ok(())
    }

    /// Releases `lock`, restoring the priority saved at acquire.
    ///
    /// The lock is released even when the hold-time budget was blown; the
    /// overrun is then reported as a protection fault rather than a return
    /// code the task could ignore.
    pub fn release(
        &mut self,
        lock: LockId,
        desc: &LockDesc,
        task: u16,
        tasks: &mut [Task],
        rq: &mut ReadyQueue,
        now: u64,
    ) -> Result<(), UserError> {
        let l = lock.index();
        if self.owner[l] != task {
            return Err(ServiceError::NotInUse.into());
        }
        if self.held_head[usize::from(task)] != l as u16 {
            // Locks release in LIFO order only.
            return Err(ServiceError::Resource.into());
        }

        self.held_head[usize::from(task)] = self.prev_held[l];
        self.prev_held[l] = NONE_INDEX;
        self.owner[l] = NONE_INDEX;

        let t = &mut tasks[usize::from(task)];
        let back = self.saved_prio[l];
        if t.priority() != back {
            rq.lower(task, t.priority().0, back.0);
            t.set_priority(back);
        }

        if desc.hold_budget != 0
            && now.saturating_sub(self.taken_at[l])
                >= u64::from(desc.hold_budget)
        {
            return Err(ProtectionFault::LockBudgetExceeded.into());
        }
        Ok(())
    }

    /// True if `task` still occupies any lock. Terminating or chaining with
    /// locks held is a caller error.
    pub fn holds_any(&self, task: u16) -> bool {
        self.held_head[usize::from(task)] != NONE_INDEX
    }

    /// Force-releases every lock `task` occupies, as part of killing it.
    /// Priorities are not restored through the ready queue here; the caller
    /// has already pulled the task out of scheduling.
    pub fn strip(&mut self, task: u16) {
        let mut l = self.held_head[usize::from(task)];
        while l != NONE_INDEX {
            let i = usize::from(l);
            self.owner[i] = NONE_INDEX;
            l = core::mem::replace(&mut self.prev_held[i], NONE_INDEX);
        }
        self.held_head[usize::from(task)] = NONE_INDEX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fail::die_test_guard;
    use crate::test_support::task_with_prio;
    use abi::AppId;

    fn lock_desc(ceiling: u8, budget: u32) -> LockDesc {
        LockDesc {
            ceiling: Priority(ceiling),
            hold_budget: budget,
            app: AppId(0),
        }
    }

    #[test]
    fn guard_restores_interrupt_state_across_nesting() {
        let table = LockTable::new();
        let irq = IrqControl::new();
        assert!(irq.enabled());
        {
            let _outer = table.take(LockId(1), &irq);
            assert!(!irq.enabled());
            {
                let _inner = table.take(LockId(2), &irq);
                assert!(!irq.enabled());
            }
            // Inner drop restores to the state at its take: still disabled.
            assert!(!irq.enabled());
        }
        assert!(irq.enabled());
    }

    #[test]
    fn software_tier_excludes_across_threads() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let table = Arc::new(LockTable::new());
        let in_section = Arc::new(AtomicU32::new(0));
        let sw = LockId(HW_LOCKS as u16 + 1);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let in_section = Arc::clone(&in_section);
                std::thread::spawn(move || {
                    let irq = IrqControl::new();
                    for _ in 0..500 {
                        let _g = table.take(sw, &irq);
                        assert_eq!(
                            in_section.fetch_add(1, Ordering::SeqCst),
                            0
                        );
                        in_section.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "kernel died")]
    fn reserved_guard_lock_is_unreachable() {
        let _guard = die_test_guard();
        let table = LockTable::new();
        let irq = IrqControl::new();
        let _g = table.take(LockId(0), &irq);
    }

    #[test]
    fn ceiling_raises_and_release_restores() {
        let mut rq = ReadyQueue::new();
        let mut tasks = vec![
            Task::from_descriptor(task_with_prio(5)),
            Task::from_descriptor(task_with_prio(7)),
        ];
        let _ = tasks[0].activate().unwrap();
        let _ = tasks[1].activate().unwrap();
        rq.enqueue(0, 5);
        rq.enqueue(1, 7);
        let mut cs = CeilingState::new();
        let desc = lock_desc(10, 0);

        cs.acquire(LockId(1), &desc, 0, &mut tasks, &mut rq, 0).unwrap();
        assert_eq!(tasks[0].priority(), Priority(10));
        assert_eq!(rq.find_highest(), Some(0));

        cs.release(LockId(1), &desc, 0, &mut tasks, &mut rq, 1).unwrap();
        assert_eq!(tasks[0].priority(), Priority(5));
        // With the ceiling gone, the priority-7 task wins.
        assert_eq!(rq.find_highest(), Some(1));
    }

    #[test]
    fn occupied_lock_rejected() {
        let mut rq = ReadyQueue::new();
        let mut tasks = vec![
            Task::from_descriptor(task_with_prio(5)),
            Task::from_descriptor(task_with_prio(5)),
        ];
        let _ = tasks[0].activate().unwrap();
        let _ = tasks[1].activate().unwrap();
        rq.enqueue(0, 5);
        rq.enqueue(1, 5);
        let mut cs = CeilingState::new();
        let desc = lock_desc(10, 0);
        cs.acquire(LockId(1), &desc, 0, &mut tasks, &mut rq, 0).unwrap();
        assert_eq!(
            cs.acquire(LockId(1), &desc, 1, &mut tasks, &mut rq, 0),
            Err(ServiceError::Resource)
        );
    }

    #[test]
    fn out_of_order_release_rejected() {
        let mut rq = ReadyQueue::new();
        let mut tasks = vec![Task::from_descriptor(task_with_prio(5))];
        let _ = tasks[0].activate().unwrap();
        rq.enqueue(0, 5);
        let mut cs = CeilingState::new();
        let a = lock_desc(8, 0);
        let b = lock_desc(10, 0);
        cs.acquire(LockId(1), &a, 0, &mut tasks, &mut rq, 0).unwrap();
        cs.acquire(LockId(2), &b, 0, &mut tasks, &mut rq, 0).unwrap();
        assert!(matches!(
            cs.release(LockId(1), &a, 0, &mut tasks, &mut rq, 0),
            Err(UserError::Recoverable(ServiceError::Resource, _))
        ));
        // The proper order works, unwinding the ceiling in steps.
        cs.release(LockId(2), &b, 0, &mut tasks, &mut rq, 0).unwrap();
        assert_eq!(tasks[0].priority(), Priority(8));
        cs.release(LockId(1), &a, 0, &mut tasks, &mut rq, 0).unwrap();
        assert_eq!(tasks[0].priority(), Priority(5));
    }

    #[test]
    fn hold_budget_overrun_is_a_protection_fault() {
        let mut rq = ReadyQueue::new();
        let mut tasks = vec![Task::from_descriptor(task_with_prio(5))];
        let _ = tasks[0].activate().unwrap();
        rq.enqueue(0, 5);
        let mut cs = CeilingState::new();
        let desc = lock_desc(10, 100);
        cs.acquire(LockId(1), &desc, 0, &mut tasks, &mut rq, 0).unwrap();
        let r = cs.release(LockId(1), &desc, 0, &mut tasks, &mut rq, 150);
        assert!(matches!(
            r,
            Err(UserError::Protection(
                ProtectionFault::LockBudgetExceeded
            ))
        ));
        // The lock itself was still released.
        assert!(!cs.holds_any(0));
        assert_eq!(tasks[0].priority(), Priority(5));
    }
}
