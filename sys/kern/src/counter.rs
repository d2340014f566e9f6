// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counters and alarms.
//!
//! All alarms bound to one counter form a singly linked *delta queue*: each
//! entry stores the ticks between its expiry and the previous entry's, so
//! the head's delta is the time to the next expiry and advancing the
//! counter only ever touches the front of the queue. The queue is realized
//! as index links inside a fixed arena rather than pointers.
//!
//! Advancing is split into `advance_begin` plus repeated [`TimeBase::
//! advance_next`] calls: each call pops at most one expired alarm, so the
//! caller can run the alarm's action (activate a task, drive a schedule
//! table) between steps while the queue stays consistent. While a batch is
//! mid-walk the counter carries a *timing error* term, the distance between
//! the fully advanced counter value and the queue's origin; remaining-tick
//! queries subtract it so an action observing its own counter sees
//! coherent numbers.
//!
//! Hardware-backed counters resynchronize lazily: [`TimeBase::hw_elapsed`]
//! folds the free-running timer's progress into an increment the caller
//! replays through the ordinary advance path, and [`TimeBase::reprogram`]
//! arms the next compare interrupt, clamped to the timer's programmable
//! range.

use abi::{AlarmId, CounterId, ServiceError, NONE_INDEX};

use crate::descs::{CounterDesc, KernelConfig, MAX_ALARMS, MAX_COUNTERS};
use crate::fail;
use crate::time::{tick_add, tick_sub, timer_sub, Ticks};

/// A free-running hardware timer backing a counter.
///
/// Implementations wrap the memory-mapped compare/counter registers of one
/// timer channel; the kernel only sees this trait.
pub trait HwTimer: Sync {
    /// Raw current timer value, in `0..=mask()`.
    fn current(&self) -> Ticks;
    /// The timer counts `0..=mask()` then wraps.
    fn mask(&self) -> Ticks;
    /// Largest delta that can be armed without the compare value landing
    /// "behind" the running timer.
    fn max_delta(&self) -> Ticks;
    /// Delta armed when no expiry is queued, bounding how much elapsed time
    /// a lazy resynchronization ever has to absorb.
    fn def_delta(&self) -> Ticks;
    /// Arms the compare interrupt `delta` ticks from now.
    fn arm(&self, delta: Ticks);
}

#[derive(Copy, Clone, Debug)]
struct AlarmDyn {
    /// Ticks from the previous queue entry (or the queue origin, for the
    /// head) to this alarm's expiry.
    delta: Ticks,
    /// Re-queue interval; 0 for one-shot.
    period: Ticks,
    /// Next alarm in the delta queue; meaningless when idle.
    next: u16,
    in_use: bool,
}

impl AlarmDyn {
    const IDLE: Self = AlarmDyn {
        delta: 0,
        period: 0,
        next: NONE_INDEX,
        in_use: false,
    };
}

#[derive(Copy, Clone, Debug)]
struct CounterDyn {
    current: Ticks,
    /// Distance from the queue origin to `current` while an advance batch
    /// is mid-walk; 0 otherwise.
    error: Ticks,
    /// Ticks of the current batch not yet consumed by the walk.
    adv_left: Ticks,
    /// Head of the delta queue.
    head: u16,
    /// Raw hardware timer value at the last resynchronization.
    last_hw: Ticks,
}

impl CounterDyn {
    const ZERO: Self = CounterDyn {
        current: 0,
        error: 0,
        adv_left: 0,
        head: NONE_INDEX,
        last_hw: 0,
    };
}

/// Dynamic state of every counter and alarm on one core.
pub struct TimeBase {
    counters: [CounterDyn; MAX_COUNTERS],
    alarms: [AlarmDyn; MAX_ALARMS],
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeBase {
    pub fn new() -> Self {
        TimeBase {
            counters: [CounterDyn::ZERO; MAX_COUNTERS],
            alarms: [AlarmDyn::IDLE; MAX_ALARMS],
        }
    }

    /// Current value of `counter`. Hardware counters must be resynchronized
    /// by the caller first.
    pub fn value(&self, counter: CounterId) -> Ticks {
        self.counters[counter.index()].current
    }

    /// Arms `alarm` to expire `increment` ticks from now, repeating every
    /// `cycle` ticks (0 for one-shot).
    pub fn set_rel(
        &mut self,
        cfg: &KernelConfig,
        alarm: AlarmId,
        increment: Ticks,
        cycle: Ticks,
    ) -> Result<(), ServiceError> {
        let c = cfg.alarms[alarm.index()].counter;
        let cd = &cfg.counters[c.index()];
        if increment == 0 || increment > cd.max_allowed_value {
            return Err(ServiceError::ValueOutOfRange);
        }
        self.check_cycle(cd, cycle)?;
        if self.alarms[alarm.index()].in_use {
            return Err(ServiceError::WrongState);
        }
        self.enqueue(c, alarm, increment, cycle);
        Ok(())
    }

    /// Arms `alarm` to expire when its counter next reaches the absolute
    /// value `start`. If the counter is at `start` already, that is a full
    /// revolution away.
    pub fn set_abs(
        &mut self,
        cfg: &KernelConfig,
        alarm: AlarmId,
        start: Ticks,
        cycle: Ticks,
    ) -> Result<(), ServiceError> {
        let c = cfg.alarms[alarm.index()].counter;
        let cd = &cfg.counters[c.index()];
        if start > cd.max_allowed_value {
            return Err(ServiceError::ValueOutOfRange);
        }
        self.check_cycle(cd, cycle)?;
        if self.alarms[alarm.index()].in_use {
            return Err(ServiceError::WrongState);
        }
        // Relative to the queue origin, not `current`: an alarm set from
        // inside an expiry action measures from the logical now.
        let origin = tick_sub(
            self.counters[c.index()].current,
            self.counters[c.index()].error,
            cd.max_allowed_value,
        );
        let mut delta = tick_sub(start, origin, cd.max_allowed_value);
        if delta == 0 {
            // Wrap limit below Ticks::MAX is checked at boot, so a full
            // revolution is representable.
            delta = cd.max_allowed_value + 1;
        }
        self.enqueue(c, alarm, delta, cycle);
        Ok(())
    }

    fn check_cycle(
        &self,
        cd: &CounterDesc,
        cycle: Ticks,
    ) -> Result<(), ServiceError> {
        if cycle != 0 && (cycle < cd.min_cycle || cycle > cd.max_allowed_value)
        {
            return Err(ServiceError::ValueOutOfRange);
        }
        Ok(())
    }

    /// Disarms `alarm`. An idle alarm reports `NotInUse`; an alarm marked
    /// in use but absent from its counter's queue is corrupted kernel state
    /// and dies.
    pub fn cancel(
        &mut self,
        cfg: &KernelConfig,
        alarm: AlarmId,
    ) -> Result<(), ServiceError> {
        let a = alarm.index();
        if !self.alarms[a].in_use {
            return Err(ServiceError::NotInUse);
        }
        let c = cfg.alarms[a].counter.index();

        let mut cur = self.counters[c].head;
        let mut prev = NONE_INDEX;
        while cur != NONE_INDEX && cur != alarm.0 {
            prev = cur;
            cur = self.alarms[usize::from(cur)].next;
        }
        if cur == NONE_INDEX {
            fail::die("alarm in use but not queued");
        }

        let after = self.alarms[a].next;
        if after != NONE_INDEX {
            // The successor absorbs the removed entry's delta.
            self.alarms[usize::from(after)].delta = self.alarms
                [usize::from(after)]
            .delta
            .wrapping_add(self.alarms[a].delta);
        }
        if prev == NONE_INDEX {
            self.counters[c].head = after;
        } else {
            self.alarms[usize::from(prev)].next = after;
        }
        self.alarms[a] = AlarmDyn::IDLE;
        Ok(())
    }

    /// Ticks until `alarm` expires. Sums deltas from the queue origin up to
    /// the alarm, then subtracts the counter's pending timing error,
    /// clamping at zero.
    pub fn remaining(
        &self,
        cfg: &KernelConfig,
        alarm: AlarmId,
    ) -> Result<Ticks, ServiceError> {
        let a = alarm.index();
        if !self.alarms[a].in_use {
            return Err(ServiceError::NotInUse);
        }
        let c = cfg.alarms[a].counter.index();

        let mut sum: Ticks = 0;
        let mut cur = self.counters[c].head;
        while cur != NONE_INDEX {
            sum = sum.wrapping_add(self.alarms[usize::from(cur)].delta);
            if cur == alarm.0 {
                return Ok(sum.saturating_sub(self.counters[c].error));
            }
            cur = self.alarms[usize::from(cur)].next;
        }
        fail::die("alarm in use but not queued");
    }

    /// Opens an advance batch of `ticks` on `counter`. The caller must then
    /// drain it with [`Self::advance_next`] until that returns `None`.
    pub fn advance_begin(
        &mut self,
        cfg: &KernelConfig,
        counter: CounterId,
        ticks: Ticks,
    ) {
        let c = counter.index();
        let max = cfg.counters[c].max_allowed_value;
        self.counters[c].current =
            tick_add(self.counters[c].current, ticks, max);
        self.counters[c].adv_left = ticks;
        self.counters[c].error = ticks;
    }

    /// Pops the next alarm expiring within the open batch, re-queuing it if
    /// periodic. Returns `None` once no further alarm expires in the batch,
    /// at which point the queue origin has caught up with the counter and
    /// the timing error is zero again.
    pub fn advance_next(&mut self, counter: CounterId) -> Option<AlarmId> {
        let c = counter.index();
        let head = self.counters[c].head;
        if head != NONE_INDEX
            && self.alarms[usize::from(head)].delta
                <= self.counters[c].adv_left
        {
            let a = usize::from(head);
            self.counters[c].head = self.alarms[a].next;
            // Queue origin moves to this expiry point.
            self.counters[c].adv_left -= self.alarms[a].delta;
            self.counters[c].error = self.counters[c].adv_left;

            let period = self.alarms[a].period;
            if period != 0 {
                self.alarms[a].in_use = false;
                self.requeue(c, head, period, period);
            } else {
                self.alarms[a] = AlarmDyn::IDLE;
            }
            Some(AlarmId(head))
        } else {
            if head != NONE_INDEX {
                self.alarms[usize::from(head)].delta -=
                    self.counters[c].adv_left;
            }
            self.counters[c].adv_left = 0;
            self.counters[c].error = 0;
            None
        }
    }

    /// Ticks elapsed on `counter`'s hardware timer since the last call,
    /// ready to be replayed through `advance_begin`/`advance_next`.
    pub fn hw_elapsed(
        &mut self,
        cfg: &KernelConfig,
        counter: CounterId,
    ) -> Ticks {
        let c = counter.index();
        let hw = match cfg.counters[c].hw {
            Some(hw) => hw,
            None => return 0,
        };
        let raw = hw.current();
        let elapsed = timer_sub(raw, self.counters[c].last_hw, hw.mask());
        self.counters[c].last_hw = raw;
        elapsed
    }

    /// Re-arms `counter`'s compare interrupt for the next queued expiry,
    /// clamped to the timer's programmable range, or for the default delta
    /// when nothing is queued (keeping the resynchronization window
    /// bounded). No-op for software counters.
    pub fn reprogram(&self, cfg: &KernelConfig, counter: CounterId) {
        let c = counter.index();
        let hw = match cfg.counters[c].hw {
            Some(hw) => hw,
            None => return,
        };
        let delta = match self.counters[c].head {
            NONE_INDEX => hw.def_delta(),
            h => self.alarms[usize::from(h)]
                .delta
                .max(1)
                .min(hw.max_delta()),
        };
        hw.arm(delta);
    }

    /// True if `alarm` is queued on its counter.
    pub fn alarm_in_use(&self, alarm: AlarmId) -> bool {
        self.alarms[alarm.index()].in_use
    }

    /// Arms a kernel-owned alarm (a schedule table's) one-shot, `delta`
    /// ticks past the queue origin, bypassing user-parameter validation.
    /// The alarm being already queued means table state and alarm state
    /// disagree.
    pub(crate) fn arm_internal(
        &mut self,
        cfg: &KernelConfig,
        alarm: AlarmId,
        delta: Ticks,
    ) {
        if self.alarms[alarm.index()].in_use {
            fail::die("table alarm already queued");
        }
        let c = cfg.alarms[alarm.index()].counter;
        self.enqueue(c, alarm, delta, 0);
    }

    /// Cancels a kernel-owned alarm if it is queued; unlike [`Self::cancel`]
    /// an idle alarm is fine (a table stopping from inside its own expiry
    /// action finds the alarm already popped).
    pub(crate) fn disarm_internal(
        &mut self,
        cfg: &KernelConfig,
        alarm: AlarmId,
    ) {
        if self.alarms[alarm.index()].in_use {
            // Queued state was just checked; only corruption can fail here.
            if self.cancel(cfg, alarm).is_err() {
                fail::die("table alarm vanished");
            }
        }
    }

    /// Inserts `alarm` into `counter`'s queue, `delta` ticks past the queue
    /// origin. Ties go behind existing entries, so simultaneous expiries
    /// fire in arming order.
    fn enqueue(
        &mut self,
        counter: CounterId,
        alarm: AlarmId,
        delta: Ticks,
        period: Ticks,
    ) {
        self.requeue(counter.index(), alarm.0, delta, period);
    }

    fn requeue(&mut self, c: usize, alarm: u16, mut delta: Ticks, period: Ticks) {
        let a = usize::from(alarm);
        let mut prev = NONE_INDEX;
        let mut cur = self.counters[c].head;
        while cur != NONE_INDEX && self.alarms[usize::from(cur)].delta <= delta
        {
            delta -= self.alarms[usize::from(cur)].delta;
            prev = cur;
            cur = self.alarms[usize::from(cur)].next;
        }
        self.alarms[a] = AlarmDyn {
            delta,
            period,
            next: cur,
            in_use: true,
        };
        if cur != NONE_INDEX {
            self.alarms[usize::from(cur)].delta -= delta;
        }
        if prev == NONE_INDEX {
            self.counters[c].head = alarm;
        } else {
            self.alarms[usize::from(prev)].next = alarm;
        }
    }
}
