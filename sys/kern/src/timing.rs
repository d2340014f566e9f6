// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution-time accounting.
//!
//! Each task carries an [`Accounting`] record that meters how long its
//! current activation has run, against an optional per-activation budget.
//! Time is read from the image-wide [`ExecTimer`], a free-running monotonic
//! counter independent of the software counters in [`crate::counter`].
//!
//! The dispatcher calls [`Accounting::resume`] when it switches a task in
//! and [`Accounting::suspend`] when it switches it out; service entry points
//! call [`Accounting::check`] so a runaway task is caught at the next
//! kernel crossing rather than only at preemption.

use abi::ProtectionFault;

/// A free-running monotonic time source for budgets and load measurement.
///
/// The value must never go backwards and must not wrap within the life of
/// the system (64 bits at any realistic tick rate).
pub trait ExecTimer: Sync {
    fn now(&self) -> u64;
}

/// Per-task execution meter.
#[derive(Debug)]
pub struct Accounting {
    /// Budget per activation, in execution-timer ticks. 0 disables
    /// enforcement.
    budget: u32,
    /// Ticks consumed by the current activation, folded in at each suspend.
    used: u32,
    /// Longest completed activation observed, for the diagnostic API.
    max_observed: u32,
    /// Timer reading at the last resume; `None` while switched out.
    started_at: Option<u64>,
}

impl Accounting {
    pub fn new(budget: u32) -> Self {
        Accounting {
            budget,
            used: 0,
            max_observed: 0,
            started_at: None,
        }
    }

    /// Resets the meter for a fresh activation.
    pub fn begin_frame(&mut self) {
        self.used = 0;
        self.started_at = None;
    }

    /// Notes that the task starts (or continues) running at `now`.
    pub fn resume(&mut self, now: u64) {
        self.started_at = Some(now);
    }

    /// Folds the running interval ending at `now` into `used`. No-op if the
    /// task was not marked running.
    pub fn suspend(&mut self, now: u64) {
        if let Some(t0) = self.started_at.take() {
            let elapsed = now.saturating_sub(t0);
            self.used = self
                .used
                .saturating_add(u32::try_from(elapsed).unwrap_or(u32::MAX));
        }
    }

    /// Checks the budget at time `now` without switching the task out.
    pub fn check(&mut self, now: u64) -> Result<(), ProtectionFault> {
        if self.started_at.is_some() {
            self.suspend(now);
            // Re-anchor so the folded interval is not counted twice.
            self.started_at = Some(now);
        }
        if self.budget != 0 && self.used >= self.budget {
            Err(ProtectionFault::ExecBudgetExceeded)
        } else {
            Ok(())
        }
    }

    /// Closes out the activation, updating the high-water mark. The
    /// dispatcher suspends the task before terminating it, so any leftover
    /// running anchor is discarded as zero-length.
    pub fn end_frame(&mut self) {
        self.started_at = None;
        self.max_observed = self.max_observed.max(self.used);
    }

    /// Ticks consumed by the current activation so far (up to the last
    /// suspend or check).
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Longest completed activation seen since boot.
    pub fn max_observed(&self) -> u32 {
        self.max_observed
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Remaining budget, or `None` if unbudgeted.
    pub fn headroom(&self) -> Option<u32> {
        if self.budget == 0 {
            None
        } else {
            Some(self.budget.saturating_sub(self.used))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_across_preemptions() {
        let mut a = Accounting::new(0);
        a.begin_frame();
        a.resume(100);
        a.suspend(130);
        a.resume(500);
        a.suspend(520);
        assert_eq!(a.used(), 50);
        assert_eq!(a.headroom(), None);
    }

    #[test]
    fn budget_trips_at_checkpoint_without_losing_time() {
        let mut a = Accounting::new(40);
        a.begin_frame();
        a.resume(0);
        assert_eq!(a.check(30), Ok(()));
        assert_eq!(a.used(), 30);
        // Still running; the next check sees the additional 15 ticks once.
        assert_eq!(a.check(45), Err(ProtectionFault::ExecBudgetExceeded));
        assert_eq!(a.used(), 45);
    }

    #[test]
    fn fresh_frame_resets_usage_but_keeps_high_water() {
        let mut a = Accounting::new(0);
        a.begin_frame();
        a.resume(0);
        a.suspend(70);
        a.end_frame();
        a.begin_frame();
        a.resume(100);
        a.suspend(110);
        a.end_frame();
        assert_eq!(a.used(), 10);
        assert_eq!(a.max_observed(), 70);
    }

    #[test]
    fn unbudgeted_never_faults() {
        let mut a = Accounting::new(0);
        a.begin_frame();
        a.resume(0);
        assert_eq!(a.check(u64::from(u32::MAX) * 4), Ok(()));
    }
}
