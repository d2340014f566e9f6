// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Schedule tables.
//!
//! A schedule table is a fixed sequence of expiry points layered on a
//! single kernel-owned alarm: each time the alarm fires, the table hands
//! out the current point's action (activate a task or set its events) and
//! re-arms the alarm for the delay to the next point. Repetition, chaining
//! to a successor table, and explicit synchronization against a global
//! time all reduce to how that next delay is computed.
//!
//! Synchronization never moves a point directly. It records a direction
//! (lengthen or shorten rounds) and a remaining adjustment budget; each
//! subsequent inter-point delay is then stretched or squeezed within the
//! point's configured `max_increase`/`max_decrease` bound until the budget
//! is spent. Shortening floors the delay at zero rather than going
//! negative.

use abi::{
    EventMask, ScheduleTableId, ScheduleTableState, ServiceError, TaskId,
};

use crate::counter::TimeBase;
use crate::descs::{ExpiryPoint, KernelConfig, TableFlags, MAX_TABLES};
use crate::time::{tick_sub, Ticks};

/// Which way synchronization is currently steering the table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
enum SyncDir {
    #[default]
    None,
    /// Table runs ahead of global time; rounds are being lengthened.
    Lengthen,
    /// Table lags global time; rounds are being shortened.
    Shorten,
}

#[derive(Copy, Clone, Debug, Default)]
struct TableDyn {
    state: ScheduleTableState,
    /// Index into the descriptor's point list of the next point to fire.
    next_point: u16,
    /// Offset of the most recently fired point, i.e. the table's logical
    /// position within its round.
    pos: Ticks,
    dir: SyncDir,
    /// Adjustment still owed in direction `dir`.
    adj_remaining: Ticks,
    /// The table has been synchronized at least once and the residual
    /// deviation is within its precision bound.
    synchronous: bool,
    /// Honor sync adjustments; cleared by the make-async service.
    sync_enabled: bool,
    /// Successor to start when this table's final round completes.
    chain: Option<ScheduleTableId>,
}

/// What an expiry point asks the task layer to do. An empty event mask
/// means activate the task; otherwise set the events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PointAction {
    pub task: TaskId,
    pub event: EventMask,
}

/// Dynamic state of every schedule table on one core.
pub struct TableSet {
    tables: [TableDyn; MAX_TABLES],
}

impl Default for TableSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TableSet {
    pub fn new() -> Self {
        TableSet {
            tables: [TableDyn::default(); MAX_TABLES],
        }
    }

    /// Starts `table` `offset` counter ticks from now.
    pub fn start_rel(
        &mut self,
        cfg: &KernelConfig,
        tb: &mut TimeBase,
        table: ScheduleTableId,
        offset: Ticks,
    ) -> Result<(), ServiceError> {
        let desc = &cfg.tables[table.index()];
        if offset == 0 {
            return Err(ServiceError::ValueOutOfRange);
        }
        self.check_startable(table)?;
        let first = offset
            .checked_add(desc.points[0].offset)
            .ok_or(ServiceError::ValueOutOfRange)?;
        self.begin(table, false);
        tb.arm_internal(cfg, desc.alarm, first);
        Ok(())
    }

    /// Starts `table` when its counter next reaches the absolute value
    /// `start`.
    pub fn start_abs(
        &mut self,
        cfg: &KernelConfig,
        tb: &mut TimeBase,
        table: ScheduleTableId,
        start: Ticks,
    ) -> Result<(), ServiceError> {
        let desc = &cfg.tables[table.index()];
        let counter = cfg.alarms[desc.alarm.index()].counter;
        let max = cfg.counters[counter.index()].max_allowed_value;
        if start > max {
            return Err(ServiceError::ValueOutOfRange);
        }
        self.check_startable(table)?;
        let mut to_start = tick_sub(start, tb.value(counter), max);
        if to_start == 0 {
            to_start = max + 1;
        }
        // Implicitly synchronous tables are aligned by construction when
        // started absolutely.
        let synced = desc.flags.contains(TableFlags::IMPLICIT);
        self.begin(table, synced);
        tb.arm_internal(
            cfg,
            desc.alarm,
            to_start.saturating_add(desc.points[0].offset),
        );
        Ok(())
    }

    /// Puts `table` into the waiting state until the first global-time
    /// synchronization arrives and positions it.
    pub fn start_synchron(
        &mut self,
        cfg: &KernelConfig,
        table: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        if !cfg.tables[table.index()]
            .flags
            .contains(TableFlags::SYNCABLE)
        {
            return Err(ServiceError::Access);
        }
        self.check_startable(table)?;
        self.tables[table.index()].state = ScheduleTableState::Waiting;
        Ok(())
    }

    /// Feeds a global time (position within the table's period) to
    /// `table`.
    ///
    /// A waiting table starts so its round aligns with the global time. A
    /// running table records the deviation and begins steering: if the
    /// table is ahead it lengthens upcoming delays, if behind it shortens
    /// them, always within the per-point bounds.
    pub fn sync(
        &mut self,
        cfg: &KernelConfig,
        tb: &mut TimeBase,
        table: ScheduleTableId,
        global: Ticks,
    ) -> Result<(), ServiceError> {
        let desc = &cfg.tables[table.index()];
        if !desc.flags.contains(TableFlags::SYNCABLE) {
            return Err(ServiceError::Access);
        }
        if global >= desc.period {
            return Err(ServiceError::ValueOutOfRange);
        }
        let t = &mut self.tables[table.index()];
        match t.state {
            ScheduleTableState::Waiting => {
                // Start so that the first point fires when global time
                // reaches its offset.
                let mut first = tick_sub(
                    desc.points[0].offset,
                    global,
                    desc.period - 1,
                );
                if first == 0 {
                    first = desc.period;
                }
                self.begin(table, true);
                tb.arm_internal(cfg, desc.alarm, first);
                Ok(())
            }
            ScheduleTableState::Running => {
                if !t.sync_enabled {
                    return Ok(());
                }
                // Positive diff: the table's position leads global time.
                let diff = tick_sub(t.pos, global, desc.period - 1);
                let lag = tick_sub(global, t.pos, desc.period - 1);
                if diff <= desc.precision || lag <= desc.precision {
                    t.dir = SyncDir::None;
                    t.adj_remaining = 0;
                    t.synchronous = true;
                } else if diff <= desc.period / 2 {
                    t.dir = SyncDir::Lengthen;
                    t.adj_remaining = diff;
                    t.synchronous = false;
                } else {
                    t.dir = SyncDir::Shorten;
                    t.adj_remaining = lag;
                    t.synchronous = false;
                }
                Ok(())
            }
            _ => Err(ServiceError::WrongState),
        }
    }

    /// Stops honoring synchronization: the table keeps running on its raw
    /// deltas and drops any adjustment in progress.
    pub fn set_async(
        &mut self,
        cfg: &KernelConfig,
        table: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        if !cfg.tables[table.index()]
            .flags
            .contains(TableFlags::SYNCABLE)
        {
            return Err(ServiceError::Access);
        }
        let t = &mut self.tables[table.index()];
        if t.state != ScheduleTableState::Running {
            return Err(ServiceError::WrongState);
        }
        t.sync_enabled = false;
        t.dir = SyncDir::None;
        t.adj_remaining = 0;
        t.synchronous = false;
        Ok(())
    }

    /// Queues `next` to start when `table`'s current round sequence ends.
    pub fn chain(
        &mut self,
        table: ScheduleTableId,
        next: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        if table == next {
            return Err(ServiceError::InvalidId);
        }
        if self.tables[table.index()].state != ScheduleTableState::Running {
            return Err(ServiceError::WrongState);
        }
        if self.tables[next.index()].state != ScheduleTableState::Stopped {
            return Err(ServiceError::WrongState);
        }
        if let Some(old) = self.tables[table.index()].chain.take() {
            self.tables[old.index()].state = ScheduleTableState::Stopped;
        }
        self.tables[next.index()].state = ScheduleTableState::Waiting;
        self.tables[table.index()].chain = Some(next);
        Ok(())
    }

    /// Stops `table`, disarming its alarm and recursively downgrading any
    /// chained successors to stopped.
    pub fn stop(
        &mut self,
        cfg: &KernelConfig,
        tb: &mut TimeBase,
        table: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        match self.tables[table.index()].state {
            ScheduleTableState::Stopped => Err(ServiceError::NotInUse),
            _ => {
                self.halt(cfg, tb, table, ScheduleTableState::Stopped);
                Ok(())
            }
        }
    }

    /// Kills `table` after a protection fault: the table itself is
    /// quarantined, but successors in its chain are merely stopped.
    pub fn kill(
        &mut self,
        cfg: &KernelConfig,
        tb: &mut TimeBase,
        table: ScheduleTableId,
    ) {
        if self.tables[table.index()].state != ScheduleTableState::Stopped {
            self.halt(cfg, tb, table, ScheduleTableState::Quarantined);
        }
    }

    fn halt(
        &mut self,
        cfg: &KernelConfig,
        tb: &mut TimeBase,
        table: ScheduleTableId,
        end_state: ScheduleTableState,
    ) {
        tb.disarm_internal(cfg, cfg.tables[table.index()].alarm);
        let chain = {
            let t = &mut self.tables[table.index()];
            t.state = end_state;
            t.dir = SyncDir::None;
            t.adj_remaining = 0;
            t.synchronous = false;
            t.chain.take()
        };
        let mut next = chain;
        while let Some(succ) = next {
            let t = &mut self.tables[succ.index()];
            t.state = ScheduleTableState::Stopped;
            next = t.chain.take();
        }
    }

    /// Current state, plus whether the table currently counts as
    /// synchronous.
    pub fn status(
        &self,
        table: ScheduleTableId,
    ) -> (ScheduleTableState, bool) {
        let t = &self.tables[table.index()];
        (t.state, t.synchronous)
    }

    /// Handles the expiry of `table`'s alarm: returns the current point's
    /// action and re-arms for the next one (or starts the chained
    /// successor, or stops).
    pub fn expire(
        &mut self,
        cfg: &KernelConfig,
        tb: &mut TimeBase,
        table: ScheduleTableId,
    ) -> PointAction {
        let desc = &cfg.tables[table.index()];
        let p = usize::from(self.tables[table.index()].next_point);
        let point = desc.points[p];
        self.tables[table.index()].pos = point.offset;

        if p + 1 < desc.points.len() {
            let raw = desc.points[p + 1].offset - point.offset;
            let delta =
                self.adjust(table, raw, &desc.points[p + 1]);
            self.tables[table.index()].next_point = (p + 1) as u16;
            tb.arm_internal(cfg, desc.alarm, delta);
        } else {
            // Final point of the round.
            let chained = self.tables[table.index()].chain;
            let tail = desc.period - point.offset;
            if let Some(succ) = chained {
                let t = &mut self.tables[table.index()];
                t.state = ScheduleTableState::Stopped;
                t.chain = None;
                t.next_point = 0;
                let sd = &cfg.tables[succ.index()];
                let st = &mut self.tables[succ.index()];
                st.state = ScheduleTableState::Running;
                st.next_point = 0;
                st.pos = 0;
                tb.arm_internal(
                    cfg,
                    sd.alarm,
                    tail.saturating_add(sd.points[0].offset),
                );
            } else if desc.flags.contains(TableFlags::REPEATING) {
                let raw = tail + desc.points[0].offset;
                let delta = self.adjust(table, raw, &desc.points[0]);
                self.tables[table.index()].next_point = 0;
                tb.arm_internal(cfg, desc.alarm, delta);
            } else {
                let t = &mut self.tables[table.index()];
                t.state = ScheduleTableState::Stopped;
                t.next_point = 0;
                t.dir = SyncDir::None;
                t.adj_remaining = 0;
                t.synchronous = false;
            }
        }

        PointAction {
            task: point.task,
            event: point.event,
        }
    }

    /// Applies the bounded synchronization adjustment to one inter-point
    /// delay. The applied step never exceeds the point's bound nor the
    /// remaining budget, and shortening floors the delay at zero while
    /// still charging the full bounded step against the budget.
    fn adjust(
        &mut self,
        table: ScheduleTableId,
        delta: Ticks,
        next: &ExpiryPoint,
    ) -> Ticks {
        let t = &mut self.tables[table.index()];
        match t.dir {
            SyncDir::None => delta,
            SyncDir::Lengthen => {
                let step = t.adj_remaining.min(next.max_increase);
                t.adj_remaining -= step;
                if t.adj_remaining == 0 {
                    t.dir = SyncDir::None;
                    t.synchronous = true;
                }
                delta + step
            }
            SyncDir::Shorten => {
                let step = t.adj_remaining.min(next.max_decrease);
                t.adj_remaining -= step;
                if t.adj_remaining == 0 {
                    t.dir = SyncDir::None;
                    t.synchronous = true;
                }
                delta.saturating_sub(step)
            }
        }
    }

    fn check_startable(
        &self,
        table: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        match self.tables[table.index()].state {
            ScheduleTableState::Stopped => Ok(()),
            ScheduleTableState::Quarantined => Err(ServiceError::Access),
            _ => Err(ServiceError::WrongState),
        }
    }

    fn begin(&mut self, table: ScheduleTableId, synced: bool) {
        let t = &mut self.tables[table.index()];
        t.state = ScheduleTableState::Running;
        t.next_point = 0;
        t.pos = 0;
        t.dir = SyncDir::None;
        t.adj_remaining = 0;
        t.synchronous = synced;
        t.sync_enabled = true;
        t.chain = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::table_fixture;
    use abi::{AlarmId, CounterId};

    /// Drives the counter forward, expiring table alarms as they fire, and
    /// returns `(tick-of-expiry, action)` pairs.
    fn run(
        ts: &mut TableSet,
        tb: &mut TimeBase,
        cfg: &KernelConfig,
        ticks: Ticks,
    ) -> Vec<(Ticks, PointAction)> {
        let c = CounterId(0);
        let mut out = Vec::new();
        for _ in 0..ticks {
            tb.advance_begin(cfg, c, 1);
            while let Some(alarm) = tb.advance_next(c) {
                let table = match cfg.alarms[alarm.index()].action {
                    crate::descs::AlarmAction::RunScheduleTable(t) => t,
                    _ => unreachable!(),
                };
                out.push((tb.value(c), ts.expire(cfg, tb, table)));
            }
        }
        out
    }

    fn act(task: u16) -> PointAction {
        PointAction {
            task: TaskId(task),
            event: EventMask::EMPTY,
        }
    }

    #[test]
    fn repeating_table_walks_points_and_wraps() {
        // Two points at offsets 10 and 30, period 100, tasks 0 and 1.
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let t = ScheduleTableId(0);

        ts.start_rel(cfg, &mut tb, t, 5).unwrap();
        let fired = run(&mut ts, &mut tb, cfg, 150);
        // Start at 5: points at 15, 35, then next round 115, 135.
        assert_eq!(
            fired,
            vec![
                (15, act(0)),
                (35, act(1)),
                (115, act(0)),
                (135, act(1)),
            ]
        );
        assert_eq!(ts.status(t), (ScheduleTableState::Running, false));
    }

    #[test]
    fn one_shot_table_stops_after_last_point() {
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let t = ScheduleTableId(1); // non-repeating fixture table
        ts.start_rel(cfg, &mut tb, t, 1).unwrap();
        let fired = run(&mut ts, &mut tb, cfg, 100);
        assert_eq!(fired.len(), 1);
        assert_eq!(ts.status(t), (ScheduleTableState::Stopped, false));
        // It may be started again.
        ts.start_rel(cfg, &mut tb, t, 1).unwrap();
    }

    #[test]
    fn start_state_errors() {
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let t = ScheduleTableId(0);
        assert_eq!(
            ts.start_rel(cfg, &mut tb, t, 0),
            Err(ServiceError::ValueOutOfRange)
        );
        ts.start_rel(cfg, &mut tb, t, 5).unwrap();
        assert_eq!(
            ts.start_rel(cfg, &mut tb, t, 5),
            Err(ServiceError::WrongState)
        );
        assert_eq!(ts.stop(cfg, &mut tb, t), Ok(()));
        assert_eq!(ts.stop(cfg, &mut tb, t), Err(ServiceError::NotInUse));
    }

    #[test]
    fn chained_successor_takes_over_at_round_end() {
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let a = ScheduleTableId(0);
        let b = ScheduleTableId(1);

        ts.start_rel(cfg, &mut tb, a, 5).unwrap();
        ts.chain(a, b).unwrap();
        assert_eq!(ts.status(b), (ScheduleTableState::Waiting, false));

        // Table a: points at 15 and 35, round ends at 105; table b's sole
        // point (offset 10) then fires at 115.
        let fired = run(&mut ts, &mut tb, cfg, 130);
        assert_eq!(fired[..2], [(15, act(0)), (35, act(1))]);
        assert_eq!(fired[2].0, 115);
        assert_eq!(ts.status(a), (ScheduleTableState::Stopped, false));
        assert_eq!(ts.status(b), (ScheduleTableState::Running, false));
    }

    #[test]
    fn stop_downgrades_whole_chain() {
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let a = ScheduleTableId(0);
        let b = ScheduleTableId(1);
        ts.start_rel(cfg, &mut tb, a, 5).unwrap();
        ts.chain(a, b).unwrap();
        ts.stop(cfg, &mut tb, a).unwrap();
        assert_eq!(ts.status(a), (ScheduleTableState::Stopped, false));
        assert_eq!(ts.status(b), (ScheduleTableState::Stopped, false));
        assert!(!tb.alarm_in_use(AlarmId(1)));
    }

    #[test]
    fn kill_quarantines_table_but_only_stops_successors() {
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let a = ScheduleTableId(0);
        let b = ScheduleTableId(1);
        ts.start_rel(cfg, &mut tb, a, 5).unwrap();
        ts.chain(a, b).unwrap();
        ts.kill(cfg, &mut tb, a);
        assert_eq!(ts.status(a), (ScheduleTableState::Quarantined, false));
        assert_eq!(ts.status(b), (ScheduleTableState::Stopped, false));
        // Quarantined tables cannot be restarted.
        assert_eq!(
            ts.start_rel(cfg, &mut tb, a, 5),
            Err(ServiceError::Access)
        );
    }

    #[test]
    fn synchron_start_waits_for_global_time() {
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let t = ScheduleTableId(2); // syncable fixture table
        ts.start_synchron(cfg, t).unwrap();
        assert_eq!(ts.status(t), (ScheduleTableState::Waiting, false));

        // Global time is 95 of a 100-tick period; the first point (offset
        // 10) is 15 ticks out.
        ts.sync(cfg, &mut tb, t, 95).unwrap();
        assert_eq!(ts.status(t), (ScheduleTableState::Running, true));
        let fired = run(&mut ts, &mut tb, cfg, 20);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 15);
    }

    #[test]
    fn sync_adjustment_respects_bounds_and_budget() {
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let t = ScheduleTableId(2);

        ts.start_synchron(cfg, t).unwrap();
        ts.sync(cfg, &mut tb, t, 0).unwrap();
        // First point fires at its offset, 10.
        let fired = run(&mut ts, &mut tb, cfg, 10);
        assert_eq!(fired.len(), 1);

        // Table position 10, global says 3: the table leads by 7, so
        // rounds are lengthened. The fixture allows at most 4 ticks of
        // increase per point.
        ts.sync(cfg, &mut tb, t, 3).unwrap();
        assert_eq!(ts.status(t), (ScheduleTableState::Running, false));

        // Next point is the round wrap back to offset 10: raw delay 100,
        // stretched by min(budget 7, max_increase 4) = 4, then the
        // following by the remaining 3.
        let fired = run(&mut ts, &mut tb, cfg, 104);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 10 + 104);
        let fired = run(&mut ts, &mut tb, cfg, 103);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 10 + 104 + 103);
        // Budget exhausted: back in sync, next round is nominal.
        assert_eq!(ts.status(t), (ScheduleTableState::Running, true));
        let fired = run(&mut ts, &mut tb, cfg, 100);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 10 + 104 + 103 + 100);
    }

    #[test]
    fn set_async_drops_pending_adjustment() {
        let cfg = table_fixture();
        let mut ts = TableSet::new();
        let mut tb = TimeBase::new();
        let t = ScheduleTableId(2);
        ts.start_synchron(cfg, t).unwrap();
        ts.sync(cfg, &mut tb, t, 0).unwrap();
        let _ = run(&mut ts, &mut tb, cfg, 10);
        ts.sync(cfg, &mut tb, t, 3).unwrap();
        ts.set_async(cfg, t).unwrap();
        // Further syncs are ignored and the next round is nominal.
        ts.sync(cfg, &mut tb, t, 50).unwrap();
        let fired = run(&mut ts, &mut tb, cfg, 100);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 110);
    }
}
