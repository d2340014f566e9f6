// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-core scheduling state and the dispatcher.
//!
//! [`CoreState`] collects everything one core owns: its task arena, ready
//! queue, time base, schedule tables, ceiling locks, application states and
//! the result table for its outbound cross-core calls. The task arena holds
//! a `Task` for every configured task regardless of core, so global task
//! indices work everywhere, but only tasks bound to this core ever enter
//! this core's ready queue.
//!
//! Operations come in at two levels. The `*_raw` methods implement one
//! service each against local state, returning `Result<_, UserError>` and a
//! [`NextTask`] hint; the `services` module wraps them with routing and
//! error reporting. Inbound cross-core requests land in [`Self::receive`],
//! which drains the message queue through a fixed handler table.

use abi::{
    AlarmId, AppId, CoreId, CounterId, EventMask, LockId, MsgOp,
    ProtectionFault, ProtectionResponse, ScheduleTableId, ScheduleTableState,
    ServiceError, ServiceId, TaskId, TaskState, NONE_INDEX,
};
use arrayvec::ArrayVec;

use crate::app::AppSet;
use crate::counter::TimeBase;
use crate::descs::{AlarmAction, KernelConfig, MAX_TASKS};
use crate::err::{self, ErrorRecord, UserError};
use crate::fail;
use crate::lock::{CeilingState, IrqControl};
use crate::readyq::ReadyQueue;
use crate::schedtab::TableSet;
use crate::startup::Shared;
use crate::task::{Activation, NextTask, Task, Termination};
use crate::time::Ticks;
use crate::xcore::{handler_index, Message, ResultTable, HANDLER_COUNT};

/// CPU-load measurement window, in execution-timer ticks.
pub const LOAD_WINDOW: u64 = 1_000_000;

/// All mutable kernel state owned by one core.
pub struct CoreState {
    core: CoreId,
    cfg: &'static KernelConfig,
    shared: &'static Shared,
    tasks: ArrayVec<Task, MAX_TASKS>,
    rq: ReadyQueue,
    tb: TimeBase,
    tables: TableSet,
    ceilings: CeilingState,
    apps: AppSet,
    results: ResultTable,
    load: crate::load::LoadMonitor,
    irq: IrqControl,
    /// Index of the running task, or `NONE_INDEX` when idle.
    current: u16,
    in_error_hook: bool,
    last_error: Option<ErrorRecord>,
    shutting_down: bool,
}

impl CoreState {
    pub fn new(
        cfg: &'static KernelConfig,
        shared: &'static Shared,
        core: CoreId,
    ) -> Self {
        let now = cfg.exec_timer.now();
        CoreState {
            core,
            cfg,
            shared,
            tasks: cfg.tasks.iter().map(Task::from_descriptor).collect(),
            rq: ReadyQueue::new(),
            tb: TimeBase::new(),
            tables: TableSet::new(),
            ceilings: CeilingState::new(),
            apps: AppSet::new(),
            results: ResultTable::new(),
            load: crate::load::LoadMonitor::new(LOAD_WINDOW, now),
            irq: IrqControl::new(),
            current: NONE_INDEX,
            in_error_hook: false,
            last_error: None,
            shutting_down: false,
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn config(&self) -> &'static KernelConfig {
        self.cfg
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn irq(&self) -> &IrqControl {
        &self.irq
    }

    pub fn current_task(&self) -> Option<TaskId> {
        if self.current == NONE_INDEX {
            None
        } else {
            Some(TaskId(self.current))
        }
    }

    /// Most recent recoverable error, for the diagnostic API.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error
    }

    pub(crate) fn now(&self) -> u64 {
        self.cfg.exec_timer.now()
    }

    // Object-to-core routing. Alarms and schedule tables live wherever
    // their counter does.

    pub(crate) fn task_core(&self, t: TaskId) -> CoreId {
        self.cfg.tasks[t.index()].core
    }

    pub(crate) fn counter_core(&self, c: CounterId) -> CoreId {
        self.cfg.counters[c.index()].core
    }

    pub(crate) fn alarm_core(&self, a: AlarmId) -> CoreId {
        self.counter_core(self.cfg.alarms[a.index()].counter)
    }

    pub(crate) fn table_core(&self, s: ScheduleTableId) -> CoreId {
        self.alarm_core(self.cfg.tables[s.index()].alarm)
    }

    /// Funnels a recoverable error through the error hook and records it.
    pub(crate) fn report(
        &mut self,
        service: ServiceId,
        error: ServiceError,
    ) -> ServiceError {
        err::report(
            self.cfg.hooks.error,
            &mut self.in_error_hook,
            &mut self.last_error,
            service,
            error,
        )
    }

    /// Applies a scheduler hint, running the dispatcher when the hint says
    /// the running task may have changed.
    pub fn apply(&mut self, next: NextTask) {
        match next {
            NextTask::Same => (),
            NextTask::Specific(_) | NextTask::Other => {
                self.dispatch();
            }
        }
    }

    /// Switches to the most important ready task, updating execution-time
    /// accounting and the load monitor on the way. The running task keeps
    /// its ready-queue slot, so "most important" includes it.
    pub fn dispatch(&mut self) -> Option<TaskId> {
        let now = self.now();
        let next = self.rq.find_highest().unwrap_or(NONE_INDEX);
        if next == self.current {
            return self.current_task();
        }
        if self.current != NONE_INDEX {
            let t = &mut self.tasks[usize::from(self.current)];
            t.exec.suspend(now);
            if t.state() == TaskState::Running {
                t.set_ready();
            }
            if let Some(hook) = self.cfg.hooks.post_task {
                hook(TaskId(self.current));
            }
        }
        self.current = next;
        if next != NONE_INDEX {
            let t = &mut self.tasks[usize::from(next)];
            t.set_running();
            t.exec.resume(now);
            self.load.busy(now);
            if let Some(hook) = self.cfg.hooks.pre_task {
                hook(TaskId(next));
            }
        } else {
            self.load.idle(now);
        }
        self.current_task()
    }

    /// Switch-out accounting for a task that ended rather than being
    /// preempted: charges its final slice, marks the core idle until the
    /// next dispatch, and runs the post-task hook.
    fn retire_current(&mut self, cur: u16) {
        let now = self.now();
        self.tasks[usize::from(cur)].exec.suspend(now);
        self.load.idle(now);
        if let Some(hook) = self.cfg.hooks.post_task {
            hook(TaskId(cur));
        }
        self.current = NONE_INDEX;
    }

    /// Charges elapsed time against the running task's execution budget.
    /// Called on every service entry and on timer interrupts; an overrun
    /// surfaces as a protection fault.
    pub(crate) fn budget_checkpoint(&mut self) -> Result<(), UserError> {
        if self.current != NONE_INDEX {
            let now = self.now();
            self.tasks[usize::from(self.current)].exec.check(now)?;
        }
        Ok(())
    }

    fn preempt_hint(&self, woken: u16) -> NextTask {
        if self.current == NONE_INDEX {
            return NextTask::Other;
        }
        let cur = self.tasks[usize::from(self.current)].priority();
        if self.tasks[usize::from(woken)]
            .priority()
            .is_more_important_than(cur)
        {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }

    fn current_or_call_level(&self) -> Result<u16, UserError> {
        if self.current == NONE_INDEX {
            Err(ServiceError::CallLevel.into())
        } else {
            Ok(self.current)
        }
    }

    // Raw task services.

    pub(crate) fn activate_raw(
        &mut self,
        t: TaskId,
    ) -> Result<NextTask, UserError> {
        self.apps.check_accessible(self.cfg.tasks[t.index()].app)?;
        match self.tasks[t.index()].activate()? {
            Activation::Enqueue => {
                let prio = self.tasks[t.index()].priority().0;
                self.rq.enqueue(t.0, prio);
                Ok(self.preempt_hint(t.0))
            }
            Activation::Counted => Ok(NextTask::Same),
        }
    }

    pub(crate) fn get_state_raw(
        &self,
        t: TaskId,
    ) -> Result<TaskState, UserError> {
        Ok(self.tasks[t.index()].state())
    }

    /// Checks that the running task could terminate right now, without
    /// doing it. Cross-core chaining commits the remote activation first
    /// and must know the local half cannot then refuse.
    pub(crate) fn can_terminate(&self) -> Result<(), UserError> {
        let cur = self.current_or_call_level()?;
        if self.ceilings.holds_any(cur) {
            return Err(ServiceError::Resource.into());
        }
        Ok(())
    }

    pub(crate) fn terminate_raw(&mut self) -> Result<NextTask, UserError> {
        let cur = self.current_or_call_level()?;
        if self.ceilings.holds_any(cur) {
            return Err(ServiceError::Resource.into());
        }
        let prio = self.tasks[usize::from(cur)].priority().0;
        match self.tasks[usize::from(cur)].terminate() {
            Termination::Suspended => self.rq.dequeue(cur, prio),
            Termination::Requeue => {
                // Consumed a queued activation; the fresh run goes to the
                // tail of its priority.
                self.rq.dequeue(cur, prio);
                self.rq.enqueue(cur, prio);
            }
        }
        self.retire_current(cur);
        Ok(NextTask::Other)
    }

    pub(crate) fn chain_raw(
        &mut self,
        next: TaskId,
    ) -> Result<NextTask, UserError> {
        let cur = self.current_or_call_level()?;
        if self.ceilings.holds_any(cur) {
            return Err(ServiceError::Resource.into());
        }
        if next.0 == cur {
            // Chaining to self always succeeds: terminating frees one
            // activation slot and the chained activation takes it, whether
            // that means restarting from suspended or restoring the queued
            // count `terminate` consumed.
            let prio = self.tasks[usize::from(cur)].priority().0;
            self.rq.dequeue(cur, prio);
            let _ = self.tasks[usize::from(cur)].terminate();
            let _ = self.tasks[usize::from(cur)].activate()?;
            self.rq.enqueue(cur, prio);
            self.retire_current(cur);
            return Ok(NextTask::Other);
        }
        // The successor is vetted before the caller's activation ends, so a
        // refused chain leaves the caller running.
        self.apps.check_accessible(self.cfg.tasks[next.index()].app)?;
        self.tasks[next.index()].can_activate()?;

        let prio = self.tasks[usize::from(cur)].priority().0;
        match self.tasks[usize::from(cur)].terminate() {
            Termination::Suspended => self.rq.dequeue(cur, prio),
            Termination::Requeue => {
                self.rq.dequeue(cur, prio);
                self.rq.enqueue(cur, prio);
            }
        }
        if let Activation::Enqueue = self.tasks[next.index()].activate()? {
            let nprio = self.tasks[next.index()].priority().0;
            self.rq.enqueue(next.0, nprio);
        }
        self.retire_current(cur);
        Ok(NextTask::Other)
    }

    // Raw event services.

    pub(crate) fn set_event_raw(
        &mut self,
        t: TaskId,
        events: EventMask,
    ) -> Result<NextTask, UserError> {
        self.apps.check_accessible(self.cfg.tasks[t.index()].app)?;
        if self.tasks[t.index()].post_events(events)? {
            let prio = self.tasks[t.index()].priority().0;
            self.rq.enqueue(t.0, prio);
            Ok(self.preempt_hint(t.0))
        } else {
            Ok(NextTask::Same)
        }
    }

    pub(crate) fn clear_event_raw(
        &mut self,
        events: EventMask,
    ) -> Result<(), UserError> {
        let cur = self.current_or_call_level()?;
        self.tasks[usize::from(cur)].clear_events(events);
        Ok(())
    }

    pub(crate) fn get_event_raw(
        &self,
        t: TaskId,
    ) -> Result<EventMask, UserError> {
        Ok(self.tasks[t.index()].events())
    }

    pub(crate) fn wait_event_raw(
        &mut self,
        events: EventMask,
    ) -> Result<NextTask, UserError> {
        let cur = self.current_or_call_level()?;
        if self.ceilings.holds_any(cur) {
            return Err(ServiceError::Resource.into());
        }
        if self.tasks[usize::from(cur)].wait_for(events)? {
            // An awaited event is already pending; no block.
            Ok(NextTask::Same)
        } else {
            let prio = self.tasks[usize::from(cur)].priority().0;
            self.rq.dequeue(cur, prio);
            Ok(NextTask::Other)
        }
    }

    // Raw counter and alarm services.

    pub(crate) fn increment_raw(
        &mut self,
        c: CounterId,
    ) -> Result<NextTask, UserError> {
        let cd = &self.cfg.counters[c.index()];
        self.apps.check_accessible(cd.app)?;
        if cd.hw.is_some() {
            // Hardware counters advance on their own.
            return Err(ServiceError::Access.into());
        }
        Ok(self.advance_raw(c, 1))
    }

    pub(crate) fn get_count_raw(
        &mut self,
        c: CounterId,
    ) -> Result<Ticks, UserError> {
        // Resynchronizing may fire expiries that wake someone; apply the
        // hint here rather than losing it in the query path.
        let next = self.poll_counter(c);
        self.apply(next);
        Ok(self.tb.value(c))
    }

    /// Moves `c` forward by `ticks`, firing every expiry due in that span.
    /// Each expiry's action runs with the counter's timing error still set,
    /// so alarms armed from inside an action measure from the expiry point.
    pub(crate) fn advance_raw(
        &mut self,
        c: CounterId,
        ticks: Ticks,
    ) -> NextTask {
        let mut next = NextTask::Same;
        self.tb.advance_begin(self.cfg, c, ticks);
        while let Some(alarm) = self.tb.advance_next(c) {
            next = next.combine(self.run_alarm(alarm));
        }
        self.tb.reprogram(self.cfg, c);
        next
    }

    /// Replays elapsed hardware time into `c`. Called from the counter's
    /// compare interrupt and lazily from value queries.
    pub fn poll_counter(&mut self, c: CounterId) -> NextTask {
        let elapsed = self.tb.hw_elapsed(self.cfg, c);
        if elapsed == 0 {
            self.tb.reprogram(self.cfg, c);
            return NextTask::Same;
        }
        self.advance_raw(c, elapsed)
    }

    /// Executes one alarm expiry. Failures of expiry actions have no caller
    /// to report to, so they go straight to the error hook.
    fn run_alarm(&mut self, alarm: AlarmId) -> NextTask {
        match self.cfg.alarms[alarm.index()].action {
            AlarmAction::ActivateTask(t) => {
                match self.activate_raw(t) {
                    Ok(next) => next,
                    Err(e) => self.report_expiry(ServiceId::ActivateTask, e),
                }
            }
            AlarmAction::SetEvent(t, events) => {
                match self.set_event_raw(t, events) {
                    Ok(next) => next,
                    Err(e) => self.report_expiry(ServiceId::SetEvent, e),
                }
            }
            AlarmAction::IncrementCounter(c) => {
                // Bounded: increment chains are checked for cycles at boot.
                self.advance_raw(c, 1)
            }
            AlarmAction::Callback(f) => {
                f();
                NextTask::Same
            }
            AlarmAction::RunScheduleTable(s) => {
                let action = self.tables.expire(self.cfg, &mut self.tb, s);
                let r = if action.event.is_empty() {
                    self.activate_raw(action.task)
                        .map_err(|e| (ServiceId::ActivateTask, e))
                } else {
                    self.set_event_raw(action.task, action.event)
                        .map_err(|e| (ServiceId::SetEvent, e))
                };
                match r {
                    Ok(next) => next,
                    Err((sid, e)) => self.report_expiry(sid, e),
                }
            }
        }
    }

    fn report_expiry(
        &mut self,
        service: ServiceId,
        error: UserError,
    ) -> NextTask {
        match error {
            UserError::Recoverable(e, next) => {
                self.report(service, e);
                next
            }
            UserError::Protection(fault) => {
                // Expiry actions can't blow a budget themselves; something
                // upstream is confused.
                fail::die(format_args!(
                    "protection fault {fault:?} from alarm expiry"
                ));
            }
        }
    }

    pub(crate) fn set_rel_raw(
        &mut self,
        alarm: AlarmId,
        increment: Ticks,
        cycle: Ticks,
    ) -> Result<(), UserError> {
        self.check_user_alarm(alarm)?;
        self.tb.set_rel(self.cfg, alarm, increment, cycle)?;
        Ok(())
    }

    pub(crate) fn set_abs_raw(
        &mut self,
        alarm: AlarmId,
        start: Ticks,
        cycle: Ticks,
    ) -> Result<(), UserError> {
        self.check_user_alarm(alarm)?;
        self.tb.set_abs(self.cfg, alarm, start, cycle)?;
        Ok(())
    }

    pub(crate) fn cancel_raw(
        &mut self,
        alarm: AlarmId,
    ) -> Result<(), UserError> {
        self.check_user_alarm(alarm)?;
        self.tb.cancel(self.cfg, alarm)?;
        let c = self.cfg.alarms[alarm.index()].counter;
        self.tb.reprogram(self.cfg, c);
        Ok(())
    }

    pub(crate) fn remaining_raw(
        &mut self,
        alarm: AlarmId,
    ) -> Result<Ticks, UserError> {
        self.check_user_alarm(alarm)?;
        let c = self.cfg.alarms[alarm.index()].counter;
        let next = self.poll_counter(c);
        self.apply(next);
        Ok(self.tb.remaining(self.cfg, alarm)?)
    }

    /// Alarms embedded in schedule tables are kernel-owned; the alarm
    /// services refuse them.
    fn check_user_alarm(&self, alarm: AlarmId) -> Result<(), UserError> {
        let desc = &self.cfg.alarms[alarm.index()];
        if matches!(desc.action, AlarmAction::RunScheduleTable(_)) {
            return Err(ServiceError::Access.into());
        }
        self.apps.check_accessible(desc.app)?;
        Ok(())
    }

    // Raw schedule table services.

    fn check_table(&self, s: ScheduleTableId) -> Result<(), UserError> {
        self.apps.check_accessible(self.cfg.tables[s.index()].app)?;
        Ok(())
    }

    pub(crate) fn table_start_rel_raw(
        &mut self,
        s: ScheduleTableId,
        offset: Ticks,
    ) -> Result<(), UserError> {
        self.check_table(s)?;
        self.tables.start_rel(self.cfg, &mut self.tb, s, offset)?;
        Ok(())
    }

    pub(crate) fn table_start_abs_raw(
        &mut self,
        s: ScheduleTableId,
        start: Ticks,
    ) -> Result<(), UserError> {
        self.check_table(s)?;
        self.tables.start_abs(self.cfg, &mut self.tb, s, start)?;
        Ok(())
    }

    pub(crate) fn table_start_synchron_raw(
        &mut self,
        s: ScheduleTableId,
    ) -> Result<(), UserError> {
        self.check_table(s)?;
        self.tables.start_synchron(self.cfg, s)?;
        Ok(())
    }

    pub(crate) fn table_stop_raw(
        &mut self,
        s: ScheduleTableId,
    ) -> Result<(), UserError> {
        self.check_table(s)?;
        self.tables.stop(self.cfg, &mut self.tb, s)?;
        Ok(())
    }

    pub(crate) fn table_chain_raw(
        &mut self,
        s: ScheduleTableId,
        next: ScheduleTableId,
    ) -> Result<(), UserError> {
        self.check_table(s)?;
        self.check_table(next)?;
        // Chaining only joins tables on the same counter: the successor's
        // first delay is measured on the predecessor's time base.
        let c = self.cfg.alarms[self.cfg.tables[s.index()].alarm.index()]
            .counter;
        let nc = self.cfg.alarms
            [self.cfg.tables[next.index()].alarm.index()]
        .counter;
        if c != nc {
            return Err(ServiceError::InvalidId.into());
        }
        self.tables.chain(s, next)?;
        Ok(())
    }

    pub(crate) fn table_sync_raw(
        &mut self,
        s: ScheduleTableId,
        global: Ticks,
    ) -> Result<(), UserError> {
        self.check_table(s)?;
        self.tables.sync(self.cfg, &mut self.tb, s, global)?;
        Ok(())
    }

    pub(crate) fn table_set_async_raw(
        &mut self,
        s: ScheduleTableId,
    ) -> Result<(), UserError> {
        self.check_table(s)?;
        self.tables.set_async(self.cfg, s)?;
        Ok(())
    }

    pub(crate) fn table_status_raw(
        &self,
        s: ScheduleTableId,
    ) -> Result<(ScheduleTableState, bool), UserError> {
        Ok(self.tables.status(s))
    }

    // Raw lock services. Locks are core-local by construction; there is no
    // remote path for them.

    pub(crate) fn get_lock_raw(
        &mut self,
        lock: LockId,
    ) -> Result<NextTask, UserError> {
        let cur = self.current_or_call_level()?;
        if lock.index() >= self.cfg.locks.len() {
            return Err(ServiceError::InvalidId.into());
        }
        self.apps.check_accessible(self.cfg.locks[lock.index()].app)?;
        let now = self.now();
        self.ceilings.acquire(
            lock,
            &self.cfg.locks[lock.index()],
            cur,
            &mut self.tasks,
            &mut self.rq,
            now,
        )?;
        // The caller was the most important ready task and only got more
        // so; it keeps running.
        Ok(NextTask::Same)
    }

    pub(crate) fn release_lock_raw(
        &mut self,
        lock: LockId,
    ) -> Result<NextTask, UserError> {
        let cur = self.current_or_call_level()?;
        if lock.index() >= self.cfg.locks.len() {
            return Err(ServiceError::InvalidId.into());
        }
        let now = self.now();
        self.ceilings.release(
            lock,
            &self.cfg.locks[lock.index()],
            cur,
            &mut self.tasks,
            &mut self.rq,
            now,
        )?;
        // Dropping back from the ceiling may unmask a more important task.
        Ok(NextTask::Other)
    }

    // Application lifecycle.

    pub(crate) fn terminate_app_raw(
        &mut self,
        app: AppId,
        restart: bool,
    ) -> Result<NextTask, UserError> {
        self.apps.terminate(app, restart)?;
        self.reap_app(app, restart);
        Ok(NextTask::Other)
    }

    pub(crate) fn allow_access_raw(
        &mut self,
        app: AppId,
    ) -> Result<(), UserError> {
        self.apps.allow_access(app)?;
        Ok(())
    }

    /// Tears down every object `app` owns after its state has already been
    /// switched to restarting or quarantined. With `restart`, the tasks are
    /// reset to boot state and the configured restart task is activated.
    fn reap_app(&mut self, app: AppId, restart: bool) {
        for i in 0..self.tasks.len() {
            if self.cfg.tasks[i].app != app
                || self.cfg.tasks[i].core != self.core
            {
                continue;
            }
            let ti = i as u16;
            self.ceilings.strip(ti);
            let prio = self.tasks[i].priority().0;
            let was_queued = if restart {
                self.tasks[i].kill()
            } else {
                self.tasks[i].quarantine()
            };
            if was_queued {
                self.rq.dequeue(ti, prio);
            }
            if self.current == ti {
                self.retire_current(ti);
            }
            if restart {
                self.tasks[i].reinitialize();
            }
        }

        for (i, a) in self.cfg.alarms.iter().enumerate() {
            if a.app != app || self.counter_core(a.counter) != self.core {
                continue;
            }
            if matches!(a.action, AlarmAction::RunScheduleTable(_)) {
                // Table alarms are disarmed through their table below.
                continue;
            }
            if self.tb.alarm_in_use(AlarmId(i as u16)) {
                self.tb.disarm_internal(self.cfg, AlarmId(i as u16));
            }
        }

        for (i, s) in self.cfg.tables.iter().enumerate() {
            let sid = ScheduleTableId(i as u16);
            if s.app != app || self.table_core(sid) != self.core {
                continue;
            }
            self.tables.kill(self.cfg, &mut self.tb, sid);
        }

        if restart {
            if let Some(rt) = self.cfg.apps[app.index()].restart_task {
                // The app is still in the restarting state; activation goes
                // around the accessibility check.
                match self.tasks[rt.index()].activate() {
                    Ok(Activation::Enqueue) => {
                        let prio = self.tasks[rt.index()].priority().0;
                        self.rq.enqueue(rt.0, prio);
                    }
                    Ok(Activation::Counted) => (),
                    Err(_) => fail::die(
                        "restart task refused activation after reset",
                    ),
                }
            }
        }
    }

    // Protection fault handling.

    /// Delivers a protection fault to the application's hook and applies
    /// the response. Without a hook the offending task is killed.
    pub(crate) fn protection_fault(&mut self, fault: ProtectionFault) {
        let response = match self.cfg.hooks.protection {
            Some(hook) => hook(fault),
            None => ProtectionResponse::KillTask,
        };
        match response {
            ProtectionResponse::KillTask => {
                if self.current == NONE_INDEX {
                    // No task to pin it on; contain by stopping the core.
                    self.shutdown_core();
                } else {
                    self.kill_task(self.current);
                }
            }
            ProtectionResponse::KillApp | ProtectionResponse::RestartApp => {
                if self.current == NONE_INDEX {
                    self.shutdown_core();
                } else {
                    let app = self.cfg.tasks[usize::from(self.current)].app;
                    let restart =
                        response == ProtectionResponse::RestartApp;
                    if self.terminate_app_raw(app, restart).is_err() {
                        // The app was already down; fall back to the task.
                        self.kill_task(self.current);
                    }
                }
            }
            ProtectionResponse::Shutdown => self.shutdown_core(),
        }
    }

    fn kill_task(&mut self, t: u16) {
        self.ceilings.strip(t);
        let prio = self.tasks[usize::from(t)].priority().0;
        if self.tasks[usize::from(t)].quarantine() {
            self.rq.dequeue(t, prio);
        }
        if self.current == t {
            self.retire_current(t);
        }
    }

    // Shutdown.

    /// Stops this core: marks it unreachable on the bus and runs the
    /// shutdown hook. Requests already queued for it are answered with
    /// `CoreDown` as they drain.
    pub fn shutdown_core(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.shared.bus.mark_down(self.core);
        if let Some(hook) = self.cfg.hooks.shutdown {
            hook();
        }
    }

    /// Stops every core: posts a shutdown request to each peer, then stops
    /// this one.
    pub fn shutdown_all(&mut self) {
        for c in 0..self.cfg.num_cores {
            let c = CoreId(c);
            if c == self.core || self.shared.bus.is_down(c) {
                continue;
            }
            self.shared.bus.send(
                c,
                Message {
                    op: MsgOp::ShutdownCore as u8,
                    origin: self.core,
                    reply_slot: NONE_INDEX,
                    params: [0; abi::MSG_PARAMS],
                },
            );
        }
        self.shutdown_core();
    }

    // Cross-core plumbing.

    /// Drains this core's inbound message queue, executing each request.
    pub fn receive(&mut self) {
        let shared = self.shared;
        shared.bus.drain(self.core, |m| self.handle_msg(m));
    }

    fn handle_msg(&mut self, m: Message) {
        if self.shutting_down {
            match MsgOp::try_from(m.op) {
                Ok(MsgOp::ShutdownCore) | Ok(MsgOp::Reply) => (),
                _ if m.reply_slot != NONE_INDEX => {
                    self.reply_to(&m, ServiceError::CoreDown.code(), 0);
                }
                _ => fail::die("request for a core that is down"),
            }
            return;
        }
        HANDLERS[handler_index(m.op)](self, &m);
    }

    fn reply_to(&mut self, m: &Message, code: u32, value: u32) {
        if m.reply_slot != NONE_INDEX {
            self.shared
                .bus
                .send(m.origin, m.reply(self.core, code, value));
        }
    }

    fn finish(
        &mut self,
        m: &Message,
        r: Result<(u32, NextTask), UserError>,
    ) {
        match r {
            Ok((value, next)) => {
                self.reply_to(m, 0, value);
                self.apply(next);
            }
            Err(UserError::Recoverable(e, next)) => {
                self.reply_to(m, e.code(), 0);
                self.apply(next);
            }
            Err(UserError::Protection(fault)) => {
                // Remote requests carry no budget of their own.
                fail::die(format_args!(
                    "protection fault {fault:?} from remote request"
                ));
            }
        }
    }

    // Wire argument decoding. A request for an object that is out of range
    // or not homed here was misrouted; the origin gets `InvalidId` back.

    fn task_arg(&self, raw: u32) -> Result<TaskId, UserError> {
        let t = TaskId(raw as u16);
        if raw < self.cfg.tasks.len() as u32 && self.task_core(t) == self.core
        {
            Ok(t)
        } else {
            Err(ServiceError::InvalidId.into())
        }
    }

    fn counter_arg(&self, raw: u32) -> Result<CounterId, UserError> {
        let c = CounterId(raw as u16);
        if raw < self.cfg.counters.len() as u32
            && self.counter_core(c) == self.core
        {
            Ok(c)
        } else {
            Err(ServiceError::InvalidId.into())
        }
    }

    fn alarm_arg(&self, raw: u32) -> Result<AlarmId, UserError> {
        let a = AlarmId(raw as u16);
        if raw < self.cfg.alarms.len() as u32 && self.alarm_core(a) == self.core
        {
            Ok(a)
        } else {
            Err(ServiceError::InvalidId.into())
        }
    }

    fn table_arg(&self, raw: u32) -> Result<ScheduleTableId, UserError> {
        let s = ScheduleTableId(raw as u16);
        if raw < self.cfg.tables.len() as u32 && self.table_core(s) == self.core
        {
            Ok(s)
        } else {
            Err(ServiceError::InvalidId.into())
        }
    }

    /// Issues a request to `dest` and spins on the local queue until the
    /// reply lands (servicing other inbound requests meanwhile). If `dest`
    /// goes down before replying, the call fails with `CoreDown`.
    pub(crate) fn remote_call(
        &mut self,
        dest: CoreId,
        op: MsgOp,
        params: [u32; abi::MSG_PARAMS],
    ) -> Result<u32, ServiceError> {
        if self.shared.bus.is_down(dest) {
            return Err(ServiceError::CoreDown);
        }
        let slot = self.results.allocate()?;
        self.shared.bus.send(
            dest,
            Message {
                op: op as u8,
                origin: self.core,
                reply_slot: slot,
                params,
            },
        );
        loop {
            self.receive();
            if let Some((code, value)) = self.results.take(slot) {
                return if code == 0 {
                    Ok(value)
                } else {
                    match ServiceError::try_from(code) {
                        Ok(e) => Err(e),
                        Err(()) => fail::die(format_args!(
                            "bad error code {code} in cross-core reply"
                        )),
                    }
                };
            }
            if self.shared.bus.is_down(dest) {
                self.results.cancel(slot);
                return Err(ServiceError::CoreDown);
            }
            core::hint::spin_loop();
        }
    }

    // Inbound request handlers, indexed by opcode.

    fn msg_unknown(&mut self, m: &Message) {
        if m.reply_slot != NONE_INDEX {
            self.reply_to(m, ServiceError::InvalidId.code(), 0);
        } else {
            fail::die(format_args!(
                "undecodable cross-core request op {}",
                m.op
            ));
        }
    }

    fn msg_activate(&mut self, m: &Message) {
        let r = self
            .task_arg(m.params[0])
            .and_then(|t| self.activate_raw(t))
            .map(|next| (0, next));
        self.finish(m, r);
    }

    fn msg_get_state(&mut self, m: &Message) {
        let r = self
            .task_arg(m.params[0])
            .and_then(|t| self.get_state_raw(t))
            .map(|s| (s.code(), NextTask::Same));
        self.finish(m, r);
    }

    fn msg_set_event(&mut self, m: &Message) {
        let r = self
            .task_arg(m.params[0])
            .and_then(|t| self.set_event_raw(t, EventMask(m.params[1])))
            .map(|next| (0, next));
        self.finish(m, r);
    }

    fn msg_get_alarm(&mut self, m: &Message) {
        let r = self
            .alarm_arg(m.params[0])
            .and_then(|a| self.remaining_raw(a))
            .map(|left| (left, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_set_rel(&mut self, m: &Message) {
        let r = self
            .alarm_arg(m.params[0])
            .and_then(|a| self.set_rel_raw(a, m.params[1], m.params[2]))
            .map(|()| (0, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_set_abs(&mut self, m: &Message) {
        let r = self
            .alarm_arg(m.params[0])
            .and_then(|a| self.set_abs_raw(a, m.params[1], m.params[2]))
            .map(|()| (0, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_cancel(&mut self, m: &Message) {
        let r = self
            .alarm_arg(m.params[0])
            .and_then(|a| self.cancel_raw(a))
            .map(|()| (0, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_advance(&mut self, m: &Message) {
        let r = self
            .counter_arg(m.params[0])
            .and_then(|c| self.increment_raw(c))
            .map(|next| (0, next));
        self.finish(m, r);
    }

    fn msg_get_count(&mut self, m: &Message) {
        let r = self
            .counter_arg(m.params[0])
            .and_then(|c| self.get_count_raw(c))
            .map(|v| (v, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_table_start_rel(&mut self, m: &Message) {
        let r = self
            .table_arg(m.params[0])
            .and_then(|s| self.table_start_rel_raw(s, m.params[1]))
            .map(|()| (0, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_table_start_abs(&mut self, m: &Message) {
        let r = self
            .table_arg(m.params[0])
            .and_then(|s| self.table_start_abs_raw(s, m.params[1]))
            .map(|()| (0, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_table_stop(&mut self, m: &Message) {
        let r = self
            .table_arg(m.params[0])
            .and_then(|s| self.table_stop_raw(s))
            .map(|()| (0, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_table_sync(&mut self, m: &Message) {
        let r = self
            .table_arg(m.params[0])
            .and_then(|s| self.table_sync_raw(s, m.params[1]))
            .map(|()| (0, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_table_set_async(&mut self, m: &Message) {
        let r = self
            .table_arg(m.params[0])
            .and_then(|s| self.table_set_async_raw(s))
            .map(|()| (0, NextTask::Same));
        self.finish(m, r);
    }

    fn msg_table_status(&mut self, m: &Message) {
        let r = self
            .table_arg(m.params[0])
            .and_then(|s| self.table_status_raw(s))
            .map(|(state, sync)| {
                (state.code() | (u32::from(sync) << 8), NextTask::Same)
            });
        self.finish(m, r);
    }

    fn msg_shutdown(&mut self, _m: &Message) {
        self.shutdown_core();
    }

    fn msg_reply(&mut self, m: &Message) {
        self.results.complete(
            m.params[0] as u16,
            m.params[1],
            m.params[2],
        );
    }

    // Diagnostics.

    /// The running task's CPU this core has consumed over the current load
    /// window, as a percentage.
    pub fn cpu_load(&mut self) -> u8 {
        let now = self.now();
        self.load.current(now)
    }

    pub fn peak_cpu_load(&mut self) -> u8 {
        let now = self.now();
        self.load.peak(now)
    }

    pub fn reset_peak_cpu_load(&mut self) {
        self.load.reset_peak();
    }

    pub(crate) fn task_ref(&self, t: TaskId) -> &Task {
        &self.tasks[t.index()]
    }

    pub(crate) fn task_mut(&mut self, t: TaskId) -> &mut Task {
        &mut self.tasks[t.index()]
    }
}

type Handler = fn(&mut CoreState, &Message);

/// Handler table for inbound cross-core requests, in [`MsgOp`] order with
/// the unknown-call fallback at index 0.
static HANDLERS: [Handler; HANDLER_COUNT] = [
    CoreState::msg_unknown,
    CoreState::msg_activate,
    CoreState::msg_get_state,
    CoreState::msg_set_event,
    CoreState::msg_get_alarm,
    CoreState::msg_set_rel,
    CoreState::msg_set_abs,
    CoreState::msg_cancel,
    CoreState::msg_advance,
    CoreState::msg_get_count,
    CoreState::msg_table_start_rel,
    CoreState::msg_table_start_abs,
    CoreState::msg_table_stop,
    CoreState::msg_table_sync,
    CoreState::msg_table_set_async,
    CoreState::msg_table_status,
    CoreState::msg_shutdown,
    CoreState::msg_reply,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::descs::Hooks;
    use crate::startup::Shared;
    use crate::test_support::*;

    fn kernel(cfg: &'static KernelConfig) -> CoreState {
        let shared = Box::leak(Box::new(Shared::new()));
        CoreState::new(cfg, shared, CoreId(0))
    }

    #[test]
    fn dispatch_follows_priority() {
        let cfg = config_tasks(&[5, 7, 3]);
        let mut k = kernel(cfg);
        assert_eq!(k.current_task(), None);

        k.activate_task(TaskId(2)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(2)));
        k.activate_task(TaskId(0)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));
        k.activate_task(TaskId(1)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(1)));

        k.terminate_task().unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));
        k.terminate_task().unwrap();
        assert_eq!(k.current_task(), Some(TaskId(2)));
        k.terminate_task().unwrap();
        assert_eq!(k.current_task(), None);
    }

    #[test]
    fn activations_queue_up_to_the_limit() {
        let mut t = task(5, 0);
        t.max_activations = 3;
        let cfg = config_tasks_timed(vec![t], Hooks::default()).0;
        let mut k = kernel(cfg);

        k.activate_task(TaskId(0)).unwrap();
        k.activate_task(TaskId(0)).unwrap();
        k.activate_task(TaskId(0)).unwrap();
        assert_eq!(k.activate_task(TaskId(0)), Err(ServiceError::Limit));

        // Each termination consumes one queued activation before the task
        // finally suspends.
        k.terminate_task().unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));
        k.terminate_task().unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));
        k.terminate_task().unwrap();
        assert_eq!(k.current_task(), None);
    }

    #[test]
    fn chain_to_self_restarts_the_task() {
        let cfg = config_tasks(&[5]);
        let mut k = kernel(cfg);
        k.activate_task(TaskId(0)).unwrap();
        k.chain_task(TaskId(0)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));
        k.terminate_task().unwrap();
        assert_eq!(k.current_task(), None);
    }

    #[test]
    fn refused_chain_leaves_the_caller_running() {
        let cfg = config_tasks(&[5, 5]);
        let mut k = kernel(cfg);
        k.activate_task(TaskId(0)).unwrap();
        k.activate_task(TaskId(1)).unwrap();
        // Task 1 is at its activation limit; the chain must refuse without
        // ending the caller.
        assert_eq!(k.chain_task(TaskId(1)), Err(ServiceError::Limit));
        assert_eq!(k.current_task(), Some(TaskId(0)));
        assert_eq!(
            k.get_task_state(TaskId(0)).unwrap(),
            TaskState::Running
        );

        k.chain_task(TaskId(1)).unwrap_err(); // still refused
        k.terminate_task().unwrap();
        assert_eq!(k.current_task(), Some(TaskId(1)));
        k.chain_task(TaskId(0)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));
        assert_eq!(
            k.get_task_state(TaskId(1)).unwrap(),
            TaskState::Suspended
        );
    }

    #[test]
    fn events_block_and_wake() {
        let mut e = task(5, 0);
        e.flags = crate::descs::TaskFlags::EXTENDED;
        let cfg = config_tasks_timed(vec![e, task(3, 0)], Hooks::default()).0;
        let mut k = kernel(cfg);

        k.activate_task(TaskId(0)).unwrap();
        k.activate_task(TaskId(1)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));

        k.wait_event(EventMask(0b01)).unwrap();
        // The waiter blocked; the background task takes over.
        assert_eq!(k.current_task(), Some(TaskId(1)));
        assert_eq!(
            k.get_task_state(TaskId(0)).unwrap(),
            TaskState::Waiting
        );

        k.set_event(TaskId(0), EventMask(0b11)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));
        assert_eq!(k.get_event(TaskId(0)).unwrap(), EventMask(0b11));
        k.clear_event(EventMask(0b01)).unwrap();
        assert_eq!(k.get_event(TaskId(0)).unwrap(), EventMask(0b10));

        // A wait on an already-pending event does not block.
        k.wait_event(EventMask(0b10)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));

        // Basic tasks cannot receive events.
        assert_eq!(
            k.set_event(TaskId(1), EventMask(1)),
            Err(ServiceError::Access)
        );
    }

    #[test]
    fn counter_increments_drive_activation() {
        let cfg = config_with_alarms(1000, 1);
        let mut k = kernel(cfg);
        k.set_rel_alarm(AlarmId(0), 10, 0).unwrap();
        for i in 1..10 {
            k.increment_counter(CounterId(0)).unwrap();
            assert_eq!(k.current_task(), None, "fired early at tick {i}");
        }
        k.increment_counter(CounterId(0)).unwrap();
        assert_eq!(k.current_task(), Some(TaskId(0)));
        assert_eq!(k.get_counter_value(CounterId(0)), Ok(10));
    }

    #[test]
    fn blown_budget_kills_the_task() {
        let mut t = task(5, 0);
        t.exec_budget = 100;
        let (cfg, timer) =
            config_tasks_timed(vec![t, task(3, 0)], Hooks::default());
        let mut k = kernel(cfg);

        k.activate_task(TaskId(0)).unwrap();
        timer.set(150);
        // Any service entry notices the overrun; without a protection hook
        // the offender is quarantined.
        assert_eq!(
            k.get_task_state(TaskId(1)),
            Err(ServiceError::Access)
        );
        assert_eq!(
            k.get_task_state(TaskId(0)).unwrap(),
            TaskState::Quarantined
        );
        assert_eq!(k.current_task(), None);
        assert_eq!(
            k.activate_task(TaskId(0)),
            Err(ServiceError::Access)
        );
    }

    #[test]
    fn protection_hook_can_shut_the_core_down() {
        fn shutdown_hook(
            _f: abi::ProtectionFault,
        ) -> abi::ProtectionResponse {
            abi::ProtectionResponse::Shutdown
        }
        let mut t = task(5, 0);
        t.exec_budget = 10;
        let hooks = Hooks {
            protection: Some(shutdown_hook),
            ..Hooks::default()
        };
        let (cfg, timer) = config_tasks_timed(vec![t], hooks);
        let mut k = kernel(cfg);
        k.activate_task(TaskId(0)).unwrap();
        timer.set(50);
        let _ = k.get_task_state(TaskId(0));
        assert!(k.is_shutting_down());
    }

    #[test]
    fn killed_application_restarts_through_its_restart_task() {
        let cfg = config_with_restart();
        let mut k = kernel(cfg);
        k.activate_task(TaskId(0)).unwrap();
        k.set_rel_alarm(AlarmId(0), 10, 10).unwrap();

        k.terminate_application(AppId(0), true).unwrap();
        // The restart task is the only thing left standing.
        assert_eq!(k.current_task(), Some(TaskId(1)));
        // Objects stay inaccessible until access is restored.
        assert_eq!(
            k.activate_task(TaskId(0)),
            Err(ServiceError::Access)
        );
        k.allow_access(AppId(0)).unwrap();
        // The kill disarmed the app's alarm.
        assert_eq!(k.get_alarm(AlarmId(0)), Err(ServiceError::NotInUse));
        k.activate_task(TaskId(0)).unwrap();
        assert_eq!(
            k.get_task_state(TaskId(0)).unwrap(),
            TaskState::Ready
        );

        // Killing without restart quarantines for good.
        k.terminate_application(AppId(0), false).unwrap();
        assert_eq!(k.current_task(), None);
        assert_eq!(
            k.get_task_state(TaskId(1)).unwrap(),
            TaskState::Quarantined
        );
        assert_eq!(
            k.allow_access(AppId(0)),
            Err(ServiceError::WrongState)
        );
    }

    #[test]
    fn load_monitor_tracks_the_busy_window() {
        let (cfg, timer) =
            config_tasks_timed(vec![task(5, 0)], Hooks::default());
        let mut k = kernel(cfg);
        k.activate_task(TaskId(0)).unwrap();
        timer.set(LOAD_WINDOW / 2);
        k.terminate_task().unwrap();
        timer.set(LOAD_WINDOW);
        assert_eq!(k.cpu_load(), 50);
        assert_eq!(k.peak_cpu_load(), 50);
        timer.set(2 * LOAD_WINDOW);
        assert_eq!(k.cpu_load(), 0);
        assert_eq!(k.peak_cpu_load(), 50);
        k.reset_peak_cpu_load();
        assert_eq!(k.peak_cpu_load(), 0);
    }

    static HOOK_CALLS: AtomicU32 = AtomicU32::new(0);

    fn counting_hook(_s: ServiceId, _e: ServiceError) {
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn service_errors_reach_the_error_hook() {
        HOOK_CALLS.store(0, Ordering::SeqCst);
        let hooks = Hooks {
            error: Some(counting_hook),
            ..Hooks::default()
        };
        let cfg = config_tasks_timed(vec![task(5, 0)], hooks).0;
        let mut k = kernel(cfg);
        assert_eq!(
            k.activate_task(TaskId(9)),
            Err(ServiceError::InvalidId)
        );
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(
            k.last_error(),
            Some(crate::err::ErrorRecord {
                service: ServiceId::ActivateTask,
                error: ServiceError::InvalidId,
            })
        );
    }

    static PRE_CALLS: AtomicU32 = AtomicU32::new(0);
    static POST_CALLS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn task_switch_hooks_bracket_every_switch() {
        let hooks = Hooks {
            pre_task: Some(|_| {
                PRE_CALLS.fetch_add(1, Ordering::SeqCst);
            }),
            post_task: Some(|_| {
                POST_CALLS.fetch_add(1, Ordering::SeqCst);
            }),
            ..Hooks::default()
        };
        let cfg =
            config_tasks_timed(vec![task(5, 0), task(7, 0)], hooks).0;
        let mut k = kernel(cfg);

        k.activate_task(TaskId(0)).unwrap();
        k.activate_task(TaskId(1)).unwrap();
        k.terminate_task().unwrap();
        k.terminate_task().unwrap();

        // in, in again after preemption, back, and out: three switch-ins
        // for task 0/1/0 and three switch-outs.
        assert_eq!(PRE_CALLS.load(Ordering::SeqCst), 3);
        assert_eq!(POST_CALLS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn down_core_still_answers_queued_requests() {
        let cfg = config_two_cores();
        let shared = Box::leak(Box::new(Shared::new()));
        let mut k0 = CoreState::new(cfg, shared, CoreId(0));
        let mut k1 = CoreState::new(cfg, shared, CoreId(1));
        k1.shutdown_core();

        // A reply-carrying request that was already in flight when the
        // core went down must not leave the sender's slot unfilled.
        let slot = k0.results.allocate().unwrap();
        shared.bus.send(
            CoreId(1),
            Message {
                op: MsgOp::GetTaskState as u8,
                origin: CoreId(0),
                reply_slot: slot,
                params: [1, 0, 0, 0],
            },
        );
        k1.receive();
        k0.receive();
        assert_eq!(
            k0.results.take(slot),
            Some((ServiceError::CoreDown.code(), 0))
        );
    }
}
