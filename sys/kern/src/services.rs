// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The public service API.
//!
//! Every kernel service a task can call lives here as a method on
//! [`CoreState`]. Each one funnels through [`CoreState::service`], which
//! charges the caller's execution budget, runs the operation, applies the
//! scheduler hint and delivers any recoverable error to the error hook
//! before handing it back. Services on objects homed on another core are
//! forwarded over the message bus and block until the answer returns;
//! everything else runs against local state.
//!
//! Not every service has a cross-core form: the message vocabulary covers
//! the operations a foreign core can meaningfully request. Locks,
//! termination, waiting and application lifecycle are core-local, and a
//! remote object named in one of those comes back as `InvalidId`.

use abi::{
    AlarmId, AppId, CounterId, EventMask, LockId, MsgOp, ScheduleTableId,
    ScheduleTableState, ServiceError, ServiceId, TaskId, TaskState,
};

use crate::descs::TaskFlags;
use crate::err::UserError;
use crate::fail;
use crate::sched::CoreState;
use crate::task::NextTask;
use crate::time::Ticks;

fn check_index(i: usize, len: usize) -> Result<(), UserError> {
    if i < len {
        Ok(())
    } else {
        Err(ServiceError::InvalidId.into())
    }
}

impl CoreState {
    /// Common wrapper around one service call.
    fn service<T>(
        &mut self,
        sid: ServiceId,
        f: impl FnOnce(&mut Self) -> Result<(T, NextTask), UserError>,
    ) -> Result<T, ServiceError> {
        let r = self.budget_checkpoint().and_then(|()| f(self));
        match r {
            Ok((v, next)) => {
                self.apply(next);
                Ok(v)
            }
            Err(UserError::Recoverable(e, next)) => {
                self.apply(next);
                Err(self.report(sid, e))
            }
            Err(UserError::Protection(fault)) => {
                // The offender never sees a protection fault as a return
                // code; it is killed (or worse) per the hook's response.
                // The code below only reaches a hosted harness.
                self.protection_fault(fault);
                self.dispatch();
                Err(ServiceError::Access)
            }
        }
    }

    // Task services.

    pub fn activate_task(&mut self, t: TaskId) -> Result<(), ServiceError> {
        self.service(ServiceId::ActivateTask, |k| {
            check_index(t.index(), k.config().tasks.len())?;
            let dest = k.task_core(t);
            if dest == k.core() {
                k.activate_raw(t).map(|next| ((), next))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::ActivateTask,
                    [u32::from(t.0), 0, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    /// Ends the calling task's activation.
    pub fn terminate_task(&mut self) -> Result<(), ServiceError> {
        self.service(ServiceId::TerminateTask, |k| {
            k.terminate_raw().map(|next| ((), next))
        })
    }

    /// Ends the calling task's activation and activates `t` atomically: if
    /// `t` cannot accept an activation, the caller keeps running.
    pub fn chain_task(&mut self, t: TaskId) -> Result<(), ServiceError> {
        self.service(ServiceId::ChainTask, |k| {
            check_index(t.index(), k.config().tasks.len())?;
            let dest = k.task_core(t);
            if dest == k.core() {
                k.chain_raw(t).map(|next| ((), next))
            } else {
                // Remote successor: once the activation is committed over
                // there, the local termination must not be able to refuse.
                k.can_terminate()?;
                k.remote_call(
                    dest,
                    MsgOp::ActivateTask,
                    [u32::from(t.0), 0, 0, 0],
                )?;
                k.terminate_raw().map(|next| ((), next))
            }
        })
    }

    pub fn get_task_state(
        &mut self,
        t: TaskId,
    ) -> Result<TaskState, ServiceError> {
        self.service(ServiceId::GetTaskState, |k| {
            check_index(t.index(), k.config().tasks.len())?;
            let dest = k.task_core(t);
            if dest == k.core() {
                k.get_state_raw(t).map(|s| (s, NextTask::Same))
            } else {
                let code = k.remote_call(
                    dest,
                    MsgOp::GetTaskState,
                    [u32::from(t.0), 0, 0, 0],
                )?;
                match TaskState::from_code(code) {
                    Some(s) => Ok((s, NextTask::Same)),
                    None => fail::die(format_args!(
                        "bad task state {code} in cross-core reply"
                    )),
                }
            }
        })
    }

    // Event services.

    pub fn set_event(
        &mut self,
        t: TaskId,
        events: EventMask,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::SetEvent, |k| {
            check_index(t.index(), k.config().tasks.len())?;
            let dest = k.task_core(t);
            if dest == k.core() {
                k.set_event_raw(t, events).map(|next| ((), next))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::SetEvent,
                    [u32::from(t.0), events.0, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    /// Clears events of the calling task.
    pub fn clear_event(
        &mut self,
        events: EventMask,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::ClearEvent, |k| {
            k.clear_event_raw(events).map(|()| ((), NextTask::Same))
        })
    }

    pub fn get_event(
        &mut self,
        t: TaskId,
    ) -> Result<EventMask, ServiceError> {
        self.service(ServiceId::GetEvent, |k| {
            check_index(t.index(), k.config().tasks.len())?;
            if k.task_core(t) != k.core() {
                return Err(ServiceError::InvalidId.into());
            }
            k.get_event_raw(t).map(|e| (e, NextTask::Same))
        })
    }

    /// Blocks the calling task until one of `events` is posted to it.
    pub fn wait_event(
        &mut self,
        events: EventMask,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::WaitEvent, |k| {
            k.wait_event_raw(events).map(|next| ((), next))
        })
    }

    // Counter and alarm services.

    pub fn increment_counter(
        &mut self,
        c: CounterId,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::IncrementCounter, |k| {
            check_index(c.index(), k.config().counters.len())?;
            let dest = k.counter_core(c);
            if dest == k.core() {
                k.increment_raw(c).map(|next| ((), next))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::AdvanceCounter,
                    [u32::from(c.0), 1, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    pub fn get_counter_value(
        &mut self,
        c: CounterId,
    ) -> Result<Ticks, ServiceError> {
        self.service(ServiceId::GetCounterValue, |k| {
            check_index(c.index(), k.config().counters.len())?;
            let dest = k.counter_core(c);
            if dest == k.core() {
                k.get_count_raw(c).map(|v| (v, NextTask::Same))
            } else {
                let v = k.remote_call(
                    dest,
                    MsgOp::GetCount,
                    [u32::from(c.0), 0, 0, 0],
                )?;
                Ok((v, NextTask::Same))
            }
        })
    }

    pub fn set_rel_alarm(
        &mut self,
        a: AlarmId,
        increment: Ticks,
        cycle: Ticks,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::SetRelAlarm, |k| {
            check_index(a.index(), k.config().alarms.len())?;
            let dest = k.alarm_core(a);
            if dest == k.core() {
                k.set_rel_raw(a, increment, cycle)
                    .map(|()| ((), NextTask::Same))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::SetRelAlarm,
                    [u32::from(a.0), increment, cycle, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    pub fn set_abs_alarm(
        &mut self,
        a: AlarmId,
        start: Ticks,
        cycle: Ticks,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::SetAbsAlarm, |k| {
            check_index(a.index(), k.config().alarms.len())?;
            let dest = k.alarm_core(a);
            if dest == k.core() {
                k.set_abs_raw(a, start, cycle)
                    .map(|()| ((), NextTask::Same))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::SetAbsAlarm,
                    [u32::from(a.0), start, cycle, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    pub fn cancel_alarm(&mut self, a: AlarmId) -> Result<(), ServiceError> {
        self.service(ServiceId::CancelAlarm, |k| {
            check_index(a.index(), k.config().alarms.len())?;
            let dest = k.alarm_core(a);
            if dest == k.core() {
                k.cancel_raw(a).map(|()| ((), NextTask::Same))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::CancelAlarm,
                    [u32::from(a.0), 0, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    /// Ticks left until `a` expires.
    pub fn get_alarm(&mut self, a: AlarmId) -> Result<Ticks, ServiceError> {
        self.service(ServiceId::GetAlarm, |k| {
            check_index(a.index(), k.config().alarms.len())?;
            let dest = k.alarm_core(a);
            if dest == k.core() {
                k.remaining_raw(a).map(|left| (left, NextTask::Same))
            } else {
                let left = k.remote_call(
                    dest,
                    MsgOp::GetAlarm,
                    [u32::from(a.0), 0, 0, 0],
                )?;
                Ok((left, NextTask::Same))
            }
        })
    }

    // Schedule table services.

    pub fn start_schedule_table_rel(
        &mut self,
        s: ScheduleTableId,
        offset: Ticks,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::StartScheduleTableRel, |k| {
            check_index(s.index(), k.config().tables.len())?;
            let dest = k.table_core(s);
            if dest == k.core() {
                k.table_start_rel_raw(s, offset)
                    .map(|()| ((), NextTask::Same))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::StartScheduleTableRel,
                    [u32::from(s.0), offset, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    pub fn start_schedule_table_abs(
        &mut self,
        s: ScheduleTableId,
        start: Ticks,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::StartScheduleTableAbs, |k| {
            check_index(s.index(), k.config().tables.len())?;
            let dest = k.table_core(s);
            if dest == k.core() {
                k.table_start_abs_raw(s, start)
                    .map(|()| ((), NextTask::Same))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::StartScheduleTableAbs,
                    [u32::from(s.0), start, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    /// Puts `s` into the waiting state until its first synchronization.
    /// Only meaningful locally; the synchronization provider runs on the
    /// table's core.
    pub fn start_schedule_table_synchron(
        &mut self,
        s: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::StartScheduleTableSynchron, |k| {
            check_index(s.index(), k.config().tables.len())?;
            if k.table_core(s) != k.core() {
                return Err(ServiceError::InvalidId.into());
            }
            k.table_start_synchron_raw(s).map(|()| ((), NextTask::Same))
        })
    }

    pub fn stop_schedule_table(
        &mut self,
        s: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::StopScheduleTable, |k| {
            check_index(s.index(), k.config().tables.len())?;
            let dest = k.table_core(s);
            if dest == k.core() {
                k.table_stop_raw(s).map(|()| ((), NextTask::Same))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::StopScheduleTable,
                    [u32::from(s.0), 0, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    /// Queues `next` to start when `s`'s current round sequence ends. Both
    /// tables must live on this core and share a counter.
    pub fn chain_schedule_table(
        &mut self,
        s: ScheduleTableId,
        next: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::ChainScheduleTable, |k| {
            check_index(s.index(), k.config().tables.len())?;
            check_index(next.index(), k.config().tables.len())?;
            if k.table_core(s) != k.core() {
                return Err(ServiceError::InvalidId.into());
            }
            k.table_chain_raw(s, next).map(|()| ((), NextTask::Same))
        })
    }

    pub fn sync_schedule_table(
        &mut self,
        s: ScheduleTableId,
        global: Ticks,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::SyncScheduleTable, |k| {
            check_index(s.index(), k.config().tables.len())?;
            let dest = k.table_core(s);
            if dest == k.core() {
                k.table_sync_raw(s, global).map(|()| ((), NextTask::Same))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::SyncScheduleTable,
                    [u32::from(s.0), global, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    pub fn set_schedule_table_async(
        &mut self,
        s: ScheduleTableId,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::SetScheduleTableAsync, |k| {
            check_index(s.index(), k.config().tables.len())?;
            let dest = k.table_core(s);
            if dest == k.core() {
                k.table_set_async_raw(s).map(|()| ((), NextTask::Same))
            } else {
                k.remote_call(
                    dest,
                    MsgOp::SetScheduleTableAsync,
                    [u32::from(s.0), 0, 0, 0],
                )?;
                Ok(((), NextTask::Same))
            }
        })
    }

    pub fn get_schedule_table_status(
        &mut self,
        s: ScheduleTableId,
    ) -> Result<(ScheduleTableState, bool), ServiceError> {
        self.service(ServiceId::GetScheduleTableStatus, |k| {
            check_index(s.index(), k.config().tables.len())?;
            let dest = k.table_core(s);
            if dest == k.core() {
                k.table_status_raw(s).map(|st| (st, NextTask::Same))
            } else {
                let v = k.remote_call(
                    dest,
                    MsgOp::GetScheduleTableStatus,
                    [u32::from(s.0), 0, 0, 0],
                )?;
                match ScheduleTableState::from_code(v & 0xFF) {
                    Some(state) => {
                        Ok(((state, v & 0x100 != 0), NextTask::Same))
                    }
                    None => fail::die(format_args!(
                        "bad table state {v} in cross-core reply"
                    )),
                }
            }
        })
    }

    // Lock services. Core-local by construction.

    pub fn get_lock(&mut self, l: LockId) -> Result<(), ServiceError> {
        self.service(ServiceId::GetLock, |k| {
            k.get_lock_raw(l).map(|next| ((), next))
        })
    }

    pub fn release_lock(&mut self, l: LockId) -> Result<(), ServiceError> {
        self.service(ServiceId::ReleaseLock, |k| {
            k.release_lock_raw(l).map(|next| ((), next))
        })
    }

    // Application lifecycle.

    /// Kills `app`, optionally restarting it. Objects of a killed
    /// application refuse service until [`Self::allow_access`].
    pub fn terminate_application(
        &mut self,
        app: AppId,
        restart: bool,
    ) -> Result<(), ServiceError> {
        self.service(ServiceId::TerminateApplication, |k| {
            check_index(app.index(), k.config().apps.len())?;
            if k.config().apps[app.index()].core != k.core() {
                return Err(ServiceError::InvalidId.into());
            }
            k.terminate_app_raw(app, restart).map(|next| ((), next))
        })
    }

    /// Finishes a restart: the application's objects become usable again.
    pub fn allow_access(&mut self, app: AppId) -> Result<(), ServiceError> {
        self.service(ServiceId::AllowAccess, |k| {
            check_index(app.index(), k.config().apps.len())?;
            if k.config().apps[app.index()].core != k.core() {
                return Err(ServiceError::InvalidId.into());
            }
            k.allow_access_raw(app).map(|()| ((), NextTask::Same))
        })
    }

    // Diagnostics. These are queries for tooling and calibration; they
    // bypass the service funnel and never touch the error hook.

    /// Longest observed execution time of one activation of `t`, in
    /// execution-timer ticks. Requires the task to be configured for
    /// measurement.
    pub fn max_runtime(&self, t: TaskId) -> Result<u32, ServiceError> {
        if t.index() >= self.config().tasks.len()
            || self.task_core(t) != self.core()
        {
            return Err(ServiceError::InvalidId);
        }
        if !self.config().tasks[t.index()]
            .flags
            .contains(TaskFlags::MEASURE_EXEC)
        {
            return Err(ServiceError::Access);
        }
        Ok(self.task_ref(t).exec.max_observed())
    }

    /// Unused stack words of `t`, from the high-water mark reported by the
    /// context-switch layer.
    pub fn stack_headroom(&self, t: TaskId) -> Result<u32, ServiceError> {
        if t.index() >= self.config().tasks.len()
            || self.task_core(t) != self.core()
        {
            return Err(ServiceError::InvalidId);
        }
        Ok(self.task_ref(t).stack_headroom())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use abi::{CoreId, NONE_INDEX};

    use crate::fail::die_test_guard;
    use crate::sched::CoreState;
    use crate::startup::Shared;
    use crate::test_support::*;
    use crate::xcore::Message;

    fn shared() -> &'static Shared {
        Box::leak(Box::new(Shared::new()))
    }

    /// Runs `core` as a peer: drain requests until it is told to shut
    /// down, then hand the state back for inspection.
    fn spawn_peer(
        mut core: CoreState,
    ) -> thread::JoinHandle<CoreState> {
        thread::spawn(move || loop {
            core.receive();
            if core.is_shutting_down() {
                return core;
            }
            std::hint::spin_loop();
        })
    }

    #[test]
    fn services_route_across_cores() {
        let cfg = config_two_cores();
        let s = shared();
        let mut k0 = CoreState::new(cfg, s, CoreId(0));
        let peer = spawn_peer(CoreState::new(cfg, s, CoreId(1)));

        // Alarm 1 hangs off core 1's counter; when it expires over there
        // it activates task 1, and all of it is visible from core 0.
        k0.set_rel_alarm(AlarmId(1), 25, 0).unwrap();
        assert_eq!(k0.get_alarm(AlarmId(1)), Ok(25));
        for _ in 0..25 {
            k0.increment_counter(CounterId(1)).unwrap();
        }
        assert_eq!(k0.get_alarm(AlarmId(1)), Err(ServiceError::NotInUse));
        assert_eq!(k0.get_counter_value(CounterId(1)), Ok(25));
        assert_eq!(
            k0.get_task_state(TaskId(1)).unwrap(),
            TaskState::Running
        );

        // Its activation limit is enforced remotely and the error code
        // comes back intact.
        k0.activate_task(TaskId(1)).unwrap();
        assert_eq!(k0.activate_task(TaskId(1)), Err(ServiceError::Limit));

        // Preemption happens on the owning core.
        k0.activate_task(TaskId(2)).unwrap();
        assert_eq!(
            k0.get_task_state(TaskId(2)).unwrap(),
            TaskState::Running
        );
        assert_eq!(
            k0.get_task_state(TaskId(1)).unwrap(),
            TaskState::Ready
        );

        k0.shutdown_all();
        let k1 = peer.join().unwrap();
        assert!(k1.is_shutting_down());

        // A down core refuses further requests without blocking.
        assert_eq!(
            k0.activate_task(TaskId(1)),
            Err(ServiceError::CoreDown)
        );
    }

    #[test]
    fn remote_objects_are_refused_for_local_only_services() {
        let cfg = config_two_cores();
        let s = shared();
        let mut k0 = CoreState::new(cfg, s, CoreId(0));
        // No peer is needed; these fail before anything is sent.
        assert_eq!(
            k0.get_event(TaskId(1)),
            Err(ServiceError::InvalidId)
        );
        assert_eq!(
            k0.stack_headroom(TaskId(1)),
            Err(ServiceError::InvalidId)
        );
    }

    #[test]
    #[should_panic(expected = "kernel died: request for a core that is down")]
    fn forgotten_request_for_a_down_core_is_fatal() {
        let _guard = die_test_guard();
        let cfg = config_two_cores();
        let s = shared();
        let mut k1 = CoreState::new(cfg, s, CoreId(1));
        k1.shutdown_core();
        // A fire-and-forget request (other than shutdown) racing a core's
        // death has lost its caller; that is a kernel bug.
        s.bus.send(
            CoreId(1),
            Message {
                op: MsgOp::ActivateTask as u8,
                origin: CoreId(0),
                reply_slot: NONE_INDEX,
                params: [1, 0, 0, 0],
            },
        );
        k1.receive();
    }
}
