// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor types, used to statically define application resources.
//!
//! Everything here is produced by the (out-of-scope) offline configuration
//! step and consumed immutably at boot. Descriptors carry the constant half
//! of every kernel object; the variable halves live in the per-core arenas
//! (`task::Task`, `counter::CounterDyn`, and friends) and reference their
//! descriptors by the same small index.

use abi::{
    AlarmId, AppId, CoreId, CounterId, EventMask, Priority, ScheduleTableId,
    TaskId,
};
use static_assertions::const_assert;

use crate::counter::HwTimer;
use crate::err::ErrorHook;
use crate::time::Ticks;
use crate::timing::ExecTimer;

/// Upper bounds for the per-core arenas. The generated configuration may use
/// fewer objects; it may not use more (checked at boot).
pub const MAX_TASKS: usize = 32;
pub const MAX_COUNTERS: usize = 8;
pub const MAX_ALARMS: usize = 16;
pub const MAX_TABLES: usize = 8;
pub const MAX_APPS: usize = 8;
pub const MAX_CORES: usize = 4;

/// Number of distinct task priorities. Priorities are split into groups of
/// 32 for the two-level ready-queue bitmap.
pub const NUM_PRIORITIES: usize = 64;
pub const PRIO_GROUPS: usize = NUM_PRIORITIES.div_ceil(32);

// The master bitmap word covers at most 32 slave words.
const_assert!(PRIO_GROUPS <= 32);
const_assert!(MAX_TASKS < abi::NONE_INDEX as usize);

/// Number of locks that map directly onto hardware lock primitives. Lock 0
/// is reserved as the guard for the software-lock tier and is not available
/// for general assignment.
pub const HW_LOCKS: usize = 4;
/// Number of software locks multiplexed over hardware lock 0.
pub const SW_LOCKS: usize = 12;
pub const NUM_LOCKS: usize = HW_LOCKS + SW_LOCKS;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct TaskFlags: u8 {
        /// Extended task: may wait for events. Extended tasks cannot have
        /// multiple activations.
        const EXTENDED = 1 << 0;
        /// Record the longest observed execution time for the diagnostic
        /// API.
        const MEASURE_EXEC = 1 << 1;
    }
}

/// Record describing a single task.
#[derive(Clone, Debug)]
pub struct TaskDesc {
    /// Priority class the task starts each activation at. The dynamic
    /// priority may be raised above this while the task occupies a
    /// priority-ceiling lock.
    pub priority: Priority,
    /// Collection of boolean flags controlling task behavior.
    pub flags: TaskFlags,
    /// Application that owns this task.
    pub app: AppId,
    /// Core the task is bound to. Tasks never migrate.
    pub core: CoreId,
    /// Maximum number of queued activations, including the running one.
    /// Must be at least 1; must be exactly 1 for extended tasks.
    pub max_activations: u8,
    /// Execution-time budget per activation, in execution-timer ticks.
    /// 0 means unbudgeted.
    pub exec_budget: u32,
    /// Size of the task's stack region in words, for headroom diagnostics.
    pub stack_words: u32,
}

/// Record describing a single counter.
pub struct CounterDesc {
    /// Largest tick value the counter reaches before wrapping to zero
    /// (inclusive).
    pub max_allowed_value: Ticks,
    /// Ticks per counter-specific base unit; informational, handed back by
    /// the query API.
    pub ticks_per_base: Ticks,
    /// Minimum cycle for periodic alarms bound to this counter.
    pub min_cycle: Ticks,
    /// Backing hardware timer. `None` for software counters, which advance
    /// only when told to.
    pub hw: Option<&'static dyn HwTimer>,
    /// Core whose arenas hold this counter's dynamic state.
    pub core: CoreId,
    pub app: AppId,
}

/// Callback type for [`AlarmAction::Callback`].
pub type AlarmCallback = fn();

/// What an alarm does when it expires.
#[derive(Copy, Clone, Debug)]
pub enum AlarmAction {
    /// Queue an activation of the task.
    ActivateTask(TaskId),
    /// Set events for an extended task.
    SetEvent(TaskId, EventMask),
    /// Advance another (software) counter by one tick.
    IncrementCounter(CounterId),
    /// Invoke an application-supplied callback.
    Callback(AlarmCallback),
    /// Drive a schedule table to its next expiry point. Generated only for
    /// the alarm embedded in a schedule table, never user-assigned.
    RunScheduleTable(ScheduleTableId),
}

/// Record describing a single alarm.
pub struct AlarmDesc {
    /// Counter this alarm hangs off. The alarm lives on the same core as
    /// its counter.
    pub counter: CounterId,
    pub action: AlarmAction,
    pub app: AppId,
}

/// One expiry point of a schedule table.
///
/// `offset` counts from the start of the table's round; points are stored in
/// strictly increasing offset order. `max_increase`/`max_decrease` bound how
/// much synchronization may stretch or shrink the delay *to* this point in
/// one round.
#[derive(Copy, Clone, Debug)]
pub struct ExpiryPoint {
    pub offset: Ticks,
    pub max_increase: Ticks,
    pub max_decrease: Ticks,
    pub task: TaskId,
    /// Events to set for `task`; `EventMask::EMPTY` means activate instead.
    pub event: EventMask,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct TableFlags: u8 {
        /// Table wraps around and runs the next round when the last point
        /// has fired.
        const REPEATING = 1 << 0;
        /// Table may be explicitly synchronized to a global time.
        const SYNCABLE = 1 << 1;
        /// Table is implicitly synchronous (its counter *is* global time).
        const IMPLICIT = 1 << 2;
    }
}

/// Record describing a single schedule table.
pub struct ScheduleTableDesc {
    pub points: &'static [ExpiryPoint],
    /// Length of one round in counter ticks. Must be greater than the last
    /// point's offset.
    pub period: Ticks,
    pub flags: TableFlags,
    /// If the table's deviation from global time is within this bound it
    /// counts as synchronous.
    pub precision: Ticks,
    /// The alarm this table is realized on. That alarm's action must name
    /// this table back.
    pub alarm: AlarmId,
    pub app: AppId,
}

/// Record describing one lock, for the user-facing acquire/release service.
///
/// Which tier realizes the lock (direct hardware lock or multiplexed
/// software lock) is decided by its index, not by the descriptor.
#[derive(Copy, Clone, Debug)]
pub struct LockDesc {
    /// Priority ceiling: the occupying task runs at least this important
    /// until it releases the lock. Must not be below the priority of any
    /// configured user.
    pub ceiling: Priority,
    /// Maximum hold time in execution-timer ticks. 0 disables enforcement.
    pub hold_budget: u32,
    pub app: AppId,
}

/// Record describing an OS application.
pub struct AppDesc {
    /// Task activated after the application is killed with the restart
    /// option.
    pub restart_task: Option<TaskId>,
    pub core: CoreId,
}

/// How an auto-started alarm is armed at StartOS.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StartMethod {
    Relative,
    Absolute,
}

#[derive(Copy, Clone, Debug)]
pub struct AutoAlarm {
    pub alarm: AlarmId,
    pub method: StartMethod,
    pub offset: Ticks,
    pub cycle: Ticks,
}

/// How an auto-started schedule table is started at StartOS.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableStartMethod {
    Relative,
    Absolute,
    Synchron,
}

#[derive(Copy, Clone, Debug)]
pub struct AutoTable {
    pub table: ScheduleTableId,
    pub method: TableStartMethod,
    pub offset: Ticks,
}

/// Objects started automatically by StartOS in one application mode.
pub struct StartModeDesc {
    pub tasks: &'static [TaskId],
    pub alarms: &'static [AutoAlarm],
    pub tables: &'static [AutoTable],
}

/// Application-supplied protection hook: receives the fault and answers with
/// the blast radius.
pub type ProtectionHook = fn(abi::ProtectionFault) -> abi::ProtectionResponse;

/// The application-supplied hook functions. All optional; a missing
/// protection hook defaults to killing the offending task.
#[derive(Copy, Clone, Default)]
pub struct Hooks {
    pub error: Option<ErrorHook>,
    pub protection: Option<ProtectionHook>,
    pub startup: Option<fn()>,
    pub shutdown: Option<fn()>,
    /// Runs after a task is switched in, before it executes.
    pub pre_task: Option<fn(TaskId)>,
    /// Runs after a task is switched out.
    pub post_task: Option<fn(TaskId)>,
}

/// The complete generated configuration, one per image, shared by all cores.
pub struct KernelConfig {
    pub tasks: &'static [TaskDesc],
    pub counters: &'static [CounterDesc],
    pub alarms: &'static [AlarmDesc],
    pub tables: &'static [ScheduleTableDesc],
    pub locks: &'static [LockDesc],
    pub apps: &'static [AppDesc],
    /// Indexed by application mode passed to StartOS.
    pub start_modes: &'static [StartModeDesc],
    pub hooks: Hooks,
    /// Free-running monotonic timer used for execution budgets and CPU-load
    /// measurement.
    pub exec_timer: &'static dyn ExecTimer,
    pub num_cores: u8,
}

impl KernelConfig {
    /// Checks the configuration tables for internal consistency, escalating
    /// any defect to the panic path. The tables are generated and validated
    /// offline; a defect observed here means the image is corrupt.
    pub fn validate(&self) {
        if let Some(defect) = self.find_defect() {
            crate::fail::die(format_args!("bad config: {defect}"));
        }
    }

    /// The actual checks behind [`Self::validate`], separated so tests can
    /// inspect the defect without dying.
    pub(crate) fn find_defect(&self) -> Option<&'static str> {
        if self.num_cores == 0 || usize::from(self.num_cores) > MAX_CORES {
            return Some("core count out of range");
        }
        if self.tasks.len() > MAX_TASKS
            || self.counters.len() > MAX_COUNTERS
            || self.alarms.len() > MAX_ALARMS
            || self.tables.len() > MAX_TABLES
            || self.apps.len() > MAX_APPS
        {
            return Some("object table exceeds arena bound");
        }

        for t in self.tasks {
            if t.priority.0 as usize >= NUM_PRIORITIES {
                return Some("task priority out of range");
            }
            if t.core.0 >= self.num_cores {
                return Some("task bound to missing core");
            }
            if t.app.index() >= self.apps.len() {
                return Some("task owned by missing application");
            }
            if t.core != self.apps[t.app.index()].core {
                return Some("task not on its application's core");
            }
            if t.max_activations == 0 {
                return Some("task activation limit of zero");
            }
            if t.flags.contains(TaskFlags::EXTENDED) && t.max_activations != 1
            {
                return Some("extended task with multiple activations");
            }
        }

        for c in self.counters {
            if c.max_allowed_value == 0 {
                return Some("counter wrap limit of zero");
            }
            // One spare value keeps a full revolution (max + 1 ticks)
            // representable.
            if c.max_allowed_value == Ticks::MAX {
                return Some("counter wrap limit too large");
            }
            if c.core.0 >= self.num_cores {
                return Some("counter bound to missing core");
            }
            if c.app.index() >= self.apps.len() {
                return Some("counter owned by missing application");
            }
            if c.core != self.apps[c.app.index()].core {
                return Some("counter not on its application's core");
            }
            if let Some(hw) = c.hw {
                // Elapsed hardware time must be expressible as a single
                // wrapped increment of the counter.
                if hw.mask() > c.max_allowed_value {
                    return Some("hardware timer outranges its counter");
                }
            }
        }

        for a in self.alarms {
            if a.counter.index() >= self.counters.len() {
                return Some("alarm bound to missing counter");
            }
            match a.action {
                AlarmAction::ActivateTask(t)
                | AlarmAction::SetEvent(t, _) => {
                    if t.index() >= self.tasks.len() {
                        return Some("alarm action names missing task");
                    }
                    // Expiry actions run on the counter's core and never
                    // take the cross-core path.
                    if self.tasks[t.index()].core
                        != self.counters[a.counter.index()].core
                    {
                        return Some("alarm action crosses cores");
                    }
                }
                AlarmAction::IncrementCounter(c) => {
                    if c.index() >= self.counters.len() {
                        return Some("alarm action names missing counter");
                    }
                }
                AlarmAction::RunScheduleTable(s) => {
                    if s.index() >= self.tables.len() {
                        return Some("alarm action names missing table");
                    }
                }
                AlarmAction::Callback(_) => (),
            }
        }

        if self.increment_chains_cycle() {
            return Some("increment-counter actions form a cycle");
        }

        for (i, s) in self.tables.iter().enumerate() {
            if s.alarm.index() >= self.alarms.len() {
                return Some("table realized on missing alarm");
            }
            match self.alarms[s.alarm.index()].action {
                AlarmAction::RunScheduleTable(back)
                    if back.index() == i => {}
                _ => return Some("table's alarm does not point back"),
            }
            if s.points.is_empty() {
                return Some("table with no expiry points");
            }
            let mut last = None;
            for p in s.points {
                if let Some(prev) = last {
                    if p.offset <= prev {
                        return Some("expiry points not strictly ordered");
                    }
                }
                if p.task.index() >= self.tasks.len() {
                    return Some("expiry point names missing task");
                }
                let counter = self.alarms[s.alarm.index()].counter;
                if self.tasks[p.task.index()].core
                    != self.counters[counter.index()].core
                {
                    return Some("expiry point crosses cores");
                }
                last = Some(p.offset);
            }
            if s.period <= s.points[s.points.len() - 1].offset {
                return Some("table period not past last expiry point");
            }
            let counter = self.alarms[s.alarm.index()].counter;
            if s.period > self.counters[counter.index()].max_allowed_value {
                return Some("table period exceeds counter range");
            }
        }

        if self.locks.len() > NUM_LOCKS {
            return Some("lock table exceeds lock count");
        }
        for l in self.locks {
            if l.ceiling.0 as usize >= NUM_PRIORITIES {
                return Some("lock ceiling out of range");
            }
        }

        for a in self.apps {
            if a.core.0 >= self.num_cores {
                return Some("application bound to missing core");
            }
            if let Some(t) = a.restart_task {
                if t.index() >= self.tasks.len() {
                    return Some("restart task missing");
                }
            }
        }

        for m in self.start_modes {
            if m.tasks.iter().any(|t| t.index() >= self.tasks.len())
                || m.alarms
                    .iter()
                    .any(|a| a.alarm.index() >= self.alarms.len())
                || m.tables
                    .iter()
                    .any(|t| t.table.index() >= self.tables.len())
            {
                return Some("start mode names missing object");
            }
        }

        None
    }

    /// Detects cycles among increment-counter alarm actions, which would
    /// otherwise let one counter advance recurse forever.
    fn increment_chains_cycle(&self) -> bool {
        // Follow every counter's worst-case increment fan-out; with at most
        // MAX_COUNTERS nodes, any path longer than the node count proves a
        // cycle.
        for start in 0..self.counters.len() {
            let mut frontier: u32 = 1 << start;
            for _ in 0..=self.counters.len() {
                let mut next: u32 = 0;
                for a in self.alarms {
                    if frontier & (1 << a.counter.index()) != 0 {
                        if let AlarmAction::IncrementCounter(c) = a.action {
                            if c.index() == start {
                                return true;
                            }
                            next |= 1 << c.index();
                        }
                    }
                }
                if next == 0 {
                    break;
                }
                frontier = next;
            }
        }
        false
    }

    /// Looks up the application mode table, dying on an out-of-range mode
    /// (the mode is agreed between cores before this is consulted).
    pub(crate) fn start_mode(&self, mode: u8) -> &StartModeDesc {
        match self.start_modes.get(usize::from(mode)) {
            Some(m) => m,
            None => crate::fail::die("start mode out of range"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sw_counter, task, TestTimer};

    fn base_config() -> KernelConfig {
        KernelConfig {
            tasks: Box::leak(Box::new([task(5, 0)])),
            counters: Box::leak(Box::new([sw_counter(999)])),
            alarms: &[],
            tables: &[],
            locks: &[],
            apps: Box::leak(Box::new([AppDesc {
                restart_task: None,
                core: CoreId(0),
            }])),
            start_modes: &[],
            hooks: Hooks::default(),
            exec_timer: Box::leak(Box::new(TestTimer::default())),
            num_cores: 1,
        }
    }

    #[test]
    fn valid_config_has_no_defect() {
        assert_eq!(base_config().find_defect(), None);
    }

    #[test]
    fn unordered_expiry_points_detected() {
        let mut cfg = base_config();
        cfg.alarms = Box::leak(Box::new([AlarmDesc {
            counter: CounterId(0),
            action: AlarmAction::RunScheduleTable(ScheduleTableId(0)),
            app: AppId(0),
        }]));
        cfg.tables = Box::leak(Box::new([ScheduleTableDesc {
            points: Box::leak(Box::new([
                ExpiryPoint {
                    offset: 10,
                    max_increase: 0,
                    max_decrease: 0,
                    task: TaskId(0),
                    event: EventMask::EMPTY,
                },
                ExpiryPoint {
                    offset: 10,
                    max_increase: 0,
                    max_decrease: 0,
                    task: TaskId(0),
                    event: EventMask::EMPTY,
                },
            ])),
            period: 100,
            flags: TableFlags::REPEATING,
            precision: 0,
            alarm: AlarmId(0),
            app: AppId(0),
        }]));
        assert_eq!(
            cfg.find_defect(),
            Some("expiry points not strictly ordered")
        );
    }

    #[test]
    fn increment_cycle_detected() {
        let mut cfg = base_config();
        cfg.counters =
            Box::leak(Box::new([sw_counter(999), sw_counter(999)]));
        cfg.alarms = Box::leak(Box::new([
            AlarmDesc {
                counter: CounterId(0),
                action: AlarmAction::IncrementCounter(CounterId(1)),
                app: AppId(0),
            },
            AlarmDesc {
                counter: CounterId(1),
                action: AlarmAction::IncrementCounter(CounterId(0)),
                app: AppId(0),
            },
        ]));
        assert_eq!(
            cfg.find_defect(),
            Some("increment-counter actions form a cycle")
        );
    }

    #[test]
    fn extended_task_multiple_activations_rejected() {
        let mut cfg = base_config();
        let mut t = task(5, 0);
        t.flags = TaskFlags::EXTENDED;
        t.max_activations = 2;
        cfg.tasks = Box::leak(Box::new([t]));
        assert_eq!(
            cfg.find_defect(),
            Some("extended task with multiple activations")
        );
    }
}
