// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the unit tests: descriptor builders, leaked static
//! configurations, and fake timers. Everything here leaks deliberately;
//! descriptors are `&'static` in real images too.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use abi::{
    AlarmId, AppId, CoreId, CounterId, EventMask, Priority, TaskId,
};

use crate::counter::HwTimer;
use crate::descs::{
    AlarmAction, AlarmDesc, AppDesc, AutoAlarm, CounterDesc, ExpiryPoint,
    Hooks, KernelConfig, ScheduleTableDesc, StartMethod, StartModeDesc,
    TableFlags, TaskDesc, TaskFlags,
};
use crate::time::Ticks;
use crate::timing::ExecTimer;

pub(crate) fn task(prio: u8, core: u8) -> TaskDesc {
    TaskDesc {
        priority: Priority(prio),
        flags: TaskFlags::empty(),
        app: AppId(0),
        core: CoreId(core),
        max_activations: 1,
        exec_budget: 0,
        stack_words: 256,
    }
}

pub(crate) fn task_with_prio(prio: u8) -> &'static TaskDesc {
    Box::leak(Box::new(task(prio, 0)))
}

pub(crate) fn task_with_activations(
    prio: u8,
    max: u8,
) -> &'static TaskDesc {
    let mut t = task(prio, 0);
    t.max_activations = max;
    Box::leak(Box::new(t))
}

pub(crate) fn extended_task(prio: u8) -> &'static TaskDesc {
    let mut t = task(prio, 0);
    t.flags = TaskFlags::EXTENDED;
    Box::leak(Box::new(t))
}

pub(crate) fn sw_counter(max: Ticks) -> CounterDesc {
    CounterDesc {
        max_allowed_value: max,
        ticks_per_base: 1,
        min_cycle: 2,
        hw: None,
        core: CoreId(0),
        app: AppId(0),
    }
}

/// Settable stand-in for the free-running execution timer.
#[derive(Default)]
pub(crate) struct TestTimer(AtomicU64);

impl TestTimer {
    #[allow(dead_code)]
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }
}

impl ExecTimer for TestTimer {
    fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Scriptable hardware counter timer: tests set the raw value and observe
/// what delta got armed.
pub(crate) struct FakeTimer {
    raw: AtomicU32,
    armed: AtomicU32,
    mask: Ticks,
    max_delta: Ticks,
    def_delta: Ticks,
}

impl FakeTimer {
    pub fn new(mask: Ticks, max_delta: Ticks, def_delta: Ticks) -> Self {
        FakeTimer {
            raw: AtomicU32::new(0),
            armed: AtomicU32::new(u32::MAX),
            mask,
            max_delta,
            def_delta,
        }
    }

    pub fn set(&self, raw: Ticks) {
        self.raw.store(raw, Ordering::Relaxed);
    }

    pub fn armed(&self) -> Option<Ticks> {
        match self.armed.load(Ordering::Relaxed) {
            u32::MAX => None,
            d => Some(d),
        }
    }
}

impl HwTimer for FakeTimer {
    fn current(&self) -> Ticks {
        self.raw.load(Ordering::Relaxed)
    }

    fn mask(&self) -> Ticks {
        self.mask
    }

    fn max_delta(&self) -> Ticks {
        self.max_delta
    }

    fn def_delta(&self) -> Ticks {
        self.def_delta
    }

    fn arm(&self, delta: Ticks) {
        self.armed.store(delta, Ordering::Relaxed);
    }
}

fn leak_config(cfg: KernelConfig) -> &'static KernelConfig {
    let cfg = Box::leak(Box::new(cfg));
    assert_eq!(cfg.find_defect(), None);
    cfg
}

/// One software counter with `n` alarms that activate task 0.
pub(crate) fn config_with_alarms(
    max: Ticks,
    n: usize,
) -> &'static KernelConfig {
    let alarms: Vec<AlarmDesc> = (0..n)
        .map(|_| AlarmDesc {
            counter: CounterId(0),
            action: AlarmAction::ActivateTask(TaskId(0)),
            app: AppId(0),
        })
        .collect();
    leak_config(KernelConfig {
        tasks: Box::leak(Box::new([task(5, 0)])),
        counters: Box::leak(Box::new([sw_counter(max)])),
        alarms: alarms.leak(),
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
    })
}

/// One hardware-backed counter spanning `timer`'s range, with one alarm.
pub(crate) fn config_with_hw_counter(
    timer: &'static FakeTimer,
) -> &'static KernelConfig {
    let mut counter = sw_counter(timer.mask);
    counter.hw = Some(timer);
    leak_config(KernelConfig {
        tasks: Box::leak(Box::new([task(5, 0)])),
        counters: Box::leak(Box::new([counter])),
        alarms: Box::leak(Box::new([AlarmDesc {
            counter: CounterId(0),
            action: AlarmAction::ActivateTask(TaskId(0)),
            app: AppId(0),
        }])),
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
    })
}

fn point(offset: Ticks, inc: Ticks, dec: Ticks, task: u16) -> ExpiryPoint {
    ExpiryPoint {
        offset,
        max_increase: inc,
        max_decrease: dec,
        task: TaskId(task),
        event: EventMask::EMPTY,
    }
}

/// Three schedule tables on one software counter:
/// 0 -- two points (10, 30), period 100, repeating;
/// 1 -- one point (10), period 50, one-shot;
/// 2 -- one point (10) with adjustment bounds 4/5, period 100, repeating
///     and syncable with precision 1.
pub(crate) fn table_fixture() -> &'static KernelConfig {
    let alarm = |t: u16| AlarmDesc {
        counter: CounterId(0),
        action: AlarmAction::RunScheduleTable(abi::ScheduleTableId(t)),
        app: AppId(0),
    };
    leak_config(KernelConfig {
        tasks: Box::leak(Box::new([task(5, 0), task(6, 0)])),
        counters: Box::leak(Box::new([sw_counter(0xFFFF)])),
        alarms: Box::leak(Box::new([alarm(0), alarm(1), alarm(2)])),
        tables: Box::leak(Box::new([
            ScheduleTableDesc {
                points: Box::leak(Box::new([
                    point(10, 0, 0, 0),
                    point(30, 0, 0, 1),
                ])),
                period: 100,
                flags: TableFlags::REPEATING,
                precision: 0,
                alarm: AlarmId(0),
                app: AppId(0),
            },
            ScheduleTableDesc {
                points: Box::leak(Box::new([point(10, 0, 0, 0)])),
                period: 50,
                flags: TableFlags::empty(),
                precision: 0,
                alarm: AlarmId(1),
                app: AppId(0),
            },
            ScheduleTableDesc {
                points: Box::leak(Box::new([point(10, 4, 5, 0)])),
                period: 100,
                flags: TableFlags::REPEATING.union(TableFlags::SYNCABLE),
                precision: 1,
                alarm: AlarmId(2),
                app: AppId(0),
            },
        ])),
        locks: &[],
        apps: Box::leak(Box::new([AppDesc {
            restart_task: None,
            core: CoreId(0),
        }])),
        start_modes: &[],
        hooks: Hooks::default(),
        exec_timer: Box::leak(Box::new(TestTimer::default())),
        num_cores: 1,
    })
}

/// One task, one software counter, one alarm; application mode 0
/// auto-starts the task and arms the alarm at 10 every 10.
pub(crate) fn config_with_start_mode() -> &'static KernelConfig {
    leak_config(KernelConfig {
        tasks: Box::leak(Box::new([task(5, 0)])),
        counters: Box::leak(Box::new([sw_counter(0xFFFF)])),
        alarms: Box::leak(Box::new([AlarmDesc {
            counter: CounterId(0),
            action: AlarmAction::ActivateTask(TaskId(0)),
            app: AppId(0),
        }])),
        tables: &[],
        locks: &[],
        apps: Box::leak(Box::new([AppDesc {
            restart_task: None,
            core: CoreId(0),
        }])),
        start_modes: Box::leak(Box::new([StartModeDesc {
            tasks: Box::leak(Box::new([TaskId(0)])),
            alarms: Box::leak(Box::new([AutoAlarm {
                alarm: AlarmId(0),
                method: StartMethod::Relative,
                offset: 10,
                cycle: 10,
            }])),
            tables: &[],
        }])),
        hooks: Hooks::default(),
        exec_timer: Box::leak(Box::new(TestTimer::default())),
        num_cores: 1,
    })
}

/// Single-core config from explicit task descriptors, returning the timer
/// handle so tests can move execution time.
pub(crate) fn config_tasks_timed(
    tasks: Vec<TaskDesc>,
    hooks: Hooks,
) -> (&'static KernelConfig, &'static TestTimer) {
    let timer = Box::leak(Box::new(TestTimer::default()));
    let cfg = leak_config(KernelConfig {
        tasks: tasks.leak(),
        counters: &[],
        alarms: &[],
        tables: &[],
        locks: &[],
        apps: Box::leak(Box::new([AppDesc {
            restart_task: None,
            core: CoreId(0),
        }])),
        start_modes: &[],
        hooks,
        exec_timer: timer,
        num_cores: 1,
    });
    (cfg, timer)
}

/// Single-core config with one basic task per entry of `prios`.
pub(crate) fn config_tasks(prios: &[u8]) -> &'static KernelConfig {
    config_tasks_timed(
        prios.iter().map(|&p| task(p, 0)).collect(),
        Hooks::default(),
    )
    .0
}

/// Two cores: task 0 on core 0; tasks 1 (basic, limit 2) and 2 (higher
/// priority) on core 1, with a software counter and an alarm for each core.
pub(crate) fn config_two_cores() -> &'static KernelConfig {
    let mut t1 = task(5, 1);
    t1.app = AppId(1);
    t1.max_activations = 2;
    let mut t2 = task(7, 1);
    t2.app = AppId(1);
    let mut c1 = sw_counter(0xFFFF);
    c1.core = CoreId(1);
    c1.app = AppId(1);
    leak_config(KernelConfig {
        tasks: Box::leak(Box::new([task(5, 0), t1, t2])),
        counters: Box::leak(Box::new([sw_counter(0xFFFF), c1])),
        alarms: Box::leak(Box::new([
            AlarmDesc {
                counter: CounterId(0),
                action: AlarmAction::ActivateTask(TaskId(0)),
                app: AppId(0),
            },
            AlarmDesc {
                counter: CounterId(1),
                action: AlarmAction::ActivateTask(TaskId(1)),
                app: AppId(1),
            },
        ])),
        tables: &[],
        locks: &[],
        apps: Box::leak(Box::new([
            AppDesc {
                restart_task: None,
                core: CoreId(0),
            },
            AppDesc {
                restart_task: None,
                core: CoreId(1),
            },
        ])),
        start_modes: &[],
        hooks: Hooks::default(),
        exec_timer: Box::leak(Box::new(TestTimer::default())),
        num_cores: 2,
    })
}

/// One application with a restart task: task 0 is the worker, task 1 the
/// restart task, and one alarm periodically activates the worker.
pub(crate) fn config_with_restart() -> &'static KernelConfig {
    leak_config(KernelConfig {
        tasks: Box::leak(Box::new([task(5, 0), task(9, 0)])),
        counters: Box::leak(Box::new([sw_counter(0xFFFF)])),
        alarms: Box::leak(Box::new([AlarmDesc {
            counter: CounterId(0),
            action: AlarmAction::ActivateTask(TaskId(0)),
            app: AppId(0),
        }])),
        tables: &[],
        locks: &[],
        apps: Box::leak(Box::new([AppDesc {
            restart_task: Some(TaskId(1)),
            core: CoreId(0),
        }])),
        start_modes: &[],
        hooks: Hooks::default(),
        exec_timer: Box::leak(Box::new(TestTimer::default())),
        num_cores: 1,
    })
}
