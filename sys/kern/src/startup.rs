// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! Each core calls [`start_os`] with the one image-wide [`KernelConfig`], a
//! reference to the image-wide [`Shared`] block, its own core ID and the
//! requested application mode. The first core to arrive fixes the mode;
//! every later arrival must name the same one. After the configuration is
//! checked, the core runs the startup hook, arms its share of the
//! auto-started objects and dispatches its first task.

use core::sync::atomic::{AtomicU32, Ordering};

use abi::CoreId;

use crate::descs::{KernelConfig, StartMethod, TableStartMethod};
use crate::fail;
use crate::lock::LockTable;
use crate::sched::CoreState;
use crate::xcore::MessageBus;

/// Mode word value before any core has reached `start_os`.
const MODE_UNSET: u32 = u32::MAX;

/// State shared by all cores: the message bus, the raw lock table and the
/// agreed application mode. Lives in a `static` provided by the platform
/// layer.
pub struct Shared {
    pub bus: MessageBus,
    pub locks: LockTable,
    start_mode: AtomicU32,
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    pub const fn new() -> Self {
        Shared {
            bus: MessageBus::new(),
            locks: LockTable::new(),
            start_mode: AtomicU32::new(MODE_UNSET),
        }
    }

    /// The application mode agreed at startup, if any core has started.
    pub fn start_mode(&self) -> Option<u8> {
        match self.start_mode.load(Ordering::Acquire) {
            MODE_UNSET => None,
            m => Some(m as u8),
        }
    }
}

/// Brings the kernel up on the calling core and returns its scheduling
/// state with the first task dispatched.
///
/// The cores must agree on `mode`: the first caller publishes it and a
/// later caller naming a different mode is a configuration error the image
/// cannot recover from.
pub fn start_os(
    cfg: &'static KernelConfig,
    shared: &'static Shared,
    core: CoreId,
    mode: u8,
) -> CoreState {
    cfg.validate();

    match shared.start_mode.compare_exchange(
        MODE_UNSET,
        u32::from(mode),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => (),
        Err(agreed) if agreed == u32::from(mode) => (),
        Err(agreed) => fail::die(format_args!(
            "start mode disagreement: core {} wants {mode}, agreed {agreed}",
            core.0
        )),
    }

    let mut kernel = CoreState::new(cfg, shared, core);

    if let Some(hook) = cfg.hooks.startup {
        hook();
    }

    autostart(&mut kernel, mode);
    kernel.dispatch();
    kernel
}

/// Arms this core's share of the mode's auto-started objects. These come
/// straight out of the validated configuration, so a refusal here is an
/// internal inconsistency, not a caller error.
fn autostart(kernel: &mut CoreState, mode: u8) {
    let cfg = kernel.config();
    let core = kernel.core();
    let m = cfg.start_mode(mode);

    for &t in m.tasks {
        if kernel.task_core(t) != core {
            continue;
        }
        if kernel.activate_raw(t).is_err() {
            fail::die(format_args!("autostart of task {} refused", t.0));
        }
    }

    for a in m.alarms {
        if kernel.alarm_core(a.alarm) != core {
            continue;
        }
        let r = match a.method {
            StartMethod::Relative => {
                kernel.set_rel_raw(a.alarm, a.offset, a.cycle)
            }
            StartMethod::Absolute => {
                kernel.set_abs_raw(a.alarm, a.offset, a.cycle)
            }
        };
        if r.is_err() {
            fail::die(format_args!(
                "autostart of alarm {} refused",
                a.alarm.0
            ));
        }
    }

    for t in m.tables {
        if kernel.table_core(t.table) != core {
            continue;
        }
        let r = match t.method {
            TableStartMethod::Relative => {
                kernel.table_start_rel_raw(t.table, t.offset)
            }
            TableStartMethod::Absolute => {
                kernel.table_start_abs_raw(t.table, t.offset)
            }
            TableStartMethod::Synchron => {
                kernel.table_start_synchron_raw(t.table)
            }
        };
        if r.is_err() {
            fail::die(format_args!(
                "autostart of schedule table {} refused",
                t.table.0
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fail::die_test_guard;
    use crate::test_support::*;

    fn shared() -> &'static Shared {
        Box::leak(Box::new(Shared::new()))
    }

    #[test]
    fn first_core_fixes_the_mode() {
        let s = shared();
        assert_eq!(s.start_mode(), None);
        let cfg = config_with_start_mode();
        let k = start_os(cfg, s, abi::CoreId(0), 0);
        assert_eq!(s.start_mode(), Some(0));
        assert_eq!(k.current_task(), Some(abi::TaskId(0)));
    }

    #[test]
    #[should_panic(expected = "kernel died: start mode disagreement")]
    fn mode_disagreement_is_fatal() {
        let _guard = die_test_guard();
        let s = shared();
        let cfg = config_with_start_mode();
        let _k = start_os(cfg, s, abi::CoreId(0), 0);
        let _ = start_os(cfg, s, abi::CoreId(0), 1);
    }

    #[test]
    fn autostart_arms_alarms() {
        let s = shared();
        let cfg = config_with_start_mode();
        let mut k = start_os(cfg, s, abi::CoreId(0), 0);
        // Mode 0 arms alarm 0 at 10 every 10.
        assert_eq!(k.remaining_raw(abi::AlarmId(0)), Ok(10));
    }
}
