// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A statically configured, priority-driven kernel for small multi-core
//! systems.
//!
//! Every kernel object -- task, counter, alarm, schedule table, lock,
//! application -- is declared at build time in a [`descs::KernelConfig`]
//! and referenced by index at runtime; nothing is created or destroyed
//! after boot. Each core owns a [`sched::CoreState`] holding the dynamic
//! side of the objects homed on it, and cores talk to each other only
//! through the fixed-size message queues in [`xcore`].
//!
//! # Design principles
//!
//! 1. Static configuration. The system takes a single shape specified at
//!    compile time, and the configuration tables are checked once at boot.
//! 2. Caller errors are values. Services return `Result`; recoverable
//!    errors flow through one funnel to the error hook and back to the
//!    caller, budget overruns go to the protection hook, and internal
//!    inconsistencies end in [`fail::die`].
//! 3. A strong preference for safe code. The only `unsafe` in the portable
//!    kernel is the pair of aliasing arguments in the cross-core queues,
//!    each carrying its reasoning.

#![cfg_attr(not(test), no_std)]

pub mod app;
pub mod counter;
pub mod descs;
pub mod err;
pub mod fail;
pub mod load;
pub mod lock;
pub mod readyq;
pub mod sched;
pub mod schedtab;
pub mod services;
pub mod startup;
pub mod task;
pub mod time;
pub mod timing;
pub mod xcore;

#[cfg(test)]
mod test_support;
