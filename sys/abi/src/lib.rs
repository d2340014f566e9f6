// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and the generated
//! configuration tables.
//!
//! Everything in this crate is a plain value type: small integer object
//! identifiers, state enumerations, error codes and the cross-core message
//! vocabulary. Kernel objects themselves (tasks, counters, alarms, schedule
//! tables) are statically configured and referenced by index; nothing here
//! owns memory or requires allocation.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Sentinel index used to terminate intrusive index-linked lists (ready
/// queues, alarm delta queues, schedule table chains).
pub const NONE_INDEX: u16 = !0;

/// Names a task in the static task table of its core.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names a counter in the static counter table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CounterId(pub u16);

impl CounterId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names an alarm in the static alarm table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AlarmId(pub u16);

impl AlarmId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names a schedule table in the static schedule table table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ScheduleTableId(pub u16);

impl ScheduleTableId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names an OS application: a static group of tasks/counters/alarms sharing
/// permission and restart semantics.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AppId(pub u8);

impl AppId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names a logical core. Each core has its own ready queue, lock table and
/// inbound message queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CoreId(pub u8);

impl CoreId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names a kernel-internal lock. Low indices map directly onto hardware lock
/// primitives; the rest are software locks multiplexed over one reserved
/// hardware lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LockId(pub u16);

impl LockId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically *higher*
/// priorities are more important, so the biggest configured priority is the
/// most likely to be scheduled.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means more important or
/// less important. Use `is_more_important_than`.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// A set of events, as pended on or waited for by an extended task.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const EMPTY: Self = Self(0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Lifecycle state of a task.
///
/// `New` and `Suspended` are the only states in which no activation of the
/// task is queued anywhere. `Quarantined` is terminal until the owning
/// application is restarted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum TaskState {
    /// Configured but never activated since (re)start of its application.
    #[default]
    New,
    /// At least one activation queued; eligible for dispatch.
    Ready,
    /// Currently executing on its core.
    Running,
    /// Extended task blocked on an event mask.
    Waiting,
    /// Ran to completion; no activation queued.
    Suspended,
    /// Killed by a protection fault; not schedulable until the owning
    /// application restarts.
    Quarantined,
}

impl TaskState {
    /// Checks whether a task in this state has an activation queued on the
    /// ready structures. This is the complement of `New`/`Suspended`/
    /// `Quarantined`.
    pub fn has_queued_activation(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Waiting)
    }

    /// Numeric code as carried in a cross-core result slot.
    pub fn code(self) -> u32 {
        match self {
            Self::New => 0,
            Self::Ready => 1,
            Self::Running => 2,
            Self::Waiting => 3,
            Self::Suspended => 4,
            Self::Quarantined => 5,
        }
    }

    /// Decodes [`Self::code`]. Anything else on the wire is a kernel bug on
    /// the sending core.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::New,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Waiting,
            4 => Self::Suspended,
            5 => Self::Quarantined,
            _ => return None,
        })
    }
}

/// State of a schedule table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum ScheduleTableState {
    /// Not running; may be started.
    #[default]
    Stopped,
    /// Waiting for its start condition (synchronous start, or queued behind
    /// a predecessor in a chain).
    Waiting,
    /// Processing expiry points.
    Running,
    /// Killed by a protection fault; terminal until application restart.
    Quarantined,
}

impl ScheduleTableState {
    /// Numeric code as carried in a cross-core result slot.
    pub fn code(self) -> u32 {
        match self {
            Self::Stopped => 0,
            Self::Waiting => 1,
            Self::Running => 2,
            Self::Quarantined => 3,
        }
    }

    /// Decodes [`Self::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Stopped,
            1 => Self::Waiting,
            2 => Self::Running,
            3 => Self::Quarantined,
            _ => return None,
        })
    }
}

/// State of an OS application.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum AppState {
    /// Objects of this application may be used normally.
    #[default]
    Accessible,
    /// The application is being restarted; its objects are inaccessible.
    Restarting,
    /// The application was killed without restart.
    Quarantined,
}

/// Recoverable service error codes, reported through the error hook and
/// returned to the caller.
///
/// These follow the OSEK/AUTOSAR `E_OS_*` taxonomy: every variant describes
/// either a caller error (bad ID, wrong context) or a state error (object not
/// in a state that permits the request). Unrecoverable conditions are *not*
/// represented here; they travel as [`ProtectionFault`] or end in the kernel
/// panic path.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ServiceError {
    /// Object identifier out of range, or named object not on this core and
    /// not reachable.
    InvalidId = 1,
    /// Caller lacks permission for the object (foreign application).
    Access = 2,
    /// Service called from a forbidden context (e.g. task-only service from
    /// an ISR).
    CallLevel = 3,
    /// Activation/event limit exceeded (e.g. too many pending activations).
    Limit = 4,
    /// Object is idle / not in use (e.g. alarm query before it was set).
    NotInUse = 5,
    /// Task still occupies a resource or lock it must release first.
    Resource = 6,
    /// Object not in a state that allows the request (e.g. starting a
    /// schedule table that is not stopped).
    WrongState = 7,
    /// A tick/offset parameter is outside the counter's configured range.
    ValueOutOfRange = 8,
    /// The destination core has shut down; the request was answered with
    /// this code instead of being executed.
    CoreDown = 9,
    /// Service called while interrupts were disabled by the caller.
    InterruptsDisabled = 10,
    /// Waiting is not allowed here (basic task called a blocking service).
    NoWait = 11,
}

impl ServiceError {
    /// Numeric code as carried in a cross-core result slot.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// We're using an explicit `TryFrom` impl for `ServiceError` instead of a
/// derive because the kernel doesn't currently depend on `num-traits` and
/// this seems okay.
impl core::convert::TryFrom<u32> for ServiceError {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::InvalidId),
            2 => Ok(Self::Access),
            3 => Ok(Self::CallLevel),
            4 => Ok(Self::Limit),
            5 => Ok(Self::NotInUse),
            6 => Ok(Self::Resource),
            7 => Ok(Self::WrongState),
            8 => Ok(Self::ValueOutOfRange),
            9 => Ok(Self::CoreDown),
            10 => Ok(Self::InterruptsDisabled),
            11 => Ok(Self::NoWait),
            _ => Err(()),
        }
    }
}

/// Identifies the service in which an error was detected, for the error
/// hook's benefit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ServiceId {
    ActivateTask,
    ChainTask,
    TerminateTask,
    GetTaskState,
    SetEvent,
    ClearEvent,
    GetEvent,
    WaitEvent,
    IncrementCounter,
    GetCounterValue,
    SetRelAlarm,
    SetAbsAlarm,
    CancelAlarm,
    GetAlarm,
    StartScheduleTableRel,
    StartScheduleTableAbs,
    StartScheduleTableSynchron,
    StopScheduleTable,
    ChainScheduleTable,
    SyncScheduleTable,
    SetScheduleTableAsync,
    GetScheduleTableStatus,
    GetLock,
    ReleaseLock,
    StartOs,
    ShutdownOs,
    TerminateApplication,
    AllowAccess,
    CrossCore,
}

/// A protection fault: a runtime-detected violation of a configured budget,
/// distinct from an ordinary caller error. These are never returned to the
/// offending task; they are delivered to the protection hook, whose response
/// decides the blast radius.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProtectionFault {
    /// A task or ISR exceeded its execution-time budget.
    ExecBudgetExceeded,
    /// A lock or interrupt-disabled section was held longer than allowed.
    LockBudgetExceeded,
    /// A task was activated more often than its configured arrival rate.
    ArrivalRateExceeded,
}

/// Response chosen by the protection hook when a [`ProtectionFault`] is
/// delivered. Responses escalate: killing a task quarantines just that task,
/// killing an application quarantines every object it owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProtectionResponse {
    /// Quarantine the offending task only.
    KillTask,
    /// Quarantine the owning application and everything it owns.
    KillApp,
    /// Kill the owning application, then restart it.
    RestartApp,
    /// Shut down this core.
    Shutdown,
}

/// Cross-core message opcodes.
///
/// Value 0 is deliberately unassigned: slot 0 of the handler table is the
/// "unknown call" fallback, and any opcode that fails to decode is routed
/// there.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgOp {
    ActivateTask = 1,
    GetTaskState = 2,
    SetEvent = 3,
    GetAlarm = 4,
    SetRelAlarm = 5,
    SetAbsAlarm = 6,
    CancelAlarm = 7,
    AdvanceCounter = 8,
    GetCount = 9,
    StartScheduleTableRel = 10,
    StartScheduleTableAbs = 11,
    StopScheduleTable = 12,
    SyncScheduleTable = 13,
    SetScheduleTableAsync = 14,
    GetScheduleTableStatus = 15,
    ShutdownCore = 16,
    /// Carries a result back to a waiting result slot on the origin core.
    Reply = 17,
}

impl core::convert::TryFrom<u8> for MsgOp {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::ActivateTask),
            2 => Ok(Self::GetTaskState),
            3 => Ok(Self::SetEvent),
            4 => Ok(Self::GetAlarm),
            5 => Ok(Self::SetRelAlarm),
            6 => Ok(Self::SetAbsAlarm),
            7 => Ok(Self::CancelAlarm),
            8 => Ok(Self::AdvanceCounter),
            9 => Ok(Self::GetCount),
            10 => Ok(Self::StartScheduleTableRel),
            11 => Ok(Self::StartScheduleTableAbs),
            12 => Ok(Self::StopScheduleTable),
            13 => Ok(Self::SyncScheduleTable),
            14 => Ok(Self::SetScheduleTableAsync),
            15 => Ok(Self::GetScheduleTableStatus),
            16 => Ok(Self::ShutdownCore),
            17 => Ok(Self::Reply),
            _ => Err(()),
        }
    }
}

/// Number of `u32` parameter slots in a cross-core message.
pub const MSG_PARAMS: usize = 4;
