// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use abi::{EventMask, Priority, ServiceError, TaskState};

use crate::descs::{TaskDesc, TaskFlags};
use crate::timing::Accounting;

/// Internal representation of a task.
///
/// The fields of this struct are private to this module so that we can
/// maintain some task invariants, mostly that the scheduling-relevant state
/// (`state`, `priority`, `queued`) only changes through operations that tell
/// the caller what queue maintenance is required.
#[derive(Debug)]
pub struct Task {
    /// Current dispatch priority. Starts at the descriptor's priority and is
    /// temporarily raised while the task holds ceiling locks.
    priority: Priority,
    /// State used to make status and scheduling decisions.
    state: TaskState,
    /// Additional activations accepted while the task was already activated.
    /// Each one turns into a fresh run when the current one terminates.
    queued: u8,
    /// Events posted to the task since it last started. Only meaningful for
    /// extended tasks.
    pending: EventMask,
    /// Events the task is currently waiting for, empty unless `state` is
    /// `Waiting`.
    wanted: EventMask,
    /// Execution-time accounting for the current activation.
    pub exec: Accounting,
    /// High-water mark of stack words used, reported by the context-switch
    /// layer.
    stack_used: u32,

    /// Pointer to the ROM descriptor used to create this task, so it can be
    /// reset on app restart.
    descriptor: &'static TaskDesc,
}

/// Outcome of a successful activation, telling the caller what the ready
/// queue needs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Activation {
    /// The task transitioned out of the suspended state and must be
    /// enqueued.
    Enqueue,
    /// The task was already activated; the extra activation was counted and
    /// no queue change is needed.
    Counted,
}

/// Outcome of terminating the current activation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Termination {
    /// No activations were pending; the task is now suspended and must be
    /// removed from the ready queue.
    Suspended,
    /// A queued activation was consumed; the task stays ready but moves to
    /// the tail of its priority, behind tasks that arrived in the meantime.
    Requeue,
}

impl Task {
    /// Creates a `Task` in its initial state, filling in fields from
    /// `descriptor`.
    pub fn from_descriptor(descriptor: &'static TaskDesc) -> Self {
        Task {
            priority: descriptor.priority,
            state: TaskState::default(),
            queued: 0,
            pending: EventMask::EMPTY,
            wanted: EventMask::EMPTY,
            exec: Accounting::new(descriptor.exec_budget),
            stack_used: 0,
            descriptor,
        }
    }

    /// Records an observed stack depth, in words.
    pub fn note_stack_use(&mut self, words: u32) {
        self.stack_used = self.stack_used.max(words);
    }

    /// Unused stack words at the deepest point observed so far.
    pub fn stack_headroom(&self) -> u32 {
        self.descriptor.stack_words.saturating_sub(self.stack_used)
    }

    /// Requests an activation.
    ///
    /// A suspended task becomes ready. A task that is already activated
    /// absorbs the activation into its queued count, up to the descriptor's
    /// limit; past that the request fails with `Limit` and nothing changes.
    /// A quarantined task rejects activation with `Access` until its app is
    /// restarted.
    pub fn activate(&mut self) -> Result<Activation, ServiceError> {
        match self.state {
            TaskState::Suspended | TaskState::New => {
                self.begin_run();
                Ok(Activation::Enqueue)
            }
            s if s.has_queued_activation() => {
                // max_activations counts the running one.
                if self.queued + 1 < self.descriptor.max_activations {
                    self.queued += 1;
                    Ok(Activation::Counted)
                } else {
                    Err(ServiceError::Limit)
                }
            }
            TaskState::Quarantined => Err(ServiceError::Access),
            _ => Err(ServiceError::Limit),
        }
    }

    /// Checks whether an activation request would currently be accepted,
    /// without performing it. Used by task chaining, which must refuse
    /// before terminating the caller.
    pub fn can_activate(&self) -> Result<(), ServiceError> {
        match self.state {
            TaskState::Suspended | TaskState::New => Ok(()),
            s if s.has_queued_activation() => {
                if self.queued + 1 < self.descriptor.max_activations {
                    Ok(())
                } else {
                    Err(ServiceError::Limit)
                }
            }
            TaskState::Quarantined => Err(ServiceError::Access),
            _ => Err(ServiceError::Limit),
        }
    }

    /// Ends the current activation. If activations are queued, one is
    /// consumed and the task runs again from the start; otherwise it
    /// suspends.
    pub fn terminate(&mut self) -> Termination {
        self.exec.end_frame();
        if self.queued > 0 {
            self.queued -= 1;
            self.begin_run();
            Termination::Requeue
        } else {
            self.state = TaskState::Suspended;
            Termination::Suspended
        }
    }

    /// Resets per-run state for a fresh activation.
    fn begin_run(&mut self) {
        self.state = TaskState::Ready;
        self.pending = EventMask::EMPTY;
        self.wanted = EventMask::EMPTY;
        self.exec.begin_frame();
    }

    /// Posts events to this task. Returns `true` if the task was waiting on
    /// one of them and is now ready (caller must enqueue it).
    ///
    /// Rejects basic tasks and tasks that have no current activation.
    pub fn post_events(
        &mut self,
        events: EventMask,
    ) -> Result<bool, ServiceError> {
        if !self.descriptor.flags.contains(TaskFlags::EXTENDED) {
            return Err(ServiceError::Access);
        }
        match self.state {
            TaskState::Suspended | TaskState::New | TaskState::Quarantined => {
                Err(ServiceError::WrongState)
            }
            TaskState::Waiting => {
                self.pending = EventMask(self.pending.0 | events.0);
                if self.pending.intersects(self.wanted) {
                    self.wanted = EventMask::EMPTY;
                    self.state = TaskState::Ready;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => {
                self.pending = EventMask(self.pending.0 | events.0);
                Ok(false)
            }
        }
    }

    /// Begins a wait for any event in `events`. Returns `true` if one is
    /// already pending (no state change, the caller keeps running);
    /// otherwise the task enters the waiting state and the caller must
    /// remove it from the ready queue.
    pub fn wait_for(
        &mut self,
        events: EventMask,
    ) -> Result<bool, ServiceError> {
        if !self.descriptor.flags.contains(TaskFlags::EXTENDED) {
            return Err(ServiceError::Access);
        }
        if self.pending.intersects(events) {
            Ok(true)
        } else {
            self.wanted = events;
            self.state = TaskState::Waiting;
            Ok(false)
        }
    }

    /// Clears events of the *calling* task.
    pub fn clear_events(&mut self, events: EventMask) {
        self.pending = EventMask(self.pending.0 & !events.0);
    }

    /// Events currently posted to this task.
    pub fn events(&self) -> EventMask {
        self.pending
    }

    /// Forcibly ends the task's activation and bars further activations
    /// until its app is restarted. Returns `true` if the task was occupying
    /// a ready-queue slot the caller must vacate.
    pub fn quarantine(&mut self) -> bool {
        let was_queued = matches!(
            self.state,
            TaskState::Ready | TaskState::Running
        );
        self.state = TaskState::Quarantined;
        self.queued = 0;
        self.pending = EventMask::EMPTY;
        self.wanted = EventMask::EMPTY;
        self.exec.end_frame();
        was_queued
    }

    /// Forcibly ends the task's activation without quarantining it, as part
    /// of killing a single task. Returns `true` if a ready-queue slot must
    /// be vacated.
    pub fn kill(&mut self) -> bool {
        let was_queued = matches!(
            self.state,
            TaskState::Ready | TaskState::Running
        );
        self.state = TaskState::Suspended;
        self.queued = 0;
        self.pending = EventMask::EMPTY;
        self.wanted = EventMask::EMPTY;
        self.exec.end_frame();
        was_queued
    }

    /// Returns the task to its boot state as part of an app restart.
    pub fn reinitialize(&mut self) {
        *self = Task::from_descriptor(self.descriptor);
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_running(&mut self) {
        self.state = TaskState::Running;
    }

    pub fn set_ready(&mut self) {
        self.state = TaskState::Ready;
    }

    /// Current dispatch priority, including any ceiling-lock elevation.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The descriptor's configured priority.
    pub fn base_priority(&self) -> Priority {
        self.descriptor.priority
    }

    pub fn set_priority(&mut self, p: Priority) {
        self.priority = p;
    }

    pub fn descriptor(&self) -> &'static TaskDesc {
        self.descriptor
    }
}

/// Scheduler hint returned by operations that may change which task should
/// run.
///
/// This is marked `must_use` because almost every kernel path that produces
/// one needs to feed it into the dispatcher; dropping one on the floor is
/// usually a missed reschedule.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// The currently running task should continue.
    Same,
    /// A specific task has become the obvious candidate.
    Specific(u16),
    /// Something changed; the dispatcher must consult the ready queue.
    Other,
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*;
        match (self, other) {
            (Other, _) | (_, Other) => Other,
            (Specific(a), Specific(b)) if a != b => Other,
            (Specific(t), _) | (_, Specific(t)) => Specific(t),
            (Same, Same) => Same,
        }
    }
}
