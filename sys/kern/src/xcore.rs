// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cross-core message bus.
//!
//! Cores never mutate each other's scheduling state directly; a core that
//! wants something done elsewhere (activate a task, advance a counter,
//! shut down) sends a message to the owning core's inbound queue and the
//! owner applies it through the same local code path a native call would
//! take.
//!
//! Each core owns one fixed-capacity ring with free-running `fill`
//! (producer) and `empty` (consumer) indices. Senders serialize on a
//! per-queue producer lock, write the message body, then publish it by
//! advancing `fill` with release ordering; the consumer acquires `fill`
//! and drains. These two fences are the *only* cross-core visibility
//! points in the kernel -- nothing else may assume coherency.
//!
//! The queue never blocks a sender: capacity is sized at configuration
//! time for the worst-case in-flight count, so an overflow here is a
//! configuration defect and dies.
//!
//! Requests that produce a result carry a *reply slot*: the index of an
//! entry in the sender's core-local result table. The executing core sends
//! a [`MsgOp::Reply`] message back, and the origin core fills the slot
//! when it drains its own queue. Result slots are purely core-local; only
//! the message crosses cores.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::{CoreId, MsgOp, ServiceError, MSG_PARAMS, NONE_INDEX};

use crate::descs::MAX_CORES;
use crate::fail;

/// Capacity of one core's inbound ring. Must cover the configured
/// worst-case number of in-flight requests targeting one core.
pub const QUEUE_CAP: usize = 16;

/// Result slots per core. Bounds the number of reply-carrying requests one
/// core can have outstanding.
pub const RESULT_SLOTS: usize = 8;

/// One cross-core request, alive from enqueue to dequeue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Message {
    /// Raw opcode. Decoded at dispatch; anything that fails to decode is
    /// routed to the unknown-call handler.
    pub op: u8,
    pub origin: CoreId,
    /// Index into the origin core's result table, or `NONE_INDEX` for
    /// fire-and-forget requests.
    pub reply_slot: u16,
    pub params: [u32; MSG_PARAMS],
}

impl Message {
    const EMPTY: Self = Message {
        op: 0,
        origin: CoreId(0),
        reply_slot: NONE_INDEX,
        params: [0; MSG_PARAMS],
    };

    /// Builds the reply message answering `self` with `code` and `value`.
    pub fn reply(&self, to: CoreId, code: u32, value: u32) -> Message {
        Message {
            op: MsgOp::Reply as u8,
            origin: to,
            reply_slot: NONE_INDEX,
            params: [u32::from(self.reply_slot), code, value, 0],
        }
    }
}

/// One core's inbound ring.
struct MsgQueue {
    slots: [UnsafeCell<Message>; QUEUE_CAP],
    /// Free-running producer index; `fill - empty` is the occupancy.
    fill: AtomicU32,
    /// Free-running consumer index, written only by the owning core.
    empty: AtomicU32,
    /// Serializes concurrent senders.
    producer: AtomicBool,
}

// Slot contents are only written between taking the producer lock and the
// release store of `fill`, and only read after the acquire load of `fill`;
// the indices order every access.
unsafe impl Sync for MsgQueue {}

impl MsgQueue {
    const fn new() -> Self {
        MsgQueue {
            slots: [const { UnsafeCell::new(Message::EMPTY) }; QUEUE_CAP],
            fill: AtomicU32::new(0),
            empty: AtomicU32::new(0),
            producer: AtomicBool::new(false),
        }
    }

    fn send(&self, msg: Message) {
        while self
            .producer
            .compare_exchange_weak(
                false,
                true,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }
        let fill = self.fill.load(Ordering::Relaxed);
        let empty = self.empty.load(Ordering::Acquire);
        if fill.wrapping_sub(empty) as usize >= QUEUE_CAP {
            // Capacity is an integration-time guarantee, not a runtime
            // condition.
            fail::die("cross-core queue overflow");
        }
        let slot = fill as usize % QUEUE_CAP;
        unsafe {
            *self.slots[slot].get() = msg;
        }
        // Publish the body to the consumer.
        self.fill.store(fill.wrapping_add(1), Ordering::Release);
        self.producer.store(false, Ordering::Release);
    }

    /// Drains every message visible at this moment, in arrival order. Only
    /// the owning core may call this.
    fn drain(&self, mut f: impl FnMut(Message)) {
        loop {
            let fill = self.fill.load(Ordering::Acquire);
            let mut empty = self.empty.load(Ordering::Relaxed);
            if empty == fill {
                return;
            }
            while empty != fill {
                let msg =
                    unsafe { *self.slots[empty as usize % QUEUE_CAP].get() };
                empty = empty.wrapping_add(1);
                // Republish the slot before running the handler, so a
                // sender blocked on occupancy sees it free immediately.
                self.empty.store(empty, Ordering::Release);
                f(msg);
            }
        }
    }
}

/// The one structure shared by every core.
pub struct MessageBus {
    queues: [MsgQueue; MAX_CORES],
    /// Set when a core enters shutdown. Checked by its own receive path so
    /// in-flight requests get a core-down answer instead of vanishing.
    down: [AtomicBool; MAX_CORES],
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub const fn new() -> Self {
        MessageBus {
            queues: [const { MsgQueue::new() }; MAX_CORES],
            down: [const { AtomicBool::new(false) }; MAX_CORES],
        }
    }

    /// Enqueues `msg` for `dest`. Never blocks; the destination being down
    /// is handled on the receive side so the answer is well-defined.
    pub fn send(&self, dest: CoreId, msg: Message) {
        self.queues[dest.index()].send(msg);
    }

    /// Drains `core`'s inbound queue. Only `core` itself may call this.
    pub fn drain(&self, core: CoreId, f: impl FnMut(Message)) {
        self.queues[core.index()].drain(f);
    }

    pub fn mark_down(&self, core: CoreId) {
        self.down[core.index()].store(true, Ordering::Release);
    }

    pub fn is_down(&self, core: CoreId) -> bool {
        self.down[core.index()].load(Ordering::Acquire)
    }
}

/// State of one entry in a core's result table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
enum SlotState {
    #[default]
    Free,
    Pending,
    Done {
        code: u32,
        value: u32,
    },
}

/// Core-local table of outstanding replies. Touched only by its owning
/// core: allocated before a send, filled by the reply handler during
/// drain, read back by the original caller.
pub struct ResultTable {
    slots: [SlotState; RESULT_SLOTS],
}

impl Default for ResultTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultTable {
    pub fn new() -> Self {
        ResultTable {
            slots: [SlotState::Free; RESULT_SLOTS],
        }
    }

    /// Claims a free slot for an outgoing request, or `Limit` if every
    /// slot is in flight.
    pub fn allocate(&mut self) -> Result<u16, ServiceError> {
        for (i, s) in self.slots.iter_mut().enumerate() {
            if *s == SlotState::Free {
                *s = SlotState::Pending;
                return Ok(i as u16);
            }
        }
        Err(ServiceError::Limit)
    }

    /// Stores an arrived reply. A reply naming a slot that is not pending
    /// means the wire protocol broke.
    pub fn complete(&mut self, slot: u16, code: u32, value: u32) {
        match self.slots.get_mut(usize::from(slot)) {
            Some(s @ SlotState::Pending) => {
                *s = SlotState::Done { code, value };
            }
            _ => fail::die("reply to a slot that is not pending"),
        }
    }

    /// Takes a completed result, freeing the slot. `None` while the reply
    /// is still in flight.
    pub fn take(&mut self, slot: u16) -> Option<(u32, u32)> {
        match self.slots[usize::from(slot)] {
            SlotState::Done { code, value } => {
                self.slots[usize::from(slot)] = SlotState::Free;
                Some((code, value))
            }
            SlotState::Pending => None,
            SlotState::Free => fail::die("result taken from a free slot"),
        }
    }

    /// Abandons a pending request (e.g. the destination died and no reply
    /// will come).
    pub fn cancel(&mut self, slot: u16) {
        self.slots[usize::from(slot)] = SlotState::Free;
    }
}

/// Maps a raw opcode to its handler-table index. Opcodes that do not
/// decode land on index 0, the unknown-call handler.
pub fn handler_index(op: u8) -> usize {
    match MsgOp::try_from(op) {
        Ok(op) => op as usize,
        Err(()) => 0,
    }
}

/// Number of handler-table entries: the unknown-call slot plus one per
/// opcode.
pub const HANDLER_COUNT: usize = MsgOp::Reply as usize + 1;
