// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.
//!
//! Two kinds of time coexist in the kernel. *Counter ticks* (`Ticks`) are
//! 32-bit values that wrap at a per-counter configured maximum, which need
//! not be a power of two. *Timestamps* are monotonic 64-bit readings of the
//! execution/timestamp timer and never wrap in practice.

/// Tick value of a counter. Always interpreted modulo the counter's
/// configured wrap limit.
pub type Ticks = u32;

/// In-kernel timestamp representation, measured in execution-timer ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

impl Timestamp {
    /// Ticks elapsed since `earlier`. `earlier` must not be in the future.
    pub fn since(self, earlier: Timestamp) -> u64 {
        self.0 - earlier.0
    }
}

/// Adds `inc` onto `cur`, wrapping at `max` (the counter's largest legal
/// value, *inclusive*).
///
/// The naive `(cur + inc) % (max + 1)` fails when `max` is large relative to
/// the word size: with `max = 0xFFFF_FFFE`, both operands can legally be
/// large enough that the sum overflows. Instead we compute the distance from
/// `cur` to `max` first and only subtract the modulus when the increment
/// crosses it; none of the intermediate operations can then overflow in a
/// way that matters.
pub fn tick_add(cur: Ticks, inc: Ticks, max: Ticks) -> Ticks {
    if (max - cur) < inc {
        cur.wrapping_add(inc).wrapping_sub(max).wrapping_sub(1)
    } else {
        cur + inc
    }
}

/// Subtracts `dec` from `cur`, wrapping at `max`. See [`tick_add`].
pub fn tick_sub(cur: Ticks, dec: Ticks, max: Ticks) -> Ticks {
    if cur < dec {
        cur.wrapping_sub(dec).wrapping_add(max).wrapping_add(1)
    } else {
        cur - dec
    }
}

/// Computes `cur - old` on raw hardware-timer values, where the timer wraps
/// at `mask + 1`. For power-of-two ranges this is a single AND; otherwise it
/// falls back to the modular subtraction.
pub fn timer_sub(cur: u32, old: u32, mask: u32) -> u32 {
    if (mask.wrapping_add(1) & mask) == 0 {
        cur.wrapping_sub(old) & mask
    } else {
        tick_sub(cur, old, mask)
    }
}
