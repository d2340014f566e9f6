// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording unrecoverable kernel failures such that they can be
//! found by tooling.
//!
//! Internal consistency faults (corrupted delta queue, overfull ready queue,
//! inconsistent start mode across cores) are not errors the kernel can hand
//! back to a caller. They all funnel into [`die`], which:
//!
//! 1. records the failure reason in the epitaph buffer,
//! 2. attempts one orderly shutdown through the hook registered with
//!    [`set_shutdown_handler`], and
//! 3. if entered a second time (including a failure *during* that shutdown),
//!    halts immediately without calling any further hooks.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is an `AtomicBool`, cleared at boot and
//!   set on the way into `die`.
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. `die` writes as much
//!   of the failure reason into this buffer (as UTF-8) as possible,
//!   truncating if the buffer fills. For printing, trim trailing NULs.

use core::fmt::{Display, Write};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Flag that gets set by all failure reporting functions, giving tools a
/// one-stop-shop for doing kernel triage.
#[used]
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of
/// the event that caused the kernel to fail, padded with NULs.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Orderly-shutdown hook invoked on the first entry to `die`. Stored as a
/// `usize` so it fits in an atomic; 0 means "none registered".
static SHUTDOWN_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Registers `handler` to be called once, on the first kernel failure, to
/// attempt an orderly shutdown. Later registrations replace earlier ones.
pub fn set_shutdown_handler(handler: fn()) {
    SHUTDOWN_HANDLER.store(handler as usize, Ordering::Release);
}

#[cfg(test)]
pub(crate) fn clear_failure_state_for_test() {
    SHUTDOWN_HANDLER.store(0, Ordering::Release);
    KERNEL_HAS_FAILED.store(false, Ordering::Release);
}

/// The failure state is process-global, so tests that deliberately `die`
/// must not overlap. Every such test takes this guard first.
#[cfg(test)]
pub(crate) fn die_test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    let guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_failure_state_for_test();
    guard
}

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    let previous_fail = KERNEL_HAS_FAILED.swap(true, Ordering::SeqCst);
    if previous_fail {
        // Re-entered: either a second core failed concurrently or the
        // orderly shutdown itself failed. Halt without touching anything
        // else, per the failure contract.
        halt();
    }

    // Safety: we can get a mutable reference to the epitaph because only one
    // execution of this function will successfully set that flag.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` and fails the kernel. Never returns.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    let handler = SHUTDOWN_HANDLER.load(Ordering::Acquire);
    if handler != 0 {
        // Safety: the only values ever stored are `fn()` pointers (and 0,
        // excluded above).
        let handler: fn() = unsafe { core::mem::transmute(handler) };
        handler();
    }

    halt()
}

#[cfg(not(test))]
fn halt() -> ! {
    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// In the test harness a halted kernel would hang the test runner, so we
/// surface the epitaph as a Rust panic instead and let `#[should_panic]`
/// assertions see it.
#[cfg(test)]
fn halt() -> ! {
    KERNEL_HAS_FAILED.store(false, Ordering::SeqCst);
    // Safety: single-threaded by the time a test observes its own die();
    // worst case a racing reader sees a torn epitaph string in the panic
    // message of a failing test.
    let buf = unsafe { &*core::ptr::addr_of!(KERNEL_EPITAPH) };
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    panic!(
        "kernel died: {}",
        core::str::from_utf8(&buf[..len]).unwrap_or("<non-utf8 epitaph>")
    );
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static SHUTDOWNS: AtomicU32 = AtomicU32::new(0);

    #[test]
    #[should_panic(expected = "kernel died: it broke")]
    fn die_reports_reason_and_runs_shutdown_once() {
        let _guard = die_test_guard();
        set_shutdown_handler(|| {
            SHUTDOWNS.fetch_add(1, Ordering::SeqCst);
            assert_eq!(SHUTDOWNS.load(Ordering::SeqCst), 1);
        });
        die("it broke");
    }
}
