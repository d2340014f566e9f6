// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.
//!
//! Service implementations return `Result<_, UserError>`. A common wrapper in
//! `services` takes care of the final side effects: recoverable errors are
//! pushed through [`report`] (the single funnel every error hook sees) and
//! handed back to the caller as a `ServiceError`; protection faults go to the
//! protection hook, whose answer decides what gets killed. Internal
//! consistency faults never appear here at all; they go straight to
//! `fail::die`.

use abi::{ProtectionFault, ServiceError, ServiceId};

use crate::task::NextTask;

/// An error committed by user code when calling a kernel service.
///
/// This is used internally as the returned error type for service
/// implementations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error: caller errors (bad ID, wrong call level) and
    /// state errors (object not activatable) both land here. Recoverable
    /// errors are indicated to the errant caller by returning the
    /// `ServiceError`. They may still cause a context switch, as indicated
    /// by the `NextTask`.
    Recoverable(ServiceError, NextTask),
    /// A protection fault. These are never returned to the offending task;
    /// the dispatcher delivers them to the protection hook and applies its
    /// response.
    Protection(ProtectionFault),
}

/// Convenience conversion for the common "error, no scheduling impact" case.
impl From<ServiceError> for UserError {
    fn from(e: ServiceError) -> Self {
        Self::Recoverable(e, NextTask::Same)
    }
}

impl From<ProtectionFault> for UserError {
    fn from(f: ProtectionFault) -> Self {
        Self::Protection(f)
    }
}

/// Record of the most recent recoverable error, readable through the
/// diagnostic API (the moral equivalent of the original's `GetErrorInfo`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ErrorRecord {
    pub service: ServiceId,
    pub error: ServiceError,
}

/// Application-supplied error hook.
pub type ErrorHook = fn(ServiceId, ServiceError);

/// Reports a recoverable error through the error hook, exactly once per
/// error, suppressing recursion: an error raised *inside* the hook is
/// recorded but does not re-enter the hook.
///
/// Returns the error unchanged so call sites can tail it:
/// `return Err(report(...).into())`.
pub fn report(
    hook: Option<ErrorHook>,
    in_hook: &mut bool,
    last: &mut Option<ErrorRecord>,
    service: ServiceId,
    error: ServiceError,
) -> ServiceError {
    *last = Some(ErrorRecord { service, error });
    if let Some(hook) = hook {
        if !*in_hook {
            *in_hook = true;
            hook(service, error);
            *in_hook = false;
        }
    }
    error
}
