// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OS applications.
//!
//! An application is a statically configured group of tasks, counters,
//! alarms and schedule tables sharing permission and restart semantics.
//! This module only tracks the lifecycle states; the actual demolition of
//! an application's objects (killing tasks, stopping tables) is driven by
//! the dispatcher, which owns those arenas.

use abi::{AppId, AppState, ServiceError};

use crate::descs::MAX_APPS;

/// Lifecycle states of every application on one core.
pub struct AppSet {
    states: [AppState; MAX_APPS],
}

impl Default for AppSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AppSet {
    pub fn new() -> Self {
        AppSet {
            states: [AppState::Accessible; MAX_APPS],
        }
    }

    pub fn state(&self, app: AppId) -> AppState {
        self.states[app.index()]
    }

    /// Checks that `app`'s objects may be used. Anything but accessible
    /// reports as a permission error to the caller.
    pub fn check_accessible(&self, app: AppId) -> Result<(), ServiceError> {
        match self.states[app.index()] {
            AppState::Accessible => Ok(()),
            _ => Err(ServiceError::Access),
        }
    }

    /// Marks `app` terminated. With `restart` its restart task will be
    /// activated and the application stays in the restarting state until
    /// it declares itself open again; without, the application is
    /// quarantined for good.
    ///
    /// Terminating an application that is already down is a state error.
    pub fn terminate(
        &mut self,
        app: AppId,
        restart: bool,
    ) -> Result<(), ServiceError> {
        match self.states[app.index()] {
            AppState::Accessible => {
                self.states[app.index()] = if restart {
                    AppState::Restarting
                } else {
                    AppState::Quarantined
                };
                Ok(())
            }
            _ => Err(ServiceError::WrongState),
        }
    }

    /// Reopens a restarting application. Called by its restart task once
    /// reinitialization is complete.
    pub fn allow_access(&mut self, app: AppId) -> Result<(), ServiceError> {
        match self.states[app.index()] {
            AppState::Restarting => {
                self.states[app.index()] = AppState::Accessible;
                Ok(())
            }
            _ => Err(ServiceError::WrongState),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_cycle() {
        let mut apps = AppSet::new();
        let a = AppId(0);
        assert_eq!(apps.check_accessible(a), Ok(()));
        apps.terminate(a, true).unwrap();
        assert_eq!(apps.state(a), AppState::Restarting);
        assert_eq!(apps.check_accessible(a), Err(ServiceError::Access));
        // A second kill while down is a state error.
        assert_eq!(apps.terminate(a, false), Err(ServiceError::WrongState));
        apps.allow_access(a).unwrap();
        assert_eq!(apps.check_accessible(a), Ok(()));
    }

    #[test]
    fn quarantine_is_terminal() {
        let mut apps = AppSet::new();
        let a = AppId(1);
        apps.terminate(a, false).unwrap();
        assert_eq!(apps.state(a), AppState::Quarantined);
        assert_eq!(apps.allow_access(a), Err(ServiceError::WrongState));
    }
}
