// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Udev synchronization.
//!
//! Operations that add, remove or resume a device make udev run its rules
//! for the device. The caller attaches a cookie to such a task and, once the
//! task has run, waits on the cookie until udev is done with the device.

use std::fmt;

use crate::{
    core::errors::Error,
    result::{DmError, DmResult},
    task::Engine,
};

/// Token shared with udev for one transaction. Zero means there is nothing
/// to wait for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UdevCookie(u32);

impl UdevCookie {
    /// Wrap a raw cookie value.
    pub fn new(value: u32) -> UdevCookie {
        UdevCookie(value)
    }

    /// The raw cookie value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for UdevCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Block until udev has processed every event tagged with `cookie`.
pub fn udev_wait<E: Engine>(engine: &E, cookie: UdevCookie) -> DmResult<()> {
    engine
        .udev_wait(cookie.value())
        .map_err(|err| DmError::Core(Error::UdevWait(cookie.value(), err.to_string())))
}

/// Waits on a cookie exactly once: explicitly with `finish`, or on drop if
/// an error path left the scope first.
#[must_use = "dropping the guard waits on the cookie immediately"]
pub struct CookieWait<'a, E: Engine> {
    engine: &'a E,
    cookie: UdevCookie,
    waited: bool,
}

impl<'a, E: Engine> CookieWait<'a, E> {
    /// Guard a cookie that was just set on a task.
    pub fn new(engine: &'a E, cookie: UdevCookie) -> CookieWait<'a, E> {
        CookieWait {
            engine,
            cookie,
            waited: false,
        }
    }

    /// The guarded cookie.
    pub fn cookie(&self) -> UdevCookie {
        self.cookie
    }

    /// Wait on the cookie, surfacing any failure.
    pub fn finish(mut self) -> DmResult<()> {
        self.waited = true;
        udev_wait(self.engine, self.cookie)
    }
}

impl<E: Engine> Drop for CookieWait<'_, E> {
    fn drop(&mut self) {
        if !self.waited {
            if let Err(err) = udev_wait(self.engine, self.cookie) {
                warn!("Failed to wait on udev cookie {}: {}", self.cookie, err);
            }
        }
    }
}
