// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::core::{dm_ioctl as dmi, DmFlags, DmUdevFlags};

/// Encapsulates options for device mapper calls
#[derive(Debug, Default, Clone)]
pub struct DmOptions {
    flags: DmFlags,
    udev_flags: DmUdevFlags,
    cookie: u32,
}

impl DmOptions {
    /// Create a new empty option
    pub fn new() -> DmOptions {
        DmOptions {
            flags: DmFlags::empty(),
            udev_flags: DmUdevFlags::empty(),
            cookie: 0,
        }
    }

    /// Set the DmFlags value for option.  Note this call is not additive in that it sets (replaces)
    /// entire flag value in one call.  Thus if you want to incrementally add additional flags you
    /// need to retrieve current and '|' with new.
    pub fn set_flags(&mut self, flags: DmFlags) -> &mut DmOptions {
        self.flags = flags;
        self
    }

    /// Set the udev flags carried in the upper 16 bits of the header's
    /// event_nr field. Not additive.
    pub fn set_udev_flags(&mut self, udev_flags: DmUdevFlags) -> &mut DmOptions {
        self.udev_flags = udev_flags;
        self
    }

    /// Set the udev cookie whose base value is carried in the lower 16 bits
    /// of the header's event_nr field.
    pub fn set_cookie(&mut self, cookie: u32) -> &mut DmOptions {
        self.cookie = cookie;
        self
    }

    /// Retrieve the flags value
    pub fn flags(&self) -> DmFlags {
        self.flags
    }

    /// Retrieve the udev flags value
    pub fn udev_flags(&self) -> DmUdevFlags {
        self.udev_flags
    }

    /// Retrieve the udev cookie value
    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    /// The event_nr value to place in an ioctl header.
    pub(super) fn event_nr(&self) -> u32 {
        (self.udev_flags.bits() << dmi::DM_UDEV_FLAGS_SHIFT) | (self.cookie & !dmi::DM_UDEV_FLAGS_MASK)
    }
}
