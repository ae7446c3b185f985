// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt, str::FromStr};

use nix::libc::{dev_t, major, makedev, minor};

use crate::{core::errors, result::DmError};

/// A struct containing the device's major and minor numbers
///
/// Also allows conversion to/from a single 64bit dev_t value.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Device {
    /// Device major number
    pub major: u32,
    /// Device minor number
    pub minor: u32,
}

/// Display format is the device number in "<major>:<minor>" format
impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for Device {
    type Err = DmError;

    fn from_str(s: &str) -> Result<Device, DmError> {
        let parse = |val: &str, what: &str| {
            val.parse::<u32>().map_err(|_| {
                DmError::Core(errors::Error::InvalidArgument(format!(
                    "could not parse \"{val}\" to obtain {what} number"
                )))
            })
        };
        match s.split(':').collect::<Vec<_>>()[..] {
            [major, minor] => Ok(Device {
                major: parse(major, "major")?,
                minor: parse(minor, "minor")?,
            }),
            _ => Err(DmError::Core(errors::Error::InvalidArgument(format!(
                "value \"{s}\" split into wrong number of fields"
            )))),
        }
    }
}

impl From<dev_t> for Device {
    #[allow(unused_unsafe)] // No longer unsafe in libc 0.2.133.
    fn from(val: dev_t) -> Device {
        Device {
            major: unsafe { major(val) },
            minor: unsafe { minor(val) },
        }
    }
}

impl From<Device> for dev_t {
    #[allow(unused_unsafe)] // No longer unsafe in libc 0.2.133.
    fn from(dev: Device) -> dev_t {
        unsafe { makedev(dev.major, dev.minor) }
    }
}

/// The Linux kernel's kdev_t encodes major/minor values as mmmM MMmm.
impl Device {
    /// Make a Device from a kdev_t.
    pub fn from_kdev_t(val: u32) -> Device {
        Device {
            major: (val & 0xf_ff00) >> 8,
            minor: (val & 0xff) | ((val >> 12) & 0xf_ff00),
        }
    }

    /// Convert to a kdev_t. Return None if values are not expressible as a
    /// kdev_t.
    pub fn to_kdev_t(self) -> Option<u32> {
        if self.major > 0xfff || self.minor > 0xf_ffff {
            return None;
        }

        Some((self.minor & 0xff) | (self.major << 8) | ((self.minor & !0xff) << 12))
    }
}
