// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt, str::FromStr};

use crate::result::{DmError, DmResult, ErrorEnum};

/// One more than the largest id a thin pool can assign to a device.
pub const THIN_DEV_ID_LIMIT: u64 = 0x0100_0000; // 2 ^ 24

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
/// A thindev id is a 24 bit number, i.e., its bit width is not a power of 2.
pub struct ThinDevId {
    value: u32,
}

impl ThinDevId {
    /// Make a new ThinDevId.
    /// Return an error if value is too large to represent in 24 bits.
    pub fn new_u64(value: u64) -> DmResult<ThinDevId> {
        if value < THIN_DEV_ID_LIMIT {
            Ok(ThinDevId {
                value: value as u32,
            })
        } else {
            Err(DmError::Dm(
                ErrorEnum::Invalid,
                format!("argument {value} unrepresentable in 24 bits"),
            ))
        }
    }

    /// The id following this one, or None if this is the largest id.
    pub fn next(self) -> Option<ThinDevId> {
        ThinDevId::new_u64(u64::from(self.value) + 1).ok()
    }
}

impl From<ThinDevId> for u32 {
    fn from(id: ThinDevId) -> u32 {
        id.value
    }
}

impl fmt::Display for ThinDevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl FromStr for ThinDevId {
    type Err = DmError;

    fn from_str(s: &str) -> Result<ThinDevId, DmError> {
        let value = s.parse::<u64>().map_err(|_| {
            DmError::Dm(
                ErrorEnum::Invalid,
                format!("failed to parse thindev id from \"{s}\""),
            )
        })?;
        ThinDevId::new_u64(value)
    }
}

impl serde::Serialize for ThinDevId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.value)
    }
}

impl<'de> serde::Deserialize<'de> for ThinDevId {
    fn deserialize<D>(deserializer: D) -> Result<ThinDevId, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let value: u32 = serde::Deserialize::deserialize(deserializer)?;
        ThinDevId::new_u64(u64::from(value)).map_err(serde::de::Error::custom)
    }
}
