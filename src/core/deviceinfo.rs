// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::{
    core::{device::Device, dm_flags::DmFlags, dm_ioctl as dmi},
    task::Info,
};

/// The state of a device, as returned in the header of every ioctl.
#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    target_count: u32,
    open_count: i32,
    flags: DmFlags,
    event_nr: u32,
    dev: Device,
}

impl From<dmi::Struct_dm_ioctl> for DeviceInfo {
    fn from(hdr: dmi::Struct_dm_ioctl) -> DeviceInfo {
        DeviceInfo {
            target_count: hdr.target_count,
            open_count: hdr.open_count,
            flags: DmFlags::from_bits_truncate(hdr.flags),
            event_nr: hdr.event_nr,
            // dm_ioctl struct reserves 64 bits for device but kernel "huge"
            // encoding is only 32 bits.
            dev: Device::from_kdev_t(hdr.dev as u32),
        }
    }
}

impl DeviceInfo {
    /// The flags returned from the device.
    pub fn flags(&self) -> DmFlags {
        self.flags
    }

    /// Whether the kernel sent a uevent for the ioctl.
    pub fn uevent_generated(&self) -> bool {
        self.flags.contains(DmFlags::DM_UEVENT_GENERATED)
    }
}

impl From<&DeviceInfo> for Info {
    fn from(info: &DeviceInfo) -> Info {
        Info {
            exists: true,
            suspended: info.flags.contains(DmFlags::DM_SUSPEND),
            live_table: info.flags.contains(DmFlags::DM_ACTIVE_PRESENT),
            inactive_table: info.flags.contains(DmFlags::DM_INACTIVE_PRESENT),
            open_count: info.open_count,
            event_nr: info.event_nr,
            major: info.dev.major,
            minor: info.dev.minor,
            read_only: info.flags.contains(DmFlags::DM_READONLY),
            target_count: info.target_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    /// The flags of the header become the state of the device.
    fn test_info_from_header() {
        let mut hdr: dmi::Struct_dm_ioctl = unsafe { mem::zeroed() };
        hdr.flags = (DmFlags::DM_SUSPEND | DmFlags::DM_INACTIVE_PRESENT).bits();
        hdr.open_count = 2;
        hdr.target_count = 1;
        hdr.event_nr = 7;
        hdr.dev = u64::from(Device { major: 253, minor: 4 }.to_kdev_t().expect("fits"));

        let info = Info::from(&DeviceInfo::from(hdr));
        assert!(info.exists);
        assert!(info.suspended);
        assert!(!info.live_table);
        assert!(info.inactive_table);
        assert!(!info.read_only);
        assert_eq!((info.open_count, info.target_count, info.event_nr), (2, 1, 7));
        assert_eq!((info.major, info.minor), (253, 4));
        assert!(!DeviceInfo::from(hdr).uevent_generated());
    }
}
