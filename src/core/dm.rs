// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{cmp, fs::File, mem::size_of, os::unix::io::AsRawFd};

use nix::{errno::Errno, libc::ioctl as nix_ioctl};

use crate::{
    core::{
        dm_ioctl as dmi,
        errors::Error,
        util::{
            align_to, c_struct_from_slice, copy_to_c_str, slice_from_c_struct, slice_to_null,
        },
        DevId, Device, DeviceInfo, DmFlags, DmName, DmNameBuf, DmOptions, DmUuid,
    },
    result::{DmError, DmResult},
};

/// Indicator to send IOCTL to DM
const DM_IOCTL: u8 = 0xfd;
/// Control path for user space to pass IOCTL to kernel DM
const DM_CTL_PATH: &str = "/dev/mapper/control";
/// Major version
const DM_VERSION_MAJOR: u32 = 4;
/// Minor version
const DM_VERSION_MINOR: u32 = 30;
/// Patch level
const DM_VERSION_PATCHLEVEL: u32 = 0;

/// Start with a large buffer to make BUFFER_FULL rare. Libdm does this too.
const MIN_BUF_SIZE: usize = 16 * 1024;

/// Offset of the name field in a dm_name_list record. The Rust struct is
/// padded to 16 bytes, the kernel places the name directly after `next`.
const NAME_LIST_NAME_OFFSET: usize = 12;

cfg_if::cfg_if! {
    if #[cfg(devicemapper437supported)] {
        // Each device's event number follows its name, if the kernel DM
        // version supports it.
        // Should match offset calc in kernel's
        // drivers/md/dm-ioctl.c:list_devices
        fn name_list_event_nr(minor_version: u32, record: &[u8], name_len: usize) -> Option<u32> {
            match minor_version {
                0..=36 => None,
                _ => {
                    let offset = align_to(NAME_LIST_NAME_OFFSET + name_len + 1, size_of::<u64>());
                    record.get(offset..).and_then(c_struct_from_slice::<u32>)
                }
            }
        }
    } else {
        fn name_list_event_nr(_minor_version: u32, _record: &[u8], _name_len: usize) -> Option<u32> {
            None
        }
    }
}

/// One line of a table as the kernel reports it: start sector, length in
/// sectors, target type, parameters.
pub type RawTargetLine = (u64, u64, String, String);

/// Context needed for communicating with devicemapper.
#[derive(Debug)]
pub struct DM {
    file: File,
}

impl DmOptions {
    /// Generate a header to be used for IOCTL.
    fn to_ioctl_hdr(&self, id: Option<&DevId<'_>>, allowable_flags: DmFlags) -> dmi::Struct_dm_ioctl {
        let clean_flags = allowable_flags & self.flags();
        let mut hdr: dmi::Struct_dm_ioctl = Default::default();

        hdr.version[0] = DM_VERSION_MAJOR;
        hdr.version[1] = DM_VERSION_MINOR;
        hdr.version[2] = DM_VERSION_PATCHLEVEL;

        hdr.flags = clean_flags.bits();
        hdr.event_nr = self.event_nr();

        hdr.data_start = size_of::<dmi::Struct_dm_ioctl>() as u32;

        if let Some(id) = id {
            match *id {
                DevId::Name(name) => DM::hdr_set_name(&mut hdr, name),
                DevId::Uuid(uuid) => DM::hdr_set_uuid(&mut hdr, uuid),
            };
        };

        hdr
    }
}

impl DM {
    /// Create a new context for communicating with DM.
    pub fn new() -> DmResult<DM> {
        Ok(DM {
            file: File::open(DM_CTL_PATH)
                .map_err(|e| DmError::Core(Error::ContextInit(e.to_string())))?,
        })
    }

    fn hdr_set_name(hdr: &mut dmi::Struct_dm_ioctl, name: &DmName) {
        copy_to_c_str(&mut hdr.name, name.as_bytes());
    }

    fn hdr_set_uuid(hdr: &mut dmi::Struct_dm_ioctl, uuid: &DmUuid) {
        copy_to_c_str(&mut hdr.uuid, uuid.as_bytes());
    }

    /// Get the file within the DM context, likely for polling purposes.
    pub fn file(&self) -> &File {
        &self.file
    }

    // Give this a filled-in header and optionally add'l stuff.
    // Does the ioctl and maybe returns stuff. Handles BUFFER_FULL flag.
    fn do_ioctl(
        &self,
        ioctl: u8,
        hdr: &mut dmi::Struct_dm_ioctl,
        in_data: Option<&[u8]>,
    ) -> DmResult<Vec<u8>> {
        let hdr_in = *hdr;
        let hdr_size = size_of::<dmi::Struct_dm_ioctl>();

        // The in-buffer is the header followed by any in-data, zero padded
        // to the size recorded in the header.
        let make_buf = |size: usize| {
            let mut hdr = hdr_in;
            hdr.data_size = size as u32;
            let mut v = Vec::with_capacity(size);
            v.extend_from_slice(slice_from_c_struct(&hdr));
            if let Some(in_data) = in_data {
                v.extend_from_slice(in_data);
            }
            v.resize(size, 0);
            v
        };

        let mut v = make_buf(cmp::max(
            MIN_BUF_SIZE,
            hdr_size + in_data.map_or(0, |x| x.len()),
        ));

        let op = request_code_readwrite!(DM_IOCTL, ioctl, hdr_size);
        let hdr_out = loop {
            let res = Errno::result(unsafe { nix_ioctl(self.file.as_raw_fd(), op, v.as_mut_ptr()) });
            let hdr_out: dmi::Struct_dm_ioctl =
                c_struct_from_slice(&v).expect("buffer is at least as large as the header");

            if let Err(err) = res {
                return Err(DmError::Core(Error::Ioctl(
                    ioctl,
                    Some(Box::new(DeviceInfo::from(hdr_in))),
                    Some(Box::new(DeviceInfo::from(hdr_out))),
                    Box::new(err),
                )));
            }

            // If DM was able to write the requested data into the provided buffer, break the loop
            if (hdr_out.flags & DmFlags::DM_BUFFER_FULL.bits()) == 0 {
                break hdr_out;
            }

            // If DM_BUFFER_FULL is set, DM requires more space for the
            // response.  Double the size of the buffer and re-try the ioctl.
            // Never allow the size to exceed u32::MAX.
            let len = v.len();
            if len == u32::MAX as usize {
                return Err(DmError::Core(Error::IoctlResultTooLarge));
            }
            v = make_buf((len as u32).saturating_mul(2) as usize);
        };

        *hdr = hdr_out;

        // Return header data section.
        let data_start = hdr.data_start as usize;
        let data_end = cmp::min(cmp::max(data_start, hdr.data_size as usize), v.len());
        Ok(v[data_start..data_end].to_vec())
    }

    /// Devicemapper version information: Major, Minor, and patchlevel versions.
    pub fn version(&self) -> DmResult<(u32, u32, u32)> {
        let mut hdr = DmOptions::new().to_ioctl_hdr(None, DmFlags::empty());

        self.do_ioctl(dmi::DM_VERSION_CMD as u8, &mut hdr, None)?;

        Ok((hdr.version[0], hdr.version[1], hdr.version[2]))
    }

    /// Remove all DM devices and tables. Use discouraged other than
    /// for debugging.
    ///
    /// Valid flags: DM_DEFERRED_REMOVE
    pub fn remove_all(&self, options: &DmOptions) -> DmResult<()> {
        let mut hdr = options.to_ioctl_hdr(None, DmFlags::DM_DEFERRED_REMOVE);

        self.do_ioctl(dmi::DM_REMOVE_ALL_CMD as u8, &mut hdr, None)?;

        Ok(())
    }

    /// Returns a list of tuples containing DM device names, a Device, which
    /// holds their major and minor device numbers, and on kernels that
    /// support it, each device's last event_nr.
    pub fn list_devices(&self) -> DmResult<Vec<(DmNameBuf, Device, Option<u32>)>> {
        let mut hdr = DmOptions::new().to_ioctl_hdr(None, DmFlags::empty());
        let data_out = self.do_ioctl(dmi::DM_LIST_DEVICES_CMD as u8, &mut hdr, None)?;

        let mut devs = Vec::new();
        if data_out.len() < NAME_LIST_NAME_OFFSET {
            return Ok(devs);
        }

        let mut result = &data_out[..];
        loop {
            let device: dmi::Struct_dm_name_list =
                c_struct_from_slice(result).expect("kernel data is well-formatted");
            if device.dev == 0 && device.next == 0 && devs.is_empty() {
                // An empty list is a single zeroed record.
                break;
            }

            let slc = slice_to_null(&result[NAME_LIST_NAME_OFFSET..])
                .expect("kernel data is well-formatted");
            let dm_name = String::from_utf8_lossy(slc).into_owned();

            devs.push((
                DmNameBuf::new(dm_name).expect("name obtained from kernel"),
                Device::from_kdev_t(device.dev as u32),
                name_list_event_nr(hdr.version[1], result, slc.len()),
            ));

            if device.next == 0 {
                break;
            }

            result = &result[device.next as usize..];
        }

        Ok(devs)
    }

    /// Create a DM device. It starts out in a "suspended" state.
    ///
    /// Valid flags: DM_READONLY, DM_PERSISTENT_DEV
    pub fn device_create(
        &self,
        name: &DmName,
        uuid: Option<&DmUuid>,
        options: &DmOptions,
    ) -> DmResult<DeviceInfo> {
        let mut hdr = options.to_ioctl_hdr(None, DmFlags::DM_READONLY | DmFlags::DM_PERSISTENT_DEV);

        Self::hdr_set_name(&mut hdr, name);
        if let Some(uuid) = uuid {
            Self::hdr_set_uuid(&mut hdr, uuid);
        }

        self.do_ioctl(dmi::DM_DEV_CREATE_CMD as u8, &mut hdr, None)?;

        Ok(DeviceInfo::from(hdr))
    }

    /// Remove a DM device and its mapping tables.
    ///
    /// Valid flags: DM_DEFERRED_REMOVE
    pub fn device_remove(&self, id: &DevId<'_>, options: &DmOptions) -> DmResult<DeviceInfo> {
        let mut hdr = options.to_ioctl_hdr(Some(id), DmFlags::DM_DEFERRED_REMOVE);

        self.do_ioctl(dmi::DM_DEV_REMOVE_CMD as u8, &mut hdr, None)?;

        Ok(DeviceInfo::from(hdr))
    }

    /// Change a DM device's name OR set the device's uuid for the first time.
    ///
    /// Prerequisite: if new == DevId::Name(new_name), old_name != new_name
    /// Prerequisite: if new == DevId::Uuid(uuid), device's current uuid
    /// must be "".
    pub fn device_rename(
        &self,
        old_name: &DmName,
        new: &DevId<'_>,
        options: &DmOptions,
    ) -> DmResult<DeviceInfo> {
        let mut options = options.clone();
        let mut data_in = match *new {
            DevId::Name(name) => name.as_bytes().to_vec(),
            DevId::Uuid(uuid) => {
                options.set_flags(options.flags() | DmFlags::DM_UUID);
                uuid.as_bytes().to_vec()
            }
        };
        data_in.push(b'\0');

        let mut hdr = options.to_ioctl_hdr(None, DmFlags::DM_UUID);
        Self::hdr_set_name(&mut hdr, old_name);

        self.do_ioctl(dmi::DM_DEV_RENAME_CMD as u8, &mut hdr, Some(&data_in))?;

        Ok(DeviceInfo::from(hdr))
    }

    /// Suspend or resume a DM device, depending on if DM_SUSPEND flag
    /// is set or not.
    ///
    /// Resuming a DM device moves a table loaded into the "inactive"
    /// slot by `table_load()` into the "active" slot.
    ///
    /// Valid flags: DM_SUSPEND, DM_NOFLUSH, DM_SKIP_LOCKFS
    pub fn device_suspend(&self, id: &DevId<'_>, options: &DmOptions) -> DmResult<DeviceInfo> {
        let mut hdr = options.to_ioctl_hdr(
            Some(id),
            DmFlags::DM_SUSPEND | DmFlags::DM_NOFLUSH | DmFlags::DM_SKIP_LOCKFS,
        );

        self.do_ioctl(dmi::DM_DEV_SUSPEND_CMD as u8, &mut hdr, None)?;

        Ok(DeviceInfo::from(hdr))
    }

    /// Get DeviceInfo for a device.
    pub fn device_info(&self, id: &DevId<'_>) -> DmResult<DeviceInfo> {
        let mut hdr = DmOptions::new().to_ioctl_hdr(Some(id), DmFlags::empty());

        self.do_ioctl(dmi::DM_DEV_STATUS_CMD as u8, &mut hdr, None)?;

        Ok(DeviceInfo::from(hdr))
    }

    /// Wait for a device to report an event with a number greater than
    /// `event_nr`.
    ///
    /// Once an event occurs, this function behaves just like
    /// `table_status`.
    pub fn device_wait(
        &self,
        id: &DevId<'_>,
        event_nr: u32,
        options: &DmOptions,
    ) -> DmResult<(DeviceInfo, Vec<RawTargetLine>)> {
        let mut hdr = options.to_ioctl_hdr(Some(id), DmFlags::DM_QUERY_INACTIVE_TABLE);
        hdr.event_nr = event_nr;

        let data_out = self.do_ioctl(dmi::DM_DEV_WAIT_CMD as u8, &mut hdr, None)?;

        let status = DM::parse_table_status(hdr.target_count, &data_out);

        Ok((DeviceInfo::from(hdr), status))
    }

    /// Set the geometry of a device. `geometry` is the string
    /// "<cylinders> <heads> <sectors> <start>".
    pub fn device_set_geometry(&self, id: &DevId<'_>, geometry: &str) -> DmResult<DeviceInfo> {
        let mut hdr = DmOptions::new().to_ioctl_hdr(Some(id), DmFlags::empty());

        let mut data_in = geometry.as_bytes().to_vec();
        data_in.push(b'\0');

        self.do_ioctl(dmi::DM_DEV_SET_GEOMETRY_CMD as u8, &mut hdr, Some(&data_in))?;

        Ok(DeviceInfo::from(hdr))
    }

    /// Load targets for a device into its inactive table slot.
    ///
    /// `targets` is an array of (sector_start, sector_length, type, params).
    ///
    /// Valid flags: DM_READONLY
    pub fn table_load(
        &self,
        id: &DevId<'_>,
        targets: &[RawTargetLine],
        options: &DmOptions,
    ) -> DmResult<DeviceInfo> {
        let mut data_in = Vec::new();

        for (start, length, target_type, params) in targets {
            let mut targ: dmi::Struct_dm_target_spec = Default::default();
            targ.sector_start = *start;
            targ.length = *length;
            targ.status = 0;

            assert!(
                target_type.len() < targ.target_type.len(),
                "target type length is checked by TargetType"
            );
            copy_to_c_str(&mut targ.target_type, target_type.as_bytes());

            let mut params = params.as_bytes().to_vec();
            let params_len = params.len();
            params.resize(align_to(params_len + 1usize, 8usize), b'\0');

            targ.next = (size_of::<dmi::Struct_dm_target_spec>() + params.len()) as u32;

            data_in.extend_from_slice(slice_from_c_struct(&targ));
            data_in.extend(params);
        }

        let mut hdr = options.to_ioctl_hdr(Some(id), DmFlags::DM_READONLY);

        // io_ioctl() will set hdr.data_size but we must set target_count
        hdr.target_count = targets.len() as u32;

        self.do_ioctl(dmi::DM_TABLE_LOAD_CMD as u8, &mut hdr, Some(&data_in))?;

        Ok(DeviceInfo::from(hdr))
    }

    /// Clear the "inactive" table for a device.
    pub fn table_clear(&self, id: &DevId<'_>) -> DmResult<DeviceInfo> {
        let mut hdr = DmOptions::new().to_ioctl_hdr(Some(id), DmFlags::empty());

        self.do_ioctl(dmi::DM_TABLE_CLEAR_CMD as u8, &mut hdr, None)?;

        Ok(DeviceInfo::from(hdr))
    }

    /// Query DM for which devices are referenced by the "active"
    /// table for this device.
    ///
    /// Valid flags: DM_QUERY_INACTIVE_TABLE
    pub fn table_deps(
        &self,
        id: &DevId<'_>,
        options: &DmOptions,
    ) -> DmResult<(DeviceInfo, Vec<Device>)> {
        let mut hdr = options.to_ioctl_hdr(Some(id), DmFlags::DM_QUERY_INACTIVE_TABLE);

        let data_out = self.do_ioctl(dmi::DM_TABLE_DEPS_CMD as u8, &mut hdr, None)?;

        let mut devs = Vec::new();
        if let Some(target_deps) = c_struct_from_slice::<dmi::Struct_dm_target_deps>(&data_out) {
            // Note: The DM target_deps struct reserves 64 bits for each entry
            // but only 32 bits is used by kernel "huge" dev_t encoding.
            devs = data_out[size_of::<dmi::Struct_dm_target_deps>()..]
                .chunks_exact(size_of::<u64>())
                .take(target_deps.count as usize)
                .filter_map(c_struct_from_slice::<u64>)
                .map(|d| Device::from_kdev_t(d as u32))
                .collect();
        }

        Ok((DeviceInfo::from(hdr), devs))
    }

    /// Parse a device's table. The table value is in buf, count indicates the
    /// expected number of lines.
    /// Trims trailing white space off final entry on each line.
    // Justification: If the ioctl succeeded, the data is correct and
    // complete. An error in parsing can only result from a change in the
    // kernel. We rely on DM's interface versioning system.
    fn parse_table_status(count: u32, buf: &[u8]) -> Vec<RawTargetLine> {
        let mut targets = Vec::new();
        let spec_size = size_of::<dmi::Struct_dm_target_spec>();
        let mut next_off = 0;

        for _ in 0..count {
            let result = match buf.get(next_off..) {
                Some(result) => result,
                None => break,
            };
            let targ: dmi::Struct_dm_target_spec = match c_struct_from_slice(result) {
                Some(targ) => targ,
                None => break,
            };

            let target_type = {
                let bytes = slice_from_c_struct(&targ.target_type);
                let slc = slice_to_null(bytes).unwrap_or(bytes);
                String::from_utf8_lossy(slc).trim_end().to_owned()
            };

            let params = {
                let rest = &result[spec_size..];
                let slc = slice_to_null(rest).unwrap_or(rest);
                String::from_utf8_lossy(slc).trim_end().to_owned()
            };

            targets.push((targ.sector_start, targ.length, target_type, params));

            next_off += targ.next as usize;
        }
        targets
    }

    /// Return the status of all targets for a device's "active"
    /// table.
    ///
    /// If DM_STATUS_TABLE flag is set, returns the current table value. Otherwise
    /// returns target-specific status information.
    ///
    /// Valid flags: DM_NOFLUSH, DM_STATUS_TABLE, DM_QUERY_INACTIVE_TABLE
    pub fn table_status(
        &self,
        id: &DevId<'_>,
        options: &DmOptions,
    ) -> DmResult<(DeviceInfo, Vec<RawTargetLine>)> {
        let mut hdr = options.to_ioctl_hdr(
            Some(id),
            DmFlags::DM_NOFLUSH | DmFlags::DM_STATUS_TABLE | DmFlags::DM_QUERY_INACTIVE_TABLE,
        );

        let data_out = self.do_ioctl(dmi::DM_TABLE_STATUS_CMD as u8, &mut hdr, None)?;

        let status = DM::parse_table_status(hdr.target_count, &data_out);

        Ok((DeviceInfo::from(hdr), status))
    }

    /// Returns a list of each loaded target type with its name, and
    /// version broken into major, minor, and patchlevel.
    pub fn list_versions(&self) -> DmResult<Vec<(String, u32, u32, u32)>> {
        let mut hdr = DmOptions::new().to_ioctl_hdr(None, DmFlags::empty());

        let data_out = self.do_ioctl(dmi::DM_LIST_VERSIONS_CMD as u8, &mut hdr, None)?;

        let mut targets = Vec::new();
        let mut result = &data_out[..];
        while let Some(tver) = c_struct_from_slice::<dmi::Struct_dm_target_versions>(result) {
            let name_slc = slice_to_null(&result[size_of::<dmi::Struct_dm_target_versions>()..])
                .expect("kernel data is well-formatted");
            let name = String::from_utf8_lossy(name_slc).into_owned();
            targets.push((name, tver.version[0], tver.version[1], tver.version[2]));

            if tver.next == 0 {
                break;
            }

            result = &result[tver.next as usize..];
        }

        Ok(targets)
    }

    /// Send a message to the device specified by id and the sector
    /// specified by sector. If sending to the whole device, set sector to
    /// None.
    pub fn target_msg(
        &self,
        id: &DevId<'_>,
        sector: Option<u64>,
        msg: &str,
    ) -> DmResult<(DeviceInfo, Option<String>)> {
        let mut hdr = DmOptions::new().to_ioctl_hdr(Some(id), DmFlags::empty());

        let mut msg_struct: dmi::Struct_dm_target_msg = Default::default();
        msg_struct.sector = sector.unwrap_or_default();
        let mut data_in = slice_from_c_struct(&msg_struct).to_vec();

        data_in.extend(msg.as_bytes());
        data_in.push(b'\0');

        let data_out = self.do_ioctl(dmi::DM_TARGET_MSG_CMD as u8, &mut hdr, Some(&data_in))?;

        let output = if (hdr.flags & DmFlags::DM_DATA_OUT.bits()) > 0 {
            slice_to_null(&data_out).map(|slc| String::from_utf8_lossy(slc).into_owned())
        } else {
            None
        };
        Ok((DeviceInfo::from(hdr), output))
    }
}
