// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use nix::libc::dev_t;

use crate::{
    core::{errors::Error, Device, TargetTypeBuf},
    result::DmError,
    units::Sectors,
};

/// The operation a task performs when run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TaskKind {
    /// Create a device, loading and activating its table if one was given
    Create,
    /// Load a table into the inactive slot of a device
    Reload,
    /// Remove a device
    Remove,
    /// Remove every device
    RemoveAll,
    /// Suspend a device
    Suspend,
    /// Resume a device, swapping in its inactive table if it has one
    Resume,
    /// Query device info
    Info,
    /// Query the devices a device's table depends on
    Deps,
    /// Rename a device
    Rename,
    /// Query the kernel driver version
    Version,
    /// Query target status lines
    Status,
    /// Query the active table
    Table,
    /// Wait for an event on a device
    WaitEvent,
    /// List all devices
    List,
    /// Clear the inactive table
    Clear,
    /// Make device nodes consistent with the kernel
    Mknodes,
    /// List the loaded target types
    ListVersions,
    /// Send a message to a target
    TargetMsg,
    /// Set the geometry of a device
    SetGeometry,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Create => "create",
            TaskKind::Reload => "reload",
            TaskKind::Remove => "remove",
            TaskKind::RemoveAll => "remove_all",
            TaskKind::Suspend => "suspend",
            TaskKind::Resume => "resume",
            TaskKind::Info => "info",
            TaskKind::Deps => "deps",
            TaskKind::Rename => "rename",
            TaskKind::Version => "version",
            TaskKind::Status => "status",
            TaskKind::Table => "table",
            TaskKind::WaitEvent => "waitevent",
            TaskKind::List => "ls",
            TaskKind::Clear => "clear",
            TaskKind::Mknodes => "mknodes",
            TaskKind::ListVersions => "targets",
            TaskKind::TargetMsg => "message",
            TaskKind::SetGeometry => "setgeometry",
        };
        write!(f, "{name}")
    }
}

/// When the device node of a newly created device is made.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddNodePolicy {
    /// When the device is first resumed
    OnResume,
    /// As soon as the device is created
    OnCreate,
}

impl TryFrom<u32> for AddNodePolicy {
    type Error = DmError;

    fn try_from(val: u32) -> Result<AddNodePolicy, DmError> {
        match val {
            0 => Ok(AddNodePolicy::OnResume),
            1 => Ok(AddNodePolicy::OnCreate),
            _ => Err(DmError::Core(Error::InvalidAddNode(val))),
        }
    }
}

/// One line of a device's table: a target mapping a range of sectors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetLine {
    /// The first sector mapped by the target
    pub start: Sectors,
    /// The number of sectors mapped by the target
    pub length: Sectors,
    /// The target type
    pub target_type: TargetTypeBuf,
    /// Target parameters, or target status for status queries
    pub params: String,
}

impl TargetLine {
    /// Make a new TargetLine.
    pub fn new(
        start: Sectors,
        length: Sectors,
        target_type: TargetTypeBuf,
        params: String,
    ) -> TargetLine {
        TargetLine {
            start,
            length,
            target_type,
            params,
        }
    }
}

impl fmt::Display for TargetLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            *self.start, *self.length, self.target_type, self.params
        )
    }
}

/// Position in the list of targets a task returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TargetCursor(usize);

impl TargetCursor {
    /// The position of the first target.
    pub const START: TargetCursor = TargetCursor(0);
    /// The position past the last target.
    pub const END: TargetCursor = TargetCursor(usize::MAX);

    /// The cursor to return after yielding the target at `index` of `len`
    /// targets.
    pub fn after(index: usize, len: usize) -> TargetCursor {
        if index + 1 >= len {
            TargetCursor::END
        } else {
            TargetCursor(index + 1)
        }
    }

    /// The index of the target this cursor points to.
    pub fn index(self) -> usize {
        self.0
    }

    /// True if there are no more targets.
    pub fn is_end(self) -> bool {
        self == TargetCursor::END
    }
}

/// The devices a device's table refers to.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Deps {
    devices: Vec<u64>,
}

impl Deps {
    /// Make Deps from raw device numbers.
    pub fn new(devices: Vec<u64>) -> Deps {
        Deps { devices }
    }

    /// The number of devices.
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// The raw device numbers, in table order.
    pub fn raw(&self) -> &[u64] {
        &self.devices
    }

    /// The device numbers, split into major and minor.
    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|dev| Device::from(*dev as dev_t))
            .collect()
    }
}

/// A snapshot of the state of a device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Info {
    /// The device exists; the other fields are meaningless if it doesn't
    pub exists: bool,
    /// The device is suspended
    pub suspended: bool,
    /// The device has an active table
    pub live_table: bool,
    /// The device has an inactive table loaded
    pub inactive_table: bool,
    /// The number of openers of the device
    pub open_count: i32,
    /// The device's last event number
    pub event_nr: u32,
    /// Major device number
    pub major: u32,
    /// Minor device number
    pub minor: u32,
    /// The device is read-only
    pub read_only: bool,
    /// The number of targets in the device's table
    pub target_count: u32,
}

/// A target type the kernel has loaded, with its version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetVersion {
    /// Target type name
    pub name: String,
    /// Major, minor and patch level
    pub version: (u32, u32, u32),
}

/// The legacy CHS geometry of a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Number of cylinders
    pub cylinders: u32,
    /// Number of heads
    pub heads: u32,
    /// Sectors per track
    pub sectors: u32,
    /// Start offset in sectors
    pub start: u64,
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.cylinders, self.heads, self.sectors, self.start
        )
    }
}
