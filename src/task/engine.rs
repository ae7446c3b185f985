// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The boundary between tasks and whatever actually performs them.
//!
//! An `Engine` hands out native tasks and owns the process level state:
//! the device directory and udev synchronization. A `NativeTask` accepts
//! configuration, runs once, and afterwards exposes whatever data the run
//! produced. Engines report run failures by calling `dm_log::dm_log` with
//! the errno and message of the failure before returning the error.

use std::path::{Path, PathBuf};

use crate::{
    core::{DmName, DmNameBuf, DmUdevFlags, DmUuid, Device},
    result::DmResult,
    task::types::{
        AddNodePolicy, Deps, Geometry, Info, TargetCursor, TargetLine, TargetVersion, TaskKind,
    },
    units::Sectors,
};

/// A provider of native tasks.
pub trait Engine {
    /// The native task type this engine creates.
    type Task: NativeTask;

    /// Allocate a native task of the given kind.
    fn task_create(&self, kind: TaskKind) -> DmResult<Self::Task>;

    /// Block until udev has processed all events tagged with `cookie`.
    fn udev_wait(&self, cookie: u32) -> DmResult<()>;

    /// Set the directory in which device nodes are found.
    fn set_dev_dir(&self, dir: &Path) -> DmResult<()>;

    /// The directory in which device nodes are found.
    fn dev_dir(&self) -> PathBuf;

    /// The version of the engine's library.
    fn library_version(&self) -> DmResult<String>;
}

/// A single native operation. Setters only record configuration; nothing is
/// observable until `run`.
pub trait NativeTask {
    /// Set the name of the device the task operates on.
    fn set_name(&mut self, name: &DmName) -> DmResult<()>;

    /// Set the uuid of a device to be created.
    fn set_uuid(&mut self, uuid: &DmUuid) -> DmResult<()>;

    /// Set the new name for a rename task.
    fn set_new_name(&mut self, name: &DmName) -> DmResult<()>;

    /// Set the message for a target message task.
    fn set_message(&mut self, message: &str) -> DmResult<()>;

    /// Set the sector a target message is addressed to.
    fn set_sector(&mut self, sector: Sectors) -> DmResult<()>;

    /// Mark the device read-only.
    fn set_read_only(&mut self) -> DmResult<()>;

    /// Append a target to the task's table.
    fn add_target(&mut self, target: &TargetLine) -> DmResult<()>;

    /// Set when a created device's node is made.
    fn set_add_node(&mut self, policy: AddNodePolicy) -> DmResult<()>;

    /// Attach a fresh udev cookie with the given udev flags to the task and
    /// return it.
    fn set_cookie(&mut self, flags: DmUdevFlags) -> DmResult<u32>;

    /// Set the geometry for a set geometry task.
    fn set_geometry(&mut self, geometry: &Geometry) -> DmResult<()>;

    /// Set the event number a wait event task waits past.
    fn set_event_nr(&mut self, event_nr: u32) -> DmResult<()>;

    /// Perform the operation.
    fn run(&mut self) -> DmResult<()>;

    /// Dependencies reported by the run, if any.
    fn deps(&self) -> Option<Deps>;

    /// Device info reported by the run, if any.
    fn info(&self) -> Option<Info>;

    /// The kernel driver version reported by the run, if any.
    fn driver_version(&self) -> Option<String>;

    /// The target at `cursor` and the cursor of the target after it.
    fn next_target(&self, cursor: TargetCursor) -> DmResult<(TargetCursor, Option<TargetLine>)>;

    /// The device list reported by the run, if any.
    fn names(&self) -> Option<Vec<(DmNameBuf, Device)>>;

    /// The target versions reported by the run, if any.
    fn target_versions(&self) -> Option<Vec<TargetVersion>>;
}
