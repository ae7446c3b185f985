// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tasks: single device-mapper operations.
//!
//! A task is created for one kind of operation, configured, and run exactly
//! once. Configuration only records values in the native task; nothing
//! happens until `run`. Once run, a task can be queried for the data the
//! operation produced but can be neither reconfigured nor run again. The
//! native task is released when the `Task` is dropped.

mod engine;
mod types;

pub use self::{
    engine::{Engine, NativeTask},
    types::{
        AddNodePolicy, Deps, Geometry, Info, TargetCursor, TargetLine, TargetVersion, TaskKind,
    },
};

use crate::{
    core::{errors::Error, DmName, DmNameBuf, DmUdevFlags, DmUuid, Device},
    dm_log::{self, Captured},
    result::{DmError, DmResult},
    udev::UdevCookie,
    units::Sectors,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TaskState {
    Configuring,
    Executed { succeeded: bool },
}

/// One device-mapper operation.
pub struct Task<N: NativeTask> {
    kind: TaskKind,
    native: N,
    state: TaskState,
    captured: Captured,
}

impl<N: NativeTask> std::fmt::Debug for Task<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("captured", &self.captured)
            .finish()
    }
}

impl<N: NativeTask> Task<N> {
    /// Create a task of the given kind.
    pub fn new<E>(engine: &E, kind: TaskKind) -> DmResult<Task<N>>
    where
        E: Engine<Task = N>,
    {
        let native = engine.task_create(kind).map_err(|err| {
            debug!("Engine could not create {} task: {}", kind, err);
            DmError::Core(Error::TaskCreate(kind))
        })?;
        Ok(Task {
            kind,
            native,
            state: TaskState::Configuring,
            captured: Captured::default(),
        })
    }

    /// Create a task of the given kind for the named device.
    pub fn new_named<E>(engine: &E, kind: TaskKind, name: &DmName) -> DmResult<Task<N>>
    where
        E: Engine<Task = N>,
    {
        let mut task = Task::new(engine, kind)
            .map_err(|err| err.chain(format!("Can't create task of type {kind}")))?;
        task.set_name(name)
            .map_err(|err| err.chain(format!("Can't set task name {name}")))?;
        Ok(task)
    }

    /// The kind of operation this task performs.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// The failure causes observed during the run. Default before the run.
    pub fn captured(&self) -> Captured {
        self.captured
    }

    fn check_configuring(&self) -> DmResult<()> {
        match self.state {
            TaskState::Configuring => Ok(()),
            TaskState::Executed { .. } => Err(DmError::Core(Error::TaskExecuted(self.kind))),
        }
    }

    fn check_succeeded<F>(&self, err: F) -> DmResult<()>
    where
        F: FnOnce(String) -> Error,
    {
        match self.state {
            TaskState::Executed { succeeded: true } => Ok(()),
            TaskState::Executed { succeeded: false } => Err(DmError::Core(err(format!(
                "{} task did not succeed",
                self.kind
            )))),
            TaskState::Configuring => Err(DmError::Core(err(format!(
                "{} task has not been run",
                self.kind
            )))),
        }
    }

    /// Set the device name.
    pub fn set_name(&mut self, name: &DmName) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_name(name)
            .map_err(|err| DmError::Core(Error::SetName(err.to_string())))
    }

    /// Set the uuid of a device to be created.
    pub fn set_uuid(&mut self, uuid: &DmUuid) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_uuid(uuid)
            .map_err(|err| DmError::Core(Error::SetUuid(err.to_string())))
    }

    /// Set the new name of a device to be renamed.
    pub fn set_new_name(&mut self, name: &DmName) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_new_name(name)
            .map_err(|err| DmError::Core(Error::SetNewName(err.to_string())))
    }

    /// Set the message of a target message task.
    pub fn set_message(&mut self, message: &str) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_message(message)
            .map_err(|err| DmError::Core(Error::SetMessage(err.to_string())))
    }

    /// Set the sector a target message is addressed to.
    pub fn set_sector(&mut self, sector: Sectors) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_sector(sector)
            .map_err(|err| DmError::Core(Error::SetSector(err.to_string())))
    }

    /// Make the device read-only.
    pub fn set_read_only(&mut self) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_read_only()
            .map_err(|err| DmError::Core(Error::SetReadOnly(err.to_string())))
    }

    /// Append a target to the table the task loads.
    pub fn add_target(&mut self, target: &TargetLine) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .add_target(target)
            .map_err(|err| DmError::Core(Error::AddTarget(err.to_string())))
    }

    /// Set when the device node of a created device is made.
    pub fn set_add_node(&mut self, policy: AddNodePolicy) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_add_node(policy)
            .map_err(|err| DmError::Core(Error::SetAddNode(err.to_string())))
    }

    /// Attach a udev cookie to the task and store it in `cookie`. The
    /// cookie must be waited on, whatever the outcome of the run. The wait
    /// may also come before the task is dropped without having run.
    pub fn set_cookie(
        &mut self,
        cookie: Option<&mut UdevCookie>,
        flags: DmUdevFlags,
    ) -> DmResult<()> {
        let slot = cookie.ok_or(DmError::Core(Error::NilCookie))?;
        self.check_configuring()?;
        let value = self
            .native
            .set_cookie(flags)
            .map_err(|err| DmError::Core(Error::SetCookie(err.to_string())))?;
        *slot = UdevCookie::new(value);
        Ok(())
    }

    /// Set the geometry of a set geometry task.
    pub fn set_geometry(&mut self, geometry: &Geometry) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_geometry(geometry)
            .map_err(|err| DmError::Core(Error::SetGeometry(err.to_string())))
    }

    /// Set the event number a wait event task waits past.
    pub fn set_event_nr(&mut self, event_nr: u32) -> DmResult<()> {
        self.check_configuring()?;
        self.native
            .set_event_nr(event_nr)
            .map_err(|err| DmError::Core(Error::SetEventNr(err.to_string())))
    }

    /// Perform the operation. A task can be run only once, whether the run
    /// succeeds or not.
    pub fn run(&mut self) -> DmResult<()> {
        self.check_configuring()?;
        let native = &mut self.native;
        let (result, captured) = dm_log::capture(|| native.run());
        self.captured = captured;
        self.state = TaskState::Executed {
            succeeded: result.is_ok(),
        };
        result.map_err(|err| DmError::Core(Error::TaskRun(self.kind, err.to_string())))
    }

    /// The devices the device's table depends on.
    pub fn deps(&self) -> DmResult<Deps> {
        self.check_succeeded(Error::GetDeps)?;
        self.native
            .deps()
            .ok_or_else(|| DmError::Core(Error::GetDeps("no dependency data".into())))
    }

    /// Device info as of the run.
    pub fn info(&self) -> DmResult<Info> {
        self.check_succeeded(Error::GetInfo)?;
        self.native
            .info()
            .ok_or_else(|| DmError::Core(Error::GetInfo("no device info".into())))
    }

    /// The kernel driver version.
    pub fn driver_version(&self) -> DmResult<String> {
        self.check_succeeded(Error::GetDriverVersion)?;
        self.native
            .driver_version()
            .ok_or_else(|| DmError::Core(Error::GetDriverVersion("no version data".into())))
    }

    /// The target at `cursor`, and the cursor for the target after it.
    /// Start with `TargetCursor::START`; the cursor returned with the last
    /// target is `TargetCursor::END`.
    pub fn next_target(
        &self,
        cursor: TargetCursor,
    ) -> DmResult<(TargetCursor, Option<TargetLine>)> {
        self.check_succeeded(Error::GetTarget)?;
        self.native
            .next_target(cursor)
            .map_err(|err| DmError::Core(Error::GetTarget(err.to_string())))
    }

    /// Iterate over all the targets the run returned.
    pub fn targets(&self) -> Targets<'_, N> {
        Targets {
            task: self,
            cursor: Some(TargetCursor::START),
        }
    }

    /// The devices a list task found.
    pub fn names(&self) -> DmResult<Vec<(DmNameBuf, Device)>> {
        self.check_succeeded(Error::GetNames)?;
        self.native
            .names()
            .ok_or_else(|| DmError::Core(Error::GetNames("no device list".into())))
    }

    /// The target types a list versions task found.
    pub fn target_versions(&self) -> DmResult<Vec<TargetVersion>> {
        self.check_succeeded(Error::GetTargetVersions)?;
        self.native
            .target_versions()
            .ok_or_else(|| DmError::Core(Error::GetTargetVersions("no version list".into())))
    }
}

/// Lazy iterator over a task's targets.
pub struct Targets<'a, N: NativeTask> {
    task: &'a Task<N>,
    cursor: Option<TargetCursor>,
}

impl<N: NativeTask> Iterator for Targets<'_, N> {
    type Item = DmResult<TargetLine>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.take()?;
        match self.task.next_target(cursor) {
            Ok((next, line)) => {
                if !next.is_end() {
                    self.cursor = Some(next);
                }
                line.map(Ok)
            }
            Err(err) => Some(Err(err)),
        }
    }
}
