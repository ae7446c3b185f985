// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The kernel engine: tasks performed with device-mapper ioctls on
//! /dev/mapper/control.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use nix::errno::Errno;

use crate::{
    core::{
        dm_udev_sync, errors::Error, DevId, DeviceInfo, DmFlags, DmName, DmNameBuf, DmOptions,
        DmUdevFlags, DmUuid, DmUuidBuf, RawTargetLine, TargetTypeBuf, DM,
    },
    dm_log::{dm_log, LOG_ERR, LOG_WARN},
    result::{DmError, DmResult},
    task::{
        AddNodePolicy, Deps, Engine, Geometry, Info, NativeTask, TargetCursor, TargetLine,
        TargetVersion, TaskKind,
    },
    units::Sectors,
};

/// Device nodes live under this directory unless told otherwise.
pub const DEFAULT_DEV_DIR: &str = "/dev";

/// Cookies set on tasks that have not run. The task's reference on such a
/// cookie is released once, by the first of: the task running, the task
/// being dropped, or a wait on the cookie.
#[derive(Debug, Default)]
struct PendingCookies(Mutex<HashSet<u32>>);

impl PendingCookies {
    fn insert(&self, cookie: u32) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cookie);
    }

    /// True if the cookie was pending. It no longer is.
    fn take(&self, cookie: u32) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cookie)
    }
}

/// Release a task's reference on a cookie for which udev will see no event.
fn release_cookie(cookie: u32) {
    if let Err(err) = dm_udev_sync::cookie_uevent_missed(cookie) {
        dm_log(
            LOG_WARN,
            file!(),
            line!(),
            0,
            &format!("Failed to release udev cookie {cookie:#x}: {err}"),
        );
    }
}

/// Performs tasks on the running kernel.
#[derive(Debug)]
pub struct IoctlEngine {
    dm: Arc<DM>,
    dev_dir: Mutex<PathBuf>,
    pending: Arc<PendingCookies>,
}

impl IoctlEngine {
    /// Open the device-mapper control device.
    pub fn new() -> DmResult<IoctlEngine> {
        Ok(IoctlEngine {
            dm: Arc::new(DM::new()?),
            dev_dir: Mutex::new(PathBuf::from(DEFAULT_DEV_DIR)),
            pending: Arc::new(PendingCookies::default()),
        })
    }
}

impl Engine for IoctlEngine {
    type Task = IoctlTask;

    fn task_create(&self, kind: TaskKind) -> DmResult<IoctlTask> {
        Ok(IoctlTask::new(
            Arc::clone(&self.dm),
            Arc::clone(&self.pending),
            kind,
        ))
    }

    fn udev_wait(&self, cookie: u32) -> DmResult<()> {
        // A waiter on the cookie of a task that never ran would block
        // forever on the task's reference.
        if self.pending.take(cookie) {
            debug!("Releasing udev cookie {:#x} of a task that did not run", cookie);
            release_cookie(cookie);
        }
        dm_udev_sync::cookie_wait(cookie)
    }

    fn set_dev_dir(&self, dir: &Path) -> DmResult<()> {
        if !dir.is_absolute() {
            return Err(DmError::Core(Error::SetDevDir(
                dir.to_owned(),
                "not an absolute path".into(),
            )));
        }
        *self.dev_dir.lock().unwrap_or_else(PoisonError::into_inner) = dir.to_owned();
        Ok(())
    }

    fn dev_dir(&self) -> PathBuf {
        self.dev_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn library_version(&self) -> DmResult<String> {
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }
}

/// The errno of a failed ioctl, 0 for any other error.
fn errno_of(err: &DmError) -> i32 {
    match err {
        DmError::Core(Error::Ioctl(_, _, _, errno)) => **errno as i32,
        _ => 0,
    }
}

fn is_enxio(err: &DmError) -> bool {
    errno_of(err) == Errno::ENXIO as i32
}

fn target_line_from(raw: RawTargetLine) -> DmResult<TargetLine> {
    let (start, length, target_type, params) = raw;
    Ok(TargetLine::new(
        Sectors(start),
        Sectors(length),
        TargetTypeBuf::new(target_type)?,
        params,
    ))
}

fn raw_from(line: &TargetLine) -> RawTargetLine {
    (
        *line.start,
        *line.length,
        line.target_type.to_string(),
        line.params.clone(),
    )
}

/// Configuration and results of one ioctl task.
#[derive(Debug)]
pub struct IoctlTask {
    dm: Arc<DM>,
    pending: Arc<PendingCookies>,
    kind: TaskKind,
    name: Option<DmNameBuf>,
    uuid: Option<DmUuidBuf>,
    new_name: Option<DmNameBuf>,
    message: Option<String>,
    sector: Sectors,
    read_only: bool,
    targets: Vec<TargetLine>,
    add_node: AddNodePolicy,
    cookie: Option<(u32, DmUdevFlags)>,
    geometry: Option<Geometry>,
    event_nr: u32,
    uevent_generated: bool,
    info: Option<Info>,
    deps: Option<Deps>,
    table: Option<Vec<TargetLine>>,
    driver_version: Option<String>,
    names: Option<Vec<(DmNameBuf, crate::core::Device)>>,
    target_versions: Option<Vec<TargetVersion>>,
}

impl IoctlTask {
    fn new(dm: Arc<DM>, pending: Arc<PendingCookies>, kind: TaskKind) -> IoctlTask {
        IoctlTask {
            dm,
            pending,
            kind,
            name: None,
            uuid: None,
            new_name: None,
            message: None,
            sector: Sectors(0),
            read_only: false,
            targets: Vec::new(),
            add_node: AddNodePolicy::OnResume,
            cookie: None,
            geometry: None,
            event_nr: 0,
            uevent_generated: false,
            info: None,
            deps: None,
            table: None,
            driver_version: None,
            names: None,
            target_versions: None,
        }
    }

    fn name(&self) -> DmResult<&DmName> {
        self.name.as_deref().ok_or_else(|| {
            DmError::Core(Error::InvalidArgument(format!(
                "{} task requires a device name",
                self.kind
            )))
        })
    }

    /// Options carrying the task's cookie, if it has one.
    fn cookie_options(&self) -> DmOptions {
        let mut options = DmOptions::default();
        if let Some((cookie, flags)) = self.cookie {
            if cookie != 0 {
                options
                    .set_cookie(cookie)
                    .set_udev_flags(flags | DmUdevFlags::DM_UDEV_PRIMARY_SOURCE_FLAG);
            }
        }
        options
    }

    fn read_only_options(&self) -> DmOptions {
        let mut options = DmOptions::default();
        if self.read_only {
            options.set_flags(DmFlags::DM_READONLY);
        }
        options
    }

    fn note_uevent(&mut self, info: &DeviceInfo) {
        self.uevent_generated |= info.uevent_generated();
    }

    /// Record the result of a query whose device may not exist.
    fn query_result<T>(&mut self, result: DmResult<(DeviceInfo, T)>) -> DmResult<Option<T>> {
        match result {
            Ok((info, data)) => {
                self.info = Some(Info::from(&info));
                Ok(Some(data))
            }
            Err(err) if is_enxio(&err) => {
                self.info = Some(Info::default());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn create(&mut self) -> DmResult<()> {
        let name = self.name()?.to_owned();
        let dm = Arc::clone(&self.dm);
        let id = DevId::Name(&name);

        debug!(
            "Creating device {} with {} targets, add node {:?}",
            name,
            self.targets.len(),
            self.add_node
        );
        let info = dm.device_create(
            &name,
            self.uuid.as_deref(),
            &self.read_only_options(),
        )?;
        if self.targets.is_empty() {
            self.info = Some(Info::from(&info));
            return Ok(());
        }

        let table = self.targets.iter().map(raw_from).collect::<Vec<_>>();
        if let Err(err) = dm.table_load(&id, &table, &self.read_only_options()) {
            Self::revert_create(&dm, &name, "its table failed to load");
            return Err(err);
        }

        match dm.device_suspend(&id, &self.cookie_options()) {
            Ok(info) => {
                self.note_uevent(&info);
                self.info = Some(Info::from(&info));
                Ok(())
            }
            Err(err) => {
                Self::revert_create(&dm, &name, "it failed to resume");
                Err(err)
            }
        }
    }

    /// Remove a device whose creation failed part way.
    fn revert_create(dm: &DM, name: &DmName, reason: &str) {
        if let Err(err) = dm.device_remove(&DevId::Name(name), &DmOptions::default()) {
            warn!("Failed to remove device {} after {}: {}", name, reason, err);
        }
    }

    fn dispatch(&mut self) -> DmResult<()> {
        let dm = Arc::clone(&self.dm);
        match self.kind {
            TaskKind::Create => self.create(),
            TaskKind::Reload => {
                let table = self.targets.iter().map(raw_from).collect::<Vec<_>>();
                let info =
                    dm.table_load(&DevId::Name(self.name()?), &table, &self.read_only_options())?;
                self.info = Some(Info::from(&info));
                Ok(())
            }
            TaskKind::Remove => {
                let info = dm.device_remove(&DevId::Name(self.name()?), &self.cookie_options())?;
                self.note_uevent(&info);
                Ok(())
            }
            TaskKind::RemoveAll => dm.remove_all(&DmOptions::default()),
            TaskKind::Suspend => {
                let mut options = DmOptions::default();
                options.set_flags(DmFlags::DM_SUSPEND);
                let info = dm.device_suspend(&DevId::Name(self.name()?), &options)?;
                self.info = Some(Info::from(&info));
                Ok(())
            }
            TaskKind::Resume => {
                let info = dm.device_suspend(&DevId::Name(self.name()?), &self.cookie_options())?;
                self.note_uevent(&info);
                self.info = Some(Info::from(&info));
                Ok(())
            }
            TaskKind::Info => {
                let result = dm.device_info(&DevId::Name(self.name()?)).map(|i| (i, ()));
                self.query_result(result)?;
                Ok(())
            }
            TaskKind::Deps => {
                let (info, devs) =
                    dm.table_deps(&DevId::Name(self.name()?), &DmOptions::default())?;
                self.info = Some(Info::from(&info));
                self.deps = Some(Deps::new(
                    devs.into_iter()
                        .map(|dev| nix::libc::dev_t::from(dev) as u64)
                        .collect(),
                ));
                Ok(())
            }
            TaskKind::Rename => {
                let new_name = self.new_name.clone().ok_or_else(|| {
                    DmError::Core(Error::InvalidArgument(
                        "rename task requires a new name".into(),
                    ))
                })?;
                let info = dm.device_rename(
                    self.name()?,
                    &DevId::Name(&new_name),
                    &self.cookie_options(),
                )?;
                self.note_uevent(&info);
                Ok(())
            }
            TaskKind::Version => {
                let (major, minor, patch) = dm.version()?;
                self.driver_version = Some(format!("{major}.{minor}.{patch}"));
                Ok(())
            }
            TaskKind::Status | TaskKind::Table => {
                let mut options = DmOptions::default();
                if self.kind == TaskKind::Table {
                    options.set_flags(DmFlags::DM_STATUS_TABLE);
                }
                let result = dm.table_status(&DevId::Name(self.name()?), &options);
                let lines = self.query_result(result)?.unwrap_or_default();
                self.table = Some(
                    lines
                        .into_iter()
                        .map(target_line_from)
                        .collect::<DmResult<Vec<_>>>()?,
                );
                Ok(())
            }
            TaskKind::WaitEvent => {
                let (info, lines) = dm.device_wait(
                    &DevId::Name(self.name()?),
                    self.event_nr,
                    &DmOptions::default(),
                )?;
                self.info = Some(Info::from(&info));
                self.table = Some(
                    lines
                        .into_iter()
                        .map(target_line_from)
                        .collect::<DmResult<Vec<_>>>()?,
                );
                Ok(())
            }
            TaskKind::List => {
                self.names = Some(
                    dm.list_devices()?
                        .into_iter()
                        .map(|(name, dev, _)| (name, dev))
                        .collect(),
                );
                Ok(())
            }
            TaskKind::Clear => {
                let info = dm.table_clear(&DevId::Name(self.name()?))?;
                self.info = Some(Info::from(&info));
                Ok(())
            }
            TaskKind::Mknodes => {
                debug!("Device nodes are managed by udev, nothing to make");
                Ok(())
            }
            TaskKind::ListVersions => {
                self.target_versions = Some(
                    dm.list_versions()?
                        .into_iter()
                        .map(|(name, major, minor, patch)| TargetVersion {
                            name,
                            version: (major, minor, patch),
                        })
                        .collect(),
                );
                Ok(())
            }
            TaskKind::TargetMsg => {
                let message = self.message.clone().ok_or_else(|| {
                    DmError::Core(Error::InvalidArgument(
                        "message task requires a message".into(),
                    ))
                })?;
                let (info, response) =
                    dm.target_msg(&DevId::Name(self.name()?), Some(*self.sector), &message)?;
                if let Some(response) = response {
                    debug!("Message \"{}\" returned \"{}\"", message, response);
                }
                self.info = Some(Info::from(&info));
                Ok(())
            }
            TaskKind::SetGeometry => {
                let geometry = self.geometry.ok_or_else(|| {
                    DmError::Core(Error::InvalidArgument(
                        "set geometry task requires a geometry".into(),
                    ))
                })?;
                let info =
                    dm.device_set_geometry(&DevId::Name(self.name()?), &geometry.to_string())?;
                self.info = Some(Info::from(&info));
                Ok(())
            }
        }
    }

    /// The task's cookie, if the task still holds its reference on it.
    fn take_cookie(&self) -> Option<u32> {
        self.cookie
            .map(|(cookie, _)| cookie)
            .filter(|cookie| self.pending.take(*cookie))
    }
}

impl NativeTask for IoctlTask {
    fn set_name(&mut self, name: &DmName) -> DmResult<()> {
        self.name = Some(name.to_owned());
        Ok(())
    }

    fn set_uuid(&mut self, uuid: &DmUuid) -> DmResult<()> {
        self.uuid = Some(uuid.to_owned());
        Ok(())
    }

    fn set_new_name(&mut self, name: &DmName) -> DmResult<()> {
        self.new_name = Some(name.to_owned());
        Ok(())
    }

    fn set_message(&mut self, message: &str) -> DmResult<()> {
        if message.contains('\0') {
            return Err(DmError::Core(Error::InvalidArgument(
                "message contains a NUL character".into(),
            )));
        }
        self.message = Some(message.to_string());
        Ok(())
    }

    fn set_sector(&mut self, sector: Sectors) -> DmResult<()> {
        self.sector = sector;
        Ok(())
    }

    fn set_read_only(&mut self) -> DmResult<()> {
        self.read_only = true;
        Ok(())
    }

    fn add_target(&mut self, target: &TargetLine) -> DmResult<()> {
        if target.params.contains('\0') {
            return Err(DmError::Core(Error::InvalidArgument(
                "target parameters contain a NUL character".into(),
            )));
        }
        self.targets.push(target.clone());
        Ok(())
    }

    fn set_add_node(&mut self, policy: AddNodePolicy) -> DmResult<()> {
        self.add_node = policy;
        Ok(())
    }

    fn set_cookie(&mut self, flags: DmUdevFlags) -> DmResult<u32> {
        if self.cookie.is_some() {
            return Err(DmError::Core(Error::InvalidArgument(
                "task already has a udev cookie".into(),
            )));
        }
        let cookie = dm_udev_sync::cookie_create()?;
        if cookie != 0 {
            self.pending.insert(cookie);
        }
        self.cookie = Some((cookie, flags));
        Ok(cookie)
    }

    fn set_geometry(&mut self, geometry: &Geometry) -> DmResult<()> {
        self.geometry = Some(*geometry);
        Ok(())
    }

    fn set_event_nr(&mut self, event_nr: u32) -> DmResult<()> {
        self.event_nr = event_nr;
        Ok(())
    }

    fn run(&mut self) -> DmResult<()> {
        let cookie = self.take_cookie();
        let result = self.dispatch();
        if let Err(ref err) = result {
            dm_log(
                LOG_ERR,
                file!(),
                line!(),
                errno_of(err),
                &format!(
                    "device-mapper: {} ioctl on {} failed: {}",
                    self.kind,
                    self.name.as_ref().map_or("", |n| n.as_str()),
                    err
                ),
            );
        }
        if let Some(cookie) = cookie {
            if !self.uevent_generated {
                release_cookie(cookie);
            }
        }
        result
    }

    fn deps(&self) -> Option<Deps> {
        self.deps.clone()
    }

    fn info(&self) -> Option<Info> {
        self.info
    }

    fn driver_version(&self) -> Option<String> {
        self.driver_version.clone()
    }

    fn next_target(&self, cursor: TargetCursor) -> DmResult<(TargetCursor, Option<TargetLine>)> {
        let table = self.table.as_ref().ok_or_else(|| {
            DmError::Core(Error::GetTarget(format!("{} task has no table", self.kind)))
        })?;
        if cursor.is_end() {
            return Ok((TargetCursor::END, None));
        }
        let index = cursor.index();
        Ok((
            TargetCursor::after(index, table.len()),
            table.get(index).cloned(),
        ))
    }

    fn names(&self) -> Option<Vec<(DmNameBuf, crate::core::Device)>> {
        self.names.clone()
    }

    fn target_versions(&self) -> Option<Vec<TargetVersion>> {
        self.target_versions.clone()
    }
}

impl Drop for IoctlTask {
    fn drop(&mut self) {
        if let Some(cookie) = self.take_cookie() {
            release_cookie(cookie);
        }
    }
}
