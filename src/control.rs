// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The control plane: device-mapper operations as single calls.
//!
//! Each call builds one or more tasks, runs them and waits on udev where
//! the operation changes device nodes. Errors name the operation and the
//! device they occurred on; busy and already exists failures keep their
//! kind through the annotation.

use std::path::{Path, PathBuf};

use crate::{
    core::{DmName, DmNameBuf, DmUdevFlags, Device},
    ioctl_engine::IoctlEngine,
    result::{DmError, DmResult, ErrorEnum},
    task::{Deps, Engine, Info, TargetCursor, TargetLine, TargetVersion, Task, TaskKind},
    udev::{CookieWait, UdevCookie},
    units::Sectors,
};

/// The number of ids tried when allocating a thin device id.
pub const DEFAULT_ID_ALLOC_ATTEMPTS: usize = 1024;

/// Tunables of a `DevMapper`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DevMapperOptions {
    /// Upper bound on the number of ids tried by each id allocation
    pub id_alloc_attempts: usize,
    /// Whether to wait for udev after operations that change device nodes
    pub udev_sync: bool,
}

impl Default for DevMapperOptions {
    fn default() -> DevMapperOptions {
        DevMapperOptions {
            id_alloc_attempts: DEFAULT_ID_ALLOC_ATTEMPTS,
            udev_sync: true,
        }
    }
}

/// Entry point for thin pool and thin device management.
#[derive(Debug)]
pub struct DevMapper<E: Engine = IoctlEngine> {
    pub(crate) engine: E,
    pub(crate) options: DevMapperOptions,
}

impl DevMapper<IoctlEngine> {
    /// Manage the devices of the running kernel.
    pub fn new() -> DmResult<DevMapper<IoctlEngine>> {
        Ok(DevMapper::with_engine(
            IoctlEngine::new()?,
            DevMapperOptions::default(),
        ))
    }
}

impl<E: Engine> DevMapper<E> {
    /// Manage devices through the given engine.
    pub fn with_engine(engine: E, options: DevMapperOptions) -> DevMapper<E> {
        DevMapper { engine, options }
    }

    /// The engine in use.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The options in use.
    pub fn options(&self) -> &DevMapperOptions {
        &self.options
    }

    pub(crate) fn task(&self, kind: TaskKind, name: &DmName) -> DmResult<Task<E::Task>> {
        Task::new_named(&self.engine, kind, name)
    }

    /// Attach a cookie to the task and return the guard that waits on it.
    /// Returns None if udev synchronization is off.
    pub(crate) fn udev_cookie(
        &self,
        task: &mut Task<E::Task>,
        flags: DmUdevFlags,
    ) -> DmResult<Option<CookieWait<'_, E>>> {
        if !self.options.udev_sync {
            return Ok(None);
        }
        let mut cookie = UdevCookie::default();
        task.set_cookie(Some(&mut cookie), flags)
            .map_err(|err| err.chain("Can't set cookie"))?;
        Ok(Some(CookieWait::new(&self.engine, cookie)))
    }

    /// Run a task that carries a cookie and wait on the cookie, whatever the
    /// outcome of the run. If both fail, the run failure is returned with
    /// the wait failure added to it; its kind is kept.
    pub(crate) fn run_and_wait<F>(
        &self,
        task: &mut Task<E::Task>,
        wait: Option<CookieWait<'_, E>>,
        run: F,
    ) -> DmResult<()>
    where
        F: FnOnce(&mut Task<E::Task>) -> DmResult<()>,
    {
        let result = run(task);
        let waited = wait.map_or(Ok(()), |wait| wait.finish());
        match (result, waited) {
            (Ok(()), waited) => waited,
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(wait_err)) => {
                warn!("Waiting on udev after a failed run failed too: {}", wait_err);
                Err(match err {
                    DmError::Dm(kind, msg) => {
                        DmError::Dm(kind, format!("{msg}, and waiting on udev failed: {wait_err}"))
                    }
                    err => err.chain(format!("waiting on udev failed: {wait_err}")),
                })
            }
        }
    }

    /// Send a message to sector 0 of the pool's thin-pool target.
    pub(crate) fn message_task(&self, pool: &DmName, message: &str) -> DmResult<Task<E::Task>> {
        let mut task = self.task(TaskKind::TargetMsg, pool)?;
        task.set_sector(Sectors(0))
            .map_err(|err| err.chain("Can't set sector"))?;
        task.set_message(message)
            .map_err(|err| err.chain("Can't set message"))?;
        Ok(task)
    }

    /// The devices the device's table depends on.
    pub fn get_deps(&self, name: &DmName) -> DmResult<Deps> {
        let mut task = self.task(TaskKind::Deps, name)?;
        task.run()?;
        task.deps()
    }

    /// Info about the named device. A device that doesn't exist yields Info
    /// with `exists` false.
    pub fn get_info(&self, name: &DmName) -> DmResult<Info> {
        let mut task = self.task(TaskKind::Info, name)?;
        task.run()?;
        task.info()
    }

    /// The version of the kernel's device-mapper driver.
    pub fn get_driver_version(&self) -> DmResult<String> {
        let mut task = Task::new(&self.engine, TaskKind::Version)
            .map_err(|err| err.chain("Can't create version task"))?;
        task.run()?;
        task.driver_version()
    }

    /// The target types the kernel has loaded, with their versions.
    pub fn list_target_versions(&self) -> DmResult<Vec<TargetVersion>> {
        let mut task = Task::new(&self.engine, TaskKind::ListVersions)
            .map_err(|err| err.chain("Can't create target versions task"))?;
        task.run()?;
        task.target_versions()
    }

    /// The status line of the first target of the named device.
    pub fn get_status(&self, name: &DmName) -> DmResult<TargetLine> {
        let mut task = self.task(TaskKind::Status, name).map_err(|err| {
            debug!("get_status: error creating task: {}", err);
            err
        })?;
        task.run().map_err(|err| {
            debug!("get_status: error running task: {}", err);
            err
        })?;

        let info = task.info()?;
        if !info.exists {
            debug!("get_status: non-existing device {}", name);
            return Err(DmError::Dm(
                ErrorEnum::NotFound,
                format!("non-existing device {name}"),
            ));
        }

        match task.next_target(TargetCursor::START)? {
            (_, Some(line)) => Ok(line),
            (_, None) => Err(DmError::Dm(
                ErrorEnum::NotFound,
                format!("device {name} has no targets"),
            )),
        }
    }

    /// All the targets of the active table of the named device.
    pub fn get_table(&self, name: &DmName) -> DmResult<Vec<TargetLine>> {
        let mut task = self.task(TaskKind::Table, name)?;
        task.run()?;
        if !task.info()?.exists {
            return Err(DmError::Dm(
                ErrorEnum::NotFound,
                format!("non-existing device {name}"),
            ));
        }
        task.targets().collect()
    }

    /// Every device-mapper device.
    pub fn list_devices(&self) -> DmResult<Vec<(DmNameBuf, Device)>> {
        let mut task = Task::new(&self.engine, TaskKind::List)
            .map_err(|err| err.chain("Can't create list task"))?;
        task.run()?;
        task.names()
    }

    /// Set the directory device nodes are found in.
    pub fn set_dev_dir(&self, dir: &Path) -> DmResult<()> {
        self.engine.set_dev_dir(dir).map_err(|err| {
            debug!("Error setting device directory: {}", err);
            err
        })
    }

    /// The directory device nodes are found in.
    pub fn dev_dir(&self) -> PathBuf {
        self.engine.dev_dir()
    }

    /// The path of the device node of a device-mapper device.
    pub fn device_path(&self, name: &DmName) -> PathBuf {
        let mut path = self.engine.dev_dir();
        path.push("mapper");
        path.push(name.as_str());
        path
    }

    /// The version of the device-mapper library in use.
    pub fn get_library_version(&self) -> DmResult<String> {
        self.engine.library_version()
    }

    /// Remove a device, waiting for udev to remove its node.
    pub fn remove_device(&self, name: &DmName) -> DmResult<()> {
        debug!("Removing device {}", name);
        let mut task = self.task(TaskKind::Remove, name)?;
        let wait = self.udev_cookie(&mut task, DmUdevFlags::empty())?;
        self.run_and_wait(&mut task, wait, crate::classify::run_classified)
            .map_err(|err| classified_chain(err, format!("Error removing device {name}")))
    }

    /// Suspend a device. No udev events are generated.
    pub fn suspend_device(&self, name: &DmName) -> DmResult<()> {
        let mut task = self.task(TaskKind::Suspend, name)?;
        task.run()
            .map_err(|err| err.chain(format!("Error suspending device {name}")))
    }

    /// Resume a device, waiting for udev to process the change.
    pub fn resume_device(&self, name: &DmName) -> DmResult<()> {
        let mut task = self.task(TaskKind::Resume, name)?;
        let wait = self.udev_cookie(&mut task, DmUdevFlags::empty())?;
        self.run_and_wait(&mut task, wait, Task::run)
            .map_err(|err| err.chain(format!("Error resuming device {name}")))
    }
}

/// Busy and already exists errors are reported as themselves with the
/// context in their message; everything else is wrapped.
pub(crate) fn classified_chain(err: DmError, context: String) -> DmError {
    match err {
        DmError::Dm(kind @ (ErrorEnum::Busy | ErrorEnum::AlreadyExists), msg) => {
            DmError::Dm(kind, format!("{context}: {msg}"))
        }
        err => err.chain(context),
    }
}
