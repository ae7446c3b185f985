// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An in-memory engine.
//!
//! The engine keeps a model of device-mapper state that is just detailed
//! enough to exercise the control plane: devices with live and inactive
//! tables, suspension, open counts, and per pool thin ids and transaction
//! ids. Failures are reported the way the kernel engine reports them, as a
//! log line through `dm_log` followed by an ioctl error. Every call is
//! recorded so that tests can check what was asked of the engine.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    path::{Path, PathBuf},
    rc::Rc,
};

use nix::errno::Errno;

use crate::{
    core::{errors::Error, Device, DmName, DmNameBuf, DmUdevFlags, DmUuid},
    dm_log::{dm_log, LOG_DEBUG, LOG_ERR},
    result::{DmError, DmResult},
    task::{
        AddNodePolicy, Deps, Engine, Geometry, Info, NativeTask, TargetCursor, TargetLine,
        TargetVersion, TaskKind,
    },
    units::Sectors,
};

const MOCK_MAJOR: u32 = 253;
const FIRST_COOKIE: u32 = 0x0d4d_0001;

#[derive(Debug, Default)]
struct MockDevice {
    minor: u32,
    suspended: bool,
    read_only: bool,
    open_count: i32,
    event_nr: u32,
    live: Vec<TargetLine>,
    inactive: Option<Vec<TargetLine>>,
    deps: Vec<u64>,
}

impl MockDevice {
    fn info(&self) -> Info {
        Info {
            exists: true,
            suspended: self.suspended,
            live_table: !self.live.is_empty(),
            inactive_table: self.inactive.is_some(),
            open_count: self.open_count,
            event_nr: self.event_nr,
            major: MOCK_MAJOR,
            minor: self.minor,
            read_only: self.read_only,
            target_count: self.live.len() as u32,
        }
    }

    fn is_pool(&self) -> bool {
        self.live
            .first()
            .is_some_and(|line| line.target_type.as_str() == "thin-pool")
    }
}

#[derive(Debug, Default)]
struct MockPool {
    thin_ids: BTreeSet<u32>,
    transaction_id: u64,
}

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<String, MockDevice>,
    pools: HashMap<String, MockPool>,
    calls: Vec<String>,
    next_minor: u32,
    next_cookie: u32,
    cookies: BTreeSet<u32>,
    pending_cookies: BTreeSet<u32>,
    dev_dir: PathBuf,
    fail_task_create: Option<TaskKind>,
    fail_setter: Option<String>,
    fail_udev_wait: bool,
    run_failures: VecDeque<(TaskKind, Errno)>,
}

/// An engine whose kernel is a data structure.
#[derive(Clone, Debug)]
pub struct MockEngine {
    state: Rc<RefCell<MockState>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        MockEngine::new()
    }
}

impl MockEngine {
    /// An engine with no devices.
    pub fn new() -> MockEngine {
        MockEngine {
            state: Rc::new(RefCell::new(MockState {
                next_cookie: FIRST_COOKIE,
                dev_dir: PathBuf::from("/dev"),
                ..Default::default()
            })),
        }
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    /// The number of calls whose description starts with `prefix`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Whether the named device exists.
    pub fn device_exists(&self, name: &DmName) -> bool {
        self.state.borrow().devices.contains_key(name.as_str())
    }

    /// Add an active device with the given live table.
    pub fn insert_device(&self, name: &DmName, table: &[TargetLine]) {
        let mut state = self.state.borrow_mut();
        state.next_minor += 1;
        let minor = state.next_minor;
        state.devices.insert(
            name.to_string(),
            MockDevice {
                minor,
                live: table.to_vec(),
                ..Default::default()
            },
        );
    }

    /// Make the named device appear open `count` times.
    pub fn set_open_count(&self, name: &DmName, count: i32) {
        if let Some(dev) = self.state.borrow_mut().devices.get_mut(name.as_str()) {
            dev.open_count = count;
        }
    }

    /// Set the devices the named device depends on.
    pub fn set_deps(&self, name: &DmName, deps: &[u64]) {
        if let Some(dev) = self.state.borrow_mut().devices.get_mut(name.as_str()) {
            dev.deps = deps.to_vec();
        }
    }

    /// Whether the named device is suspended.
    pub fn is_suspended(&self, name: &DmName) -> bool {
        self.state
            .borrow()
            .devices
            .get(name.as_str())
            .is_some_and(|dev| dev.suspended)
    }

    /// The live table of the named device.
    pub fn live_table(&self, name: &DmName) -> Vec<TargetLine> {
        self.state
            .borrow()
            .devices
            .get(name.as_str())
            .map(|dev| dev.live.clone())
            .unwrap_or_default()
    }

    /// The thin ids in use in the named pool.
    pub fn thin_ids(&self, pool: &DmName) -> Vec<u32> {
        self.state
            .borrow()
            .pools
            .get(pool.as_str())
            .map(|pool| pool.thin_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark thin ids as in use in the named pool.
    pub fn insert_thin_ids(&self, pool: &DmName, ids: &[u32]) {
        self.state
            .borrow_mut()
            .pools
            .entry(pool.to_string())
            .or_default()
            .thin_ids
            .extend(ids);
    }

    /// The transaction id of the named pool.
    pub fn transaction_id(&self, pool: &DmName) -> u64 {
        self.state
            .borrow()
            .pools
            .get(pool.as_str())
            .map_or(0, |pool| pool.transaction_id)
    }

    /// Cookies that were handed out and not yet waited on.
    pub fn outstanding_cookies(&self) -> Vec<u32> {
        self.state.borrow().cookies.iter().cloned().collect()
    }

    /// Make creation of tasks of this kind fail.
    pub fn fail_task_create(&self, kind: TaskKind) {
        self.state.borrow_mut().fail_task_create = Some(kind);
    }

    /// Make the named native setter fail.
    pub fn fail_setter(&self, setter: &str) {
        self.state.borrow_mut().fail_setter = Some(setter.to_string());
    }

    /// Make every udev wait fail. The cookie is still released.
    pub fn fail_udev_wait(&self) {
        self.state.borrow_mut().fail_udev_wait = true;
    }

    /// Make the next run of a task of this kind fail with `errno`.
    pub fn inject_run_failure(&self, kind: TaskKind, errno: Errno) {
        self.state
            .borrow_mut()
            .run_failures
            .push_back((kind, errno));
    }

    fn record(&self, call: String) {
        self.state.borrow_mut().calls.push(call);
    }
}

impl Engine for MockEngine {
    type Task = MockTask;

    fn task_create(&self, kind: TaskKind) -> DmResult<MockTask> {
        self.record(format!("create_task {kind}"));
        if self.state.borrow().fail_task_create == Some(kind) {
            return Err(DmError::Core(Error::GeneralIo("out of memory".into())));
        }
        Ok(MockTask {
            engine: self.clone(),
            kind,
            cookie: None,
            name: None,
            new_name: None,
            message: None,
            sector: Sectors(0),
            read_only: false,
            targets: Vec::new(),
            event_nr: 0,
            info: None,
            deps: None,
            table: None,
            driver_version: None,
            names: None,
            target_versions: None,
        })
    }

    fn udev_wait(&self, cookie: u32) -> DmResult<()> {
        if self.state.borrow_mut().pending_cookies.remove(&cookie) {
            self.record(format!("release_cookie {cookie:#x}"));
        }
        self.record(format!("udev_wait {cookie:#x}"));
        let mut state = self.state.borrow_mut();
        let known = cookie == 0 || state.cookies.remove(&cookie);
        if state.fail_udev_wait {
            return Err(DmError::Core(Error::UdevSync("semop failed".into())));
        }
        if !known {
            return Err(DmError::Core(Error::UdevSync(format!(
                "no semaphore for cookie {cookie:#x}"
            ))));
        }
        Ok(())
    }

    fn set_dev_dir(&self, dir: &Path) -> DmResult<()> {
        self.record(format!("set_dev_dir {}", dir.display()));
        if !dir.is_absolute() {
            return Err(DmError::Core(Error::SetDevDir(
                dir.to_owned(),
                "not an absolute path".into(),
            )));
        }
        self.state.borrow_mut().dev_dir = dir.to_owned();
        Ok(())
    }

    fn dev_dir(&self) -> PathBuf {
        self.state.borrow().dev_dir.clone()
    }

    fn library_version(&self) -> DmResult<String> {
        Ok("1.02.mock".into())
    }
}

/// A task of the in-memory engine.
#[derive(Debug)]
pub struct MockTask {
    engine: MockEngine,
    kind: TaskKind,
    cookie: Option<u32>,
    name: Option<DmNameBuf>,
    new_name: Option<DmNameBuf>,
    message: Option<String>,
    sector: Sectors,
    read_only: bool,
    targets: Vec<TargetLine>,
    event_nr: u32,
    info: Option<Info>,
    deps: Option<Deps>,
    table: Option<Vec<TargetLine>>,
    driver_version: Option<String>,
    names: Option<Vec<(DmNameBuf, Device)>>,
    target_versions: Option<Vec<TargetVersion>>,
}

impl MockTask {
    fn setter(&self, setter: &str, arg: &str) -> DmResult<()> {
        self.engine.record(format!("{setter} {arg}"));
        if self.engine.state.borrow().fail_setter.as_deref() == Some(setter) {
            return Err(DmError::Core(Error::InvalidArgument(format!(
                "{setter} rejected"
            ))));
        }
        Ok(())
    }

    /// The task's cookie, if the task still holds its reference on it.
    fn take_cookie(&self) -> Option<u32> {
        self.cookie.filter(|cookie| {
            self.engine
                .state
                .borrow_mut()
                .pending_cookies
                .remove(cookie)
        })
    }

    fn name_str(&self) -> &str {
        self.name.as_ref().map_or("", |name| name.as_str())
    }

    /// Report a failure the way the kernel engine does.
    fn fail(&self, errno: Errno) -> DmError {
        dm_log(
            LOG_ERR,
            file!(),
            line!(),
            errno as i32,
            &format!(
                "device-mapper: {} ioctl on {} failed: {}",
                self.kind,
                self.name_str(),
                errno.desc()
            ),
        );
        DmError::Core(Error::Ioctl(0, None, None, Box::new(errno)))
    }

    /// Check thin targets against the pools they refer to.
    fn check_table(state: &MockState, table: &[TargetLine]) -> Result<(), Errno> {
        for line in table.iter().filter(|l| l.target_type.as_str() == "thin") {
            let mut params = line.params.split(' ');
            let pool = params
                .next()
                .and_then(|path| Path::new(path).file_name())
                .and_then(|name| name.to_str())
                .ok_or(Errno::EINVAL)?;
            let id = params
                .next()
                .and_then(|id| id.parse::<u32>().ok())
                .ok_or(Errno::EINVAL)?;
            match state.pools.get(pool) {
                Some(pool) if pool.thin_ids.contains(&id) => (),
                _ => return Err(Errno::ENODATA),
            }
        }
        Ok(())
    }

    fn pool_message(pool: &mut MockPool, message: &str) -> Result<(), Errno> {
        let words = message.split_whitespace().collect::<Vec<_>>();
        let id = |word: &str| word.parse::<u32>().map_err(|_| Errno::EINVAL);
        match words[..] {
            ["create_thin", new] => {
                if !pool.thin_ids.insert(id(new)?) {
                    return Err(Errno::EEXIST);
                }
            }
            ["create_snap", new, origin] => {
                let (new, origin) = (id(new)?, id(origin)?);
                if !pool.thin_ids.contains(&origin) {
                    return Err(Errno::ENODATA);
                }
                if !pool.thin_ids.insert(new) {
                    return Err(Errno::EEXIST);
                }
            }
            ["delete", old] => {
                if !pool.thin_ids.remove(&id(old)?) {
                    return Err(Errno::ENODATA);
                }
            }
            ["set_transaction_id", old, new] => {
                let old = old.parse::<u64>().map_err(|_| Errno::EINVAL)?;
                if old != pool.transaction_id {
                    return Err(Errno::EINVAL);
                }
                pool.transaction_id = new.parse::<u64>().map_err(|_| Errno::EINVAL)?;
            }
            _ => return Err(Errno::EINVAL),
        }
        Ok(())
    }

    fn status_line(pools: &HashMap<String, MockPool>, name: &str, line: &TargetLine) -> TargetLine {
        let params = match line.target_type.as_str() {
            "thin-pool" => format!(
                "{} 0/0 0/0 - rw discard_passdown queue_if_no_space - 1024",
                pools.get(name).map_or(0, |pool| pool.transaction_id)
            ),
            "thin" => "0 -".to_string(),
            _ => String::new(),
        };
        TargetLine {
            params,
            ..line.clone()
        }
    }

    fn execute(&mut self) -> Result<(), Errno> {
        let engine = self.engine.clone();
        let mut state = engine.state.borrow_mut();

        if let Some(pos) = state
            .run_failures
            .iter()
            .position(|(kind, _)| *kind == self.kind)
        {
            if let Some((_, errno)) = state.run_failures.remove(pos) {
                return Err(errno);
            }
        }

        let name = self.name_str().to_string();
        let needs_name = !matches!(
            self.kind,
            TaskKind::RemoveAll
                | TaskKind::Version
                | TaskKind::List
                | TaskKind::ListVersions
                | TaskKind::Mknodes
        );
        if needs_name && name.is_empty() {
            return Err(Errno::EINVAL);
        }

        match self.kind {
            TaskKind::Create => {
                if state.devices.contains_key(&name) {
                    return Err(Errno::EBUSY);
                }
                Self::check_table(&state, &self.targets)?;
                state.next_minor += 1;
                let dev = MockDevice {
                    minor: state.next_minor,
                    read_only: self.read_only,
                    live: self.targets.clone(),
                    ..Default::default()
                };
                self.info = Some(dev.info());
                state.devices.insert(name, dev);
            }
            TaskKind::Reload => {
                Self::check_table(&state, &self.targets)?;
                let dev = state.devices.get_mut(&name).ok_or(Errno::ENXIO)?;
                dev.inactive = Some(self.targets.clone());
                dev.read_only = self.read_only;
                self.info = Some(dev.info());
            }
            TaskKind::Remove => {
                let dev = state.devices.get(&name).ok_or(Errno::ENXIO)?;
                if dev.open_count > 0 {
                    return Err(Errno::EBUSY);
                }
                state.devices.remove(&name);
            }
            TaskKind::RemoveAll => {
                state.devices.retain(|_, dev| dev.open_count > 0);
            }
            TaskKind::Suspend => {
                let dev = state.devices.get_mut(&name).ok_or(Errno::ENXIO)?;
                dev.suspended = true;
                dev.event_nr += 1;
                self.info = Some(dev.info());
            }
            TaskKind::Resume => {
                let dev = state.devices.get_mut(&name).ok_or(Errno::ENXIO)?;
                if let Some(table) = dev.inactive.take() {
                    dev.live = table;
                }
                dev.suspended = false;
                dev.event_nr += 1;
                self.info = Some(dev.info());
            }
            TaskKind::Info => {
                self.info = Some(state.devices.get(&name).map(|d| d.info()).unwrap_or_default());
            }
            TaskKind::Deps => {
                let dev = state.devices.get(&name).ok_or(Errno::ENXIO)?;
                self.info = Some(dev.info());
                self.deps = Some(Deps::new(dev.deps.clone()));
            }
            TaskKind::Rename => {
                let new_name = self
                    .new_name
                    .as_ref()
                    .map(|n| n.to_string())
                    .ok_or(Errno::EINVAL)?;
                if state.devices.contains_key(&new_name) {
                    return Err(Errno::EBUSY);
                }
                let dev = state.devices.remove(&name).ok_or(Errno::ENXIO)?;
                state.devices.insert(new_name, dev);
            }
            TaskKind::Version => {
                self.driver_version = Some("4.48.0".into());
            }
            TaskKind::Status => match state.devices.get(&name) {
                Some(dev) => {
                    self.info = Some(dev.info());
                    self.table = Some(
                        dev.live
                            .iter()
                            .map(|line| Self::status_line(&state.pools, &name, line))
                            .collect(),
                    );
                }
                None => {
                    self.info = Some(Info::default());
                    self.table = Some(Vec::new());
                }
            },
            TaskKind::Table | TaskKind::WaitEvent => match state.devices.get(&name) {
                Some(dev) => {
                    if self.kind == TaskKind::WaitEvent {
                        debug!("Not waiting for event {} on {}", self.event_nr, name);
                    }
                    self.info = Some(dev.info());
                    self.table = Some(dev.live.clone());
                }
                None if self.kind == TaskKind::Table => {
                    self.info = Some(Info::default());
                    self.table = Some(Vec::new());
                }
                None => return Err(Errno::ENXIO),
            },
            TaskKind::List => {
                self.names = Some(
                    state
                        .devices
                        .iter()
                        .map(|(name, dev)| {
                            (
                                DmNameBuf::new(name.clone()).expect("names are checked on entry"),
                                Device {
                                    major: MOCK_MAJOR,
                                    minor: dev.minor,
                                },
                            )
                        })
                        .collect(),
                );
            }
            TaskKind::Clear => {
                let dev = state.devices.get_mut(&name).ok_or(Errno::ENXIO)?;
                dev.inactive = None;
                self.info = Some(dev.info());
            }
            TaskKind::Mknodes => (),
            TaskKind::ListVersions => {
                self.target_versions = Some(
                    [("thin-pool", (1, 23, 0)), ("thin", (1, 23, 0)), ("linear", (1, 4, 0))]
                        .iter()
                        .map(|(name, version)| TargetVersion {
                            name: name.to_string(),
                            version: *version,
                        })
                        .collect(),
                );
            }
            TaskKind::TargetMsg => {
                let message = self.message.clone().ok_or(Errno::EINVAL)?;
                state.calls.push(format!("message {name} {message}"));
                let dev = state.devices.get(&name).ok_or(Errno::ENXIO)?;
                if !dev.is_pool() || *self.sector != 0 {
                    return Err(Errno::EINVAL);
                }
                self.info = Some(dev.info());
                let pool = state.pools.entry(name).or_default();
                Self::pool_message(pool, &message)?;
            }
            TaskKind::SetGeometry => {
                let dev = state.devices.get(&name).ok_or(Errno::ENXIO)?;
                self.info = Some(dev.info());
            }
        }
        Ok(())
    }
}

impl NativeTask for MockTask {
    fn set_name(&mut self, name: &DmName) -> DmResult<()> {
        self.setter("set_name", name.as_str())?;
        self.name = Some(name.to_owned());
        Ok(())
    }

    fn set_uuid(&mut self, uuid: &DmUuid) -> DmResult<()> {
        self.setter("set_uuid", uuid.as_str())
    }

    fn set_new_name(&mut self, name: &DmName) -> DmResult<()> {
        self.setter("set_new_name", name.as_str())?;
        self.new_name = Some(name.to_owned());
        Ok(())
    }

    fn set_message(&mut self, message: &str) -> DmResult<()> {
        self.setter("set_message", message)?;
        self.message = Some(message.to_string());
        Ok(())
    }

    fn set_sector(&mut self, sector: Sectors) -> DmResult<()> {
        self.setter("set_sector", &sector.to_string())?;
        self.sector = sector;
        Ok(())
    }

    fn set_read_only(&mut self) -> DmResult<()> {
        self.setter("set_read_only", "")?;
        self.read_only = true;
        Ok(())
    }

    fn add_target(&mut self, target: &TargetLine) -> DmResult<()> {
        self.setter("add_target", &target.to_string())?;
        self.targets.push(target.clone());
        Ok(())
    }

    fn set_add_node(&mut self, policy: AddNodePolicy) -> DmResult<()> {
        self.setter("set_add_node", &format!("{policy:?}"))
    }

    fn set_cookie(&mut self, flags: DmUdevFlags) -> DmResult<u32> {
        self.setter("set_cookie", &format!("{:#x}", flags.bits()))?;
        let mut state = self.engine.state.borrow_mut();
        let cookie = state.next_cookie;
        state.next_cookie += 1;
        state.cookies.insert(cookie);
        state.pending_cookies.insert(cookie);
        self.cookie = Some(cookie);
        Ok(cookie)
    }

    fn set_geometry(&mut self, geometry: &Geometry) -> DmResult<()> {
        self.setter("set_geometry", &geometry.to_string())
    }

    fn set_event_nr(&mut self, event_nr: u32) -> DmResult<()> {
        self.setter("set_event_nr", &event_nr.to_string())?;
        self.event_nr = event_nr;
        Ok(())
    }

    fn run(&mut self) -> DmResult<()> {
        self.take_cookie();
        self.engine
            .record(format!("run {} {}", self.kind, self.name_str()));
        dm_log(
            LOG_DEBUG,
            file!(),
            line!(),
            0,
            &format!("mock {} on {}", self.kind, self.name_str()),
        );
        self.execute().map_err(|errno| self.fail(errno))
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
        self.engine
            .record(format!("next_target {}", self.name_str()));
        let table = self.table.as_ref().ok_or_else(|| {
            DmError::Core(Error::GetTarget(format!("{} task has no table", self.kind)))
        })?;
        if cursor.is_end() {
            return Ok((TargetCursor::END, None));
        }
        Ok((
            TargetCursor::after(cursor.index(), table.len()),
            table.get(cursor.index()).cloned(),
        ))
    }

    fn names(&self) -> Option<Vec<(DmNameBuf, Device)>> {
        self.names.clone()
    }

    fn target_versions(&self) -> Option<Vec<TargetVersion>> {
        self.target_versions.clone()
    }
}

impl Drop for MockTask {
    fn drop(&mut self) {
        if let Some(cookie) = self.take_cookie() {
            self.engine.record(format!("release_cookie {cookie:#x}"));
        }
        self.engine.record(format!("release {}", self.kind));
    }
}
