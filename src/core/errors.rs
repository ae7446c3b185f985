// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*! Definition for low level error class for core methods !*/

use std::{self, path::PathBuf};

use crate::{core::deviceinfo::DeviceInfo, task::TaskKind};

#[derive(Clone, Debug)]
/// Internal error for low-level devicemapper operations
pub enum Error {
    /// An error returned on failure to create a devicemapper context
    ContextInit(String),

    /// This is a generic error that can be returned when a method
    /// receives an invalid argument. Ideally, the argument should be
    /// invalid in itself, i.e., it should not be made invalid by some
    /// part of the program state or the environment.
    InvalidArgument(String),

    /// An error returned exclusively by DM methods.
    /// This error is initiated in DM::do_ioctl and returned by
    /// numerous wrapper methods.
    Ioctl(
        u8,
        Option<Box<DeviceInfo>>,
        Option<Box<DeviceInfo>>,
        Box<nix::Error>,
    ),

    /// An error returned when the response exceeds the maximum possible
    /// size of the ioctl buffer.
    IoctlResultTooLarge,

    /// An error returned on failure to get metadata for a device
    MetadataIo(PathBuf, String),

    /// An error returned on general IO failure
    GeneralIo(String),

    /// An error synchronizing with udev
    UdevSync(String),

    /// The engine could not allocate a task of this kind
    TaskCreate(TaskKind),

    /// The task has already been run; it can be neither configured nor
    /// run again.
    TaskExecuted(TaskKind),

    /// The engine rejected the device name
    SetName(String),

    /// The engine rejected the new name of a rename task
    SetNewName(String),

    /// The engine rejected the device uuid
    SetUuid(String),

    /// The engine rejected the target message
    SetMessage(String),

    /// The engine rejected the message sector
    SetSector(String),

    /// The engine could not mark the device read-only
    SetReadOnly(String),

    /// The engine rejected a table target
    AddTarget(String),

    /// The engine rejected the add-node policy
    SetAddNode(String),

    /// A numeric add-node policy that is neither on-resume nor on-create
    InvalidAddNode(u32),

    /// No storage was supplied for the udev cookie
    NilCookie,

    /// The engine could not attach a udev cookie to the task
    SetCookie(String),

    /// The engine rejected the device geometry
    SetGeometry(String),

    /// The engine rejected the event number to wait for
    SetEventNr(String),

    /// Running the task failed
    TaskRun(TaskKind, String),

    /// No dependency data is available from the task
    GetDeps(String),

    /// No device info is available from the task
    GetInfo(String),

    /// No driver version is available from the task
    GetDriverVersion(String),

    /// No table target data is available from the task
    GetTarget(String),

    /// No device list is available from the task
    GetNames(String),

    /// No target version list is available from the task
    GetTargetVersions(String),

    /// Waiting for udev to process the events of a cookie failed
    UdevWait(u32, String),

    /// The device directory could not be set
    SetDevDir(PathBuf, String),

    /// The library version could not be obtained
    GetLibraryVersion(String),

    /// A block device query or command failed
    BlockDevice(PathBuf, String),

    /// A loop device query or command failed
    Loopback(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ContextInit(err) => {
                write!(f, "DM context not initialized due to IO error: {err}")
            }
            Error::InvalidArgument(err) => write!(f, "invalid argument: {err}"),
            Error::Ioctl(op, hdr_in, hdr_out, err) => write!(
                f,
                "low-level ioctl error due to nix error; ioctl number: {op}, input header: {hdr_in:?}, header result: {hdr_out:?}, error: {err}"
            ),
            Error::IoctlResultTooLarge => write!(
                f,
                "ioctl result too large for maximum buffer size: {} bytes",
                u32::MAX
            ),
            Error::MetadataIo(device_path, err) => write!(
                f,
                "failed to stat metadata for device at {} due to IO error: {}",
                device_path.display(),
                err
            ),
            Error::GeneralIo(err) => {
                write!(f, "failed to perform operation due to IO error: {err}")
            }
            Error::UdevSync(err) => {
                write!(f, "failed to perform udev sync operation: {err}")
            }
            Error::TaskCreate(kind) => write!(f, "can't create task of type {kind}"),
            Error::TaskExecuted(kind) => {
                write!(f, "task of type {kind} has already been run")
            }
            Error::SetName(err) => write!(f, "setting task name failed: {err}"),
            Error::SetNewName(err) => write!(f, "setting task new name failed: {err}"),
            Error::SetUuid(err) => write!(f, "setting task uuid failed: {err}"),
            Error::SetMessage(err) => write!(f, "setting task message failed: {err}"),
            Error::SetSector(err) => write!(f, "setting task sector failed: {err}"),
            Error::SetReadOnly(err) => write!(f, "setting task read-only failed: {err}"),
            Error::AddTarget(err) => write!(f, "adding task target failed: {err}"),
            Error::SetAddNode(err) => write!(f, "setting task add-node policy failed: {err}"),
            Error::InvalidAddNode(val) => write!(f, "invalid add-node policy {val}"),
            Error::NilCookie => write!(f, "no storage supplied for udev cookie"),
            Error::SetCookie(err) => write!(f, "setting task udev cookie failed: {err}"),
            Error::SetGeometry(err) => write!(f, "setting task geometry failed: {err}"),
            Error::SetEventNr(err) => write!(f, "setting task event number failed: {err}"),
            Error::TaskRun(kind, err) => write!(f, "running task of type {kind} failed: {err}"),
            Error::GetDeps(err) => write!(f, "getting task dependencies failed: {err}"),
            Error::GetInfo(err) => write!(f, "getting task device info failed: {err}"),
            Error::GetDriverVersion(err) => {
                write!(f, "getting task driver version failed: {err}")
            }
            Error::GetTarget(err) => write!(f, "getting task table target failed: {err}"),
            Error::GetNames(err) => write!(f, "getting task device list failed: {err}"),
            Error::GetTargetVersions(err) => {
                write!(f, "getting task target versions failed: {err}")
            }
            Error::UdevWait(cookie, err) => {
                write!(f, "wait on udev cookie {cookie:#x} failed: {err}")
            }
            Error::SetDevDir(dir, err) => write!(
                f,
                "setting device directory to {} failed: {}",
                dir.display(),
                err
            ),
            Error::GetLibraryVersion(err) => {
                write!(f, "getting library version failed: {err}")
            }
            Error::BlockDevice(path, err) => write!(
                f,
                "block device operation on {} failed: {}",
                path.display(),
                err
            ),
            Error::Loopback(err) => write!(f, "loop device operation failed: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Ioctl(_, _, _, err) => Some(err),
            _ => None,
        }
    }
}
