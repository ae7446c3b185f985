// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Control of devicemapper thin pools and thin devices of the running
//! kernel.
//!
//! # Overview
//!
//! A thin pool hands out storage from a data device to thin devices on
//! demand, keeping track of which blocks belong to which device on a
//! metadata device. Within a pool, a thin device is known by a 24 bit id;
//! it becomes a block device once it is activated under a name. Snapshots
//! are thin devices that share their blocks with their origin until either
//! is written.
//!
//! # Usage
//!
//! Every operation is a [`task::Task`]: it is created for one kind of
//! operation, configured, run once, and then queried for what the operation
//! produced. Tasks are created by an [`task::Engine`]; the [`IoctlEngine`]
//! talks to the kernel through the devicemapper ioctl interface.
//!
//! [`DevMapper`] strings tasks together into whole operations:
//!
//! * `create_pool()` and `reload_pool()` set up a pool on a data and a
//!   metadata device.
//! * `create_device()`, `create_snap_device()` and `delete_device()`
//!   manage the thin devices of a pool. `create_device()` and
//!   `create_snap_device()` move on to the next id while the pool reports
//!   the requested one as taken.
//! * `activate_device()`, `suspend_device()`, `resume_device()` and
//!   `remove_device()` manage the block devices.
//! * `get_info()`, `get_status()`, `get_table()`, `get_deps()` and
//!   `list_devices()` query devices.
//!
//! Operations that make udev act on a device node wait for udev to finish
//! before they return.
//!
//! Failures that the caller may want to handle are reported with an
//! [`ErrorEnum`] kind: `Busy` for a device that is in use,
//! `AlreadyExists` for an id or name that is taken.

#![allow(clippy::doc_markdown)]
#![warn(missing_docs)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate nix;
#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[macro_use]
mod id_macros;
#[macro_use]
mod range_macros;

/// block and loop device ioctls
pub mod blkdev;
/// classification of failed runs
mod classify;
/// single call operations and queries
mod control;
/// core lower level API
pub mod core;
/// routing and capture of engine log lines
pub mod dm_log;
/// the engine that talks to the kernel
mod ioctl_engine;
/// thin pool lifecycle
mod pool;
/// return results container
mod result;
/// snapshots of thin devices
mod snapshot;
/// single device-mapper operations
pub mod task;
/// thin device lifecycle
mod thin;
/// the id the pool uses to track its devices
mod thindevid;
/// udev synchronization
pub mod udev;
/// basic types (Bytes, Sectors)
mod units;

#[cfg(test)]
mod testing;

pub use crate::{
    classify::{classify, run_classified},
    control::{DevMapper, DevMapperOptions, DEFAULT_ID_ALLOC_ATTEMPTS},
    core::{
        errors, Device, DmName, DmNameBuf, DmUdevFlags, DmUuid, DmUuidBuf, TargetType,
        TargetTypeBuf,
    },
    dm_log::{log_init, log_init_verbose, DmLogger},
    ioctl_engine::{IoctlEngine, IoctlTask, DEFAULT_DEV_DIR},
    pool::pool_target,
    result::{DmError, DmResult, ErrorEnum},
    snapshot::SuspendGuard,
    thindevid::{ThinDevId, THIN_DEV_ID_LIMIT},
    units::{Bytes, Sectors, IEC, SECTOR_SIZE},
};
