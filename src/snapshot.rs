// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Snapshots of thin devices.
//!
//! An active origin is suspended while the pool takes the snapshot, so that
//! the snapshot sees every write the origin acknowledged.

use crate::{
    classify::run_classified,
    control::{classified_chain, DevMapper},
    core::DmName,
    result::{DmError, DmResult, ErrorEnum},
    task::Engine,
    thin::{next_id, IdRetry},
    thindevid::ThinDevId,
};

/// Keeps a device suspended. The device is resumed by `release`, or on
/// drop if `release` was never reached.
#[must_use = "dropping the guard resumes the device immediately"]
pub struct SuspendGuard<'a, E: Engine> {
    dm: &'a DevMapper<E>,
    name: &'a DmName,
    released: bool,
}

impl<'a, E: Engine> SuspendGuard<'a, E> {
    /// Suspend the named device.
    pub fn suspend(dm: &'a DevMapper<E>, name: &'a DmName) -> DmResult<SuspendGuard<'a, E>> {
        dm.suspend_device(name)?;
        Ok(SuspendGuard {
            dm,
            name,
            released: false,
        })
    }

    /// Resume the device, surfacing any failure.
    pub fn release(mut self) -> DmResult<()> {
        self.released = true;
        self.dm.resume_device(self.name)
    }
}

impl<E: Engine> Drop for SuspendGuard<'_, E> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.dm.resume_device(self.name) {
                warn!("Failed to resume device {}: {}", self.name, err);
            }
        }
    }
}

impl<E: Engine> DevMapper<E> {
    /// Snapshot thin device `origin_id` of the pool, whose active device, if
    /// any, is `origin`. Starts at the id in `id` and moves on to the next
    /// id for as long as the pool reports the id as taken. On success `id`
    /// holds the id of the snapshot.
    ///
    /// If the snapshot was taken but the origin could not be resumed, the
    /// error is of kind `ErrorEnum::Suspended`; the snapshot exists and the
    /// origin must be resumed by the caller.
    pub fn create_snap_device(
        &self,
        pool: &DmName,
        id: &mut ThinDevId,
        origin: &DmName,
        origin_id: ThinDevId,
    ) -> DmResult<()> {
        let exists = match self.get_info(origin) {
            Ok(info) => info.exists,
            Err(err) => {
                debug!("Taking {} as inactive: {}", origin, err);
                false
            }
        };

        let guard = if exists {
            Some(
                SuspendGuard::suspend(self, origin)
                    .map_err(|err| err.chain(format!("Error suspending origin {origin}")))?,
            )
        } else {
            None
        };

        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            let message = format!("create_snap {id} {origin_id}");
            let mut task = match self.message_task(pool, &message) {
                Ok(task) => task,
                Err(err) => break Some(err),
            };
            let err = match run_classified(&mut task) {
                Ok(()) => break None,
                Err(err) => err,
            };
            match next_id(err, *id, attempt, self.options.id_alloc_attempts) {
                IdRetry::Next(next) => *id = next,
                IdRetry::Fail(err) => break Some(err),
            }
        };

        let resumed = guard.map_or(Ok(()), SuspendGuard::release);
        match (failure, resumed) {
            (None, Ok(())) => Ok(()),
            (None, Err(err)) => Err(DmError::Dm(
                ErrorEnum::Suspended,
                format!("snapshot {id} of device {origin_id} in pool {pool} was taken but {origin} is still suspended: {err}"),
            )),
            (Some(err), Ok(())) => Err(classified_chain(
                err,
                format!("Error creating snapshot {id} of device {origin_id} in pool {pool}"),
            )),
            (Some(err), Err(resume_err)) => Err(err.chain(format!(
                "Error creating snapshot {id} of device {origin_id} in pool {pool}, and resuming {origin} failed: {resume_err}"
            ))),
        }
    }
}
