// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thin device lifecycle.

use crate::{
    classify::run_classified,
    control::{classified_chain, DevMapper},
    core::{DmName, DmUdevFlags, TargetTypeBuf},
    result::{DmError, DmResult, ErrorEnum},
    task::{AddNodePolicy, Engine, TargetLine, TaskKind},
    thindevid::ThinDevId,
    units::{Bytes, Sectors},
};

/// What to do after a pool message that allocates an id failed.
pub(crate) enum IdRetry {
    /// Try again with this id.
    Next(ThinDevId),
    /// Give up with this error.
    Fail(DmError),
}

/// Decide whether an id allocating message that failed with `err` on its
/// `attempt`th try should be retried with the next id.
pub(crate) fn next_id(
    err: DmError,
    id: ThinDevId,
    attempt: usize,
    max_attempts: usize,
) -> IdRetry {
    if !err.is_already_exists() {
        return IdRetry::Fail(err);
    }
    if attempt >= max_attempts {
        return IdRetry::Fail(DmError::Dm(
            ErrorEnum::Invalid,
            format!("no free thin device id after {attempt} attempts, last tried {id}"),
        ));
    }
    match id.next() {
        Some(next) => {
            debug!("Thin device id {} is taken, trying {}", id, next);
            IdRetry::Next(next)
        }
        None => IdRetry::Fail(DmError::Dm(
            ErrorEnum::Invalid,
            format!("thin device ids are exhausted at {id}"),
        )),
    }
}

impl<E: Engine> DevMapper<E> {
    /// Provision a thin device in the pool. Starts at the id in `id` and
    /// moves on to the next id for as long as the pool reports the id as
    /// taken. On success `id` holds the id of the new device.
    pub fn create_device(&self, pool: &DmName, id: &mut ThinDevId) -> DmResult<()> {
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            let mut task = match self.message_task(pool, &format!("create_thin {id}")) {
                Ok(task) => task,
                Err(err) => break err,
            };
            let err = match run_classified(&mut task) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            match next_id(err, *id, attempt, self.options.id_alloc_attempts) {
                IdRetry::Next(next) => *id = next,
                IdRetry::Fail(err) => break err,
            }
        };
        Err(classified_chain(
            failure,
            format!("Error creating thin device {id} in pool {pool}"),
        ))
    }

    /// Delete a thin device from the pool. The device must not be active.
    pub fn delete_device(&self, pool: &DmName, id: ThinDevId) -> DmResult<()> {
        let context = || format!("Error deleting thin device {id} from pool {pool}");
        let mut task = self
            .message_task(pool, &format!("delete {id}"))
            .map_err(|err| err.chain(context()))?;
        run_classified(&mut task).map_err(|err| classified_chain(err, context()))
    }

    /// Activate thin device `id` of the pool as the device `name`, `size`
    /// bytes long.
    pub fn activate_device(
        &self,
        pool: &DmName,
        name: &DmName,
        id: ThinDevId,
        size: Bytes,
    ) -> DmResult<()> {
        let context = || format!("Error activating thin device {id} of pool {pool} as {name}");
        let mut task = self.task(TaskKind::Create, name).map_err(|err| err.chain(context()))?;

        let target = TargetLine::new(
            Sectors(0),
            size.sectors(),
            TargetTypeBuf::new("thin".into()).expect("valid format"),
            format!("{} {}", self.device_path(pool).display(), id),
        );
        task.add_target(&target)
            .map_err(|err| err.chain(context()))?;
        task.set_add_node(AddNodePolicy::OnCreate)
            .map_err(|err| err.chain(context()))?;

        let wait = self.udev_cookie(&mut task, DmUdevFlags::empty())?;
        self.run_and_wait(&mut task, wait, run_classified)
            .map_err(|err| classified_chain(err, context()))
    }
}
