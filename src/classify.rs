// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::{
    dm_log::Captured,
    result::{DmError, DmResult, ErrorEnum},
    task::{NativeTask, Task},
};

/// Turn a failed run into a busy or already exists error if the engine's
/// log said so. Busy wins if both were reported.
pub fn classify(captured: Captured, err: DmError) -> DmError {
    if captured.busy {
        DmError::Dm(ErrorEnum::Busy, err.to_string())
    } else if captured.exists {
        DmError::Dm(ErrorEnum::AlreadyExists, err.to_string())
    } else {
        err
    }
}

/// Run a task, classifying any failure by what the engine logged during
/// the run.
pub fn run_classified<N: NativeTask>(task: &mut Task<N>) -> DmResult<()> {
    task.run().map_err(|err| classify(task.captured(), err))
}
