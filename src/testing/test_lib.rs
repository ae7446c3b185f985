// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::{
    core::{DevId, DmNameBuf, DmOptions, DM},
    result::{DmError, DmResult, ErrorEnum},
};

/// String that is to be concatenated with test supplied name, so that we can easily identify and
/// remove.
static DM_TEST_ID: &str = "_dm-thin_test_delme";

/// Generate the test name given the test supplied name.
pub fn test_name(name: &str) -> DmResult<DmNameBuf> {
    let mut namestr = String::from(name);
    namestr.push_str(DM_TEST_ID);
    DmNameBuf::new(namestr)
}

/// Attempt to remove all device mapper devices which have DM_TEST_ID
/// contained in their name. Thin devices hold their pool open, so removal
/// is repeated as long as some device goes away.
fn dm_test_devices_remove() -> DmResult<()> {
    let dm = DM::new()?;

    loop {
        let mut progress_made = false;
        let mut remain = Vec::new();

        for (name, _, _) in dm
            .list_devices()?
            .iter()
            .filter(|(name, _, _)| name.as_str().contains(DM_TEST_ID))
        {
            match dm.device_remove(&DevId::Name(name), &DmOptions::default()) {
                Ok(_) => progress_made = true,
                Err(_) => remain.push(name.to_string()),
            }
        }

        if !progress_made {
            if !remain.is_empty() {
                return Err(DmError::Dm(
                    ErrorEnum::Error,
                    format!("unable to remove all test devices: {remain:?}"),
                ));
            }
            break;
        }
    }

    Ok(())
}

/// When a unit test panics we can leave the system in an inconsistent
/// state. This function tries to clean up by removing any devices which
/// contain DM_TEST_ID in their name.
pub fn clean_up() -> DmResult<()> {
    dm_test_devices_remove()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_marked() {
        let name = test_name("pool").unwrap();
        assert!(name.as_str().starts_with("pool"));
        assert!(name.as_str().contains(DM_TEST_ID));
    }
}
