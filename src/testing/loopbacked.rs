// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs::OpenOptions,
    io::{self, Seek, SeekFrom, Write},
    panic,
    path::{Path, PathBuf},
};

use loopdev::{LoopControl, LoopDevice};
use tempfile::{self, TempDir};

use crate::{
    testing::{logger::init_logger, test_lib::clean_up},
    units::{Bytes, Sectors, IEC, SECTOR_SIZE},
};

/// Zero sectors at the given offset for length sectors.
fn wipe_sectors<P: AsRef<Path>>(path: P, offset: Sectors, length: Sectors) -> io::Result<()> {
    let mut f = OpenOptions::new().write(true).open(path)?;

    f.seek(SeekFrom::Start(*offset * SECTOR_SIZE as u64))?;
    for _ in 0..*length {
        f.write_all(&[0u8; SECTOR_SIZE])?;
    }

    f.sync_all()?;
    Ok(())
}

/// A loop device together with the file it is backed by.
pub struct LoopTestDev {
    ld: LoopDevice,
    backing: PathBuf,
}

impl LoopTestDev {
    fn new(lc: &LoopControl, backing: &Path) -> LoopTestDev {
        let ld = lc.next_free().unwrap();
        ld.attach_file(backing).unwrap();

        // Pool metadata from an earlier run may be left at the start of
        // the device; the pool would pick it up.
        wipe_sectors(
            ld.path().unwrap(),
            Sectors(0),
            Bytes(u128::from(IEC::Mi)).sectors(),
        )
        .unwrap();

        LoopTestDev {
            ld,
            backing: backing.to_owned(),
        }
    }

    /// The path of the loop device node.
    pub fn path(&self) -> PathBuf {
        self.ld.path().unwrap()
    }

    /// The path of the backing file.
    pub fn backing(&self) -> &Path {
        &self.backing
    }
}

impl Drop for LoopTestDev {
    fn drop(&mut self) {
        if let Err(err) = self.ld.detach() {
            warn!("Failed to detach {}: {}", self.backing.display(), err);
        }
    }
}

/// Set up count loop devices in dir, each backed by a sparse 1 GiB file.
fn get_devices(count: u8, dir: &TempDir) -> Vec<LoopTestDev> {
    let lc = LoopControl::open().unwrap();

    (0..count)
        .map(|index| {
            let path = dir.path().join(format!("store{index}"));
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            f.set_len(IEC::Gi).unwrap();
            f.sync_all().unwrap();

            LoopTestDev::new(&lc, &path)
        })
        .collect()
}

/// Set up count loopbacked devices, run the test on them, then remove any
/// devices the test left behind and take down the loop devices.
pub fn test_with_spec<F>(count: u8, test: F)
where
    F: Fn(&[LoopTestDev]) + panic::RefUnwindSafe,
{
    init_logger();
    clean_up().unwrap();

    let tmpdir = tempfile::Builder::new()
        .prefix("devmapper-thin")
        .tempdir()
        .unwrap();
    let loop_devices = get_devices(count, &tmpdir);

    let result = panic::catch_unwind(|| test(&loop_devices));
    let tear_down = clean_up();

    result.unwrap();
    tear_down.unwrap();
}
