// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thin pool lifecycle.

use std::{fs::File, path::Path};

use crate::{
    blkdev::blkdev_size,
    classify::run_classified,
    control::DevMapper,
    core::{errors::Error, DmName, DmUdevFlags, TargetTypeBuf},
    result::{DmError, DmResult},
    task::{Engine, TargetLine, TaskKind},
    units::Sectors,
};

/// The free space, in pool blocks, below which the pool raises an event.
const LOW_WATER_MARK: u64 = 32768;

/// The thin-pool target spanning all of `data`, with its metadata on
/// `metadata`. New blocks are not zeroed.
pub fn pool_target(data: &Path, metadata: &Path, block_size: u32) -> DmResult<TargetLine> {
    let data_file = File::open(data).map_err(|err| {
        DmError::Core(Error::MetadataIo(data.to_owned(), err.to_string()))
    })?;
    let size = blkdev_size(&data_file)?;

    Ok(TargetLine::new(
        Sectors(0),
        size.sectors(),
        TargetTypeBuf::new("thin-pool".into()).expect("valid format"),
        format!(
            "{} {} {} {} 1 skip_block_zeroing",
            metadata.display(),
            data.display(),
            block_size,
            LOW_WATER_MARK
        ),
    ))
}

impl<E: Engine> DevMapper<E> {
    /// Create and activate a pool on the given data and metadata devices.
    /// `block_size` is in sectors.
    pub fn create_pool(
        &self,
        pool: &DmName,
        data: &Path,
        metadata: &Path,
        block_size: u32,
    ) -> DmResult<()> {
        let context = || format!("Error creating pool {pool}");
        debug!("Creating pool {} on {}", pool, data.display());

        let mut task = self.task(TaskKind::Create, pool).map_err(|err| err.chain(context()))?;
        let target = pool_target(data, metadata, block_size).map_err(|err| {
            err.chain(format!("Can't get size of data device {}", data.display()))
        })?;
        task.add_target(&target)
            .map_err(|err| err.chain(context()))?;

        let wait = self.udev_cookie(&mut task, DmUdevFlags::pool_create())?;
        self.run_and_wait(&mut task, wait, run_classified)
            .map_err(|err| crate::control::classified_chain(err, context()))
    }

    /// Load the pool's table into its inactive slot. The new table takes
    /// effect on the next resume.
    pub fn reload_pool(
        &self,
        pool: &DmName,
        data: &Path,
        metadata: &Path,
        block_size: u32,
    ) -> DmResult<()> {
        let context = || format!("Error reloading pool {pool}");
        let mut task = self.task(TaskKind::Reload, pool).map_err(|err| err.chain(context()))?;
        let target = pool_target(data, metadata, block_size).map_err(|err| {
            err.chain(format!("Can't get size of data device {}", data.display()))
        })?;
        task.add_target(&target)
            .map_err(|err| err.chain(context()))?;
        task.run().map_err(|err| err.chain(context()))
    }

    /// Move the pool's transaction id from `old` to `new`. Fails if the
    /// pool's transaction id is not `old`.
    pub fn set_transaction_id(&self, pool: &DmName, old: u64, new: u64) -> DmResult<()> {
        let context =
            || format!("Error setting transaction id of pool {pool} from {old} to {new}");
        let mut task = self
            .message_task(pool, &format!("set_transaction_id {old} {new}"))
            .map_err(|err| err.chain(context()))?;
        run_classified(&mut task).map_err(|err| err.chain(context()))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, path::PathBuf};

    use tempfile::TempDir;

    use crate::{
        control::DevMapperOptions,
        result::ErrorEnum,
        testing::{mock::MockEngine, test_name},
        units::IEC,
    };

    use super::*;

    const BLOCK_SIZE: u32 = 128;

    fn backing(dir: &TempDir, name: &str, len: u64) -> PathBuf {
        let path = dir.path().join(name);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap()
            .set_len(len)
            .unwrap();
        path
    }

    fn mapper() -> DevMapper<MockEngine> {
        DevMapper::with_engine(MockEngine::new(), DevMapperOptions::default())
    }

    #[test]
    fn test_pool_target() {
        let dir = tempfile::tempdir().unwrap();
        let data = backing(&dir, "data", IEC::Gi);
        let meta = backing(&dir, "meta", 16 * IEC::Mi);

        let target = pool_target(&data, &meta, BLOCK_SIZE).unwrap();
        assert_eq!(target.start, Sectors(0));
        assert_eq!(target.length, Sectors(IEC::Gi / 512));
        assert_eq!(target.target_type.as_str(), "thin-pool");
        assert_eq!(
            target.params,
            format!(
                "{} {} 128 32768 1 skip_block_zeroing",
                meta.display(),
                data.display()
            )
        );
    }

    #[test]
    fn test_pool_target_missing_data() {
        let dir = tempfile::tempdir().unwrap();
        let meta = backing(&dir, "meta", IEC::Mi);
        assert_matches!(
            pool_target(&dir.path().join("absent"), &meta, BLOCK_SIZE),
            Err(DmError::Core(Error::MetadataIo(_, _)))
        );
    }

    #[test]
    fn test_create_pool() {
        let dm = mapper();
        let dir = tempfile::tempdir().unwrap();
        let data = backing(&dir, "data", IEC::Gi);
        let meta = backing(&dir, "meta", 16 * IEC::Mi);
        let pool = test_name("pool").expect("valid format");

        dm.create_pool(&pool, &data, &meta, BLOCK_SIZE).unwrap();
        assert!(dm.engine().device_exists(&pool));
        assert_eq!(
            dm.engine().count_calls(&format!(
                "set_cookie {:#x}",
                DmUdevFlags::pool_create().bits()
            )),
            1
        );
        assert_eq!(dm.engine().count_calls("udev_wait"), 1);
        assert!(dm.engine().outstanding_cookies().is_empty());
        assert_eq!(
            dm.get_status(&pool).unwrap().params,
            "0 0/0 0/0 - rw discard_passdown queue_if_no_space - 1024"
        );
    }

    #[test]
    /// A second pool of the same name is rejected and the cookie of the
    /// failed attempt is still waited on.
    fn test_create_pool_twice() {
        let dm = mapper();
        let dir = tempfile::tempdir().unwrap();
        let data = backing(&dir, "data", IEC::Gi);
        let meta = backing(&dir, "meta", IEC::Mi);
        let pool = test_name("pool").expect("valid format");

        dm.create_pool(&pool, &data, &meta, BLOCK_SIZE).unwrap();
        assert_matches!(
            dm.create_pool(&pool, &data, &meta, BLOCK_SIZE),
            Err(DmError::Dm(ErrorEnum::Busy, _))
        );
        assert_eq!(dm.engine().count_calls("udev_wait"), 2);
        assert!(dm.engine().outstanding_cookies().is_empty());
    }

    #[test]
    /// Reloading a pool with the table it was created with changes nothing.
    fn test_create_then_reload_pool() {
        let dm = mapper();
        let dir = tempfile::tempdir().unwrap();
        let data = backing(&dir, "data", IEC::Gi);
        let meta = backing(&dir, "meta", IEC::Mi);
        let pool = test_name("pool").expect("valid format");

        dm.create_pool(&pool, &data, &meta, BLOCK_SIZE).unwrap();
        let created = dm.get_table(&pool).unwrap();

        dm.reload_pool(&pool, &data, &meta, BLOCK_SIZE).unwrap();
        assert!(dm.get_info(&pool).unwrap().inactive_table);
        assert_eq!(dm.engine().count_calls("set_cookie"), 1);

        dm.suspend_device(&pool).unwrap();
        dm.resume_device(&pool).unwrap();
        assert_eq!(dm.get_table(&pool).unwrap(), created);
        assert!(!dm.get_info(&pool).unwrap().inactive_table);
    }

    #[test]
    /// A reload picks up a grown data device.
    fn test_reload_pool_grown() {
        let dm = mapper();
        let dir = tempfile::tempdir().unwrap();
        let data = backing(&dir, "data", IEC::Gi);
        let meta = backing(&dir, "meta", IEC::Mi);
        let pool = test_name("pool").expect("valid format");

        dm.create_pool(&pool, &data, &meta, BLOCK_SIZE).unwrap();
        backing(&dir, "data", 2 * IEC::Gi);
        dm.reload_pool(&pool, &data, &meta, BLOCK_SIZE).unwrap();
        dm.resume_device(&pool).unwrap();
        assert_eq!(
            dm.engine().live_table(&pool)[0].length,
            Sectors(2 * IEC::Gi / 512)
        );
    }

    #[test]
    fn test_reload_absent_pool() {
        let dm = mapper();
        let dir = tempfile::tempdir().unwrap();
        let data = backing(&dir, "data", IEC::Gi);
        let meta = backing(&dir, "meta", IEC::Mi);
        let pool = test_name("pool").expect("valid format");

        assert_matches!(
            dm.reload_pool(&pool, &data, &meta, BLOCK_SIZE)
                .unwrap_err()
                .root(),
            DmError::Core(Error::TaskRun(TaskKind::Reload, _))
        );
    }

    #[test]
    fn test_set_transaction_id() {
        let dm = mapper();
        let dir = tempfile::tempdir().unwrap();
        let data = backing(&dir, "data", IEC::Gi);
        let meta = backing(&dir, "meta", IEC::Mi);
        let pool = test_name("pool").expect("valid format");
        dm.create_pool(&pool, &data, &meta, BLOCK_SIZE).unwrap();

        dm.set_transaction_id(&pool, 0, 1).unwrap();
        assert_eq!(dm.engine().transaction_id(&pool), 1);
        assert!(dm.engine().calls().contains(&format!(
            "message {pool} set_transaction_id 0 1"
        )));

        assert_matches!(dm.set_transaction_id(&pool, 0, 2), Err(_));
        assert_eq!(dm.engine().transaction_id(&pool), 1);
        assert!(dm
            .get_status(&pool)
            .unwrap()
            .params
            .starts_with("1 "));
    }

    #[test]
    fn test_set_transaction_id_message_setup_failure() {
        let dm = mapper();
        let pool = test_name("pool").expect("valid format");
        dm.engine().fail_setter("set_message");

        let err = dm.set_transaction_id(&pool, 0, 1).unwrap_err();
        assert!(err.to_string().starts_with(&format!(
            "Error setting transaction id of pool {pool} from 0 to 1"
        )));
        assert_matches!(err.root(), DmError::Core(Error::SetMessage(_)));
    }
}
