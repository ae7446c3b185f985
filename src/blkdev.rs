// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Block and loop device plumbing.

use std::{
    fs::{self, File, OpenOptions},
    io,
    mem,
    os::unix::{
        fs::{FileTypeExt, MetadataExt},
        io::AsRawFd,
    },
    path::{Path, PathBuf},
};

use crate::{
    core::errors::Error,
    result::{DmError, DmResult},
    units::Bytes,
};

mod ioctl {
    use super::LoopInfo64;

    ioctl_read!(blkgetsize64, 0x12, 114, u64);
    ioctl_write_ptr_bad!(blkdiscard, request_code_none!(0x12, 119), [u64; 2]);
    ioctl_read_bad!(loop_get_status64, 0x4C05, LoopInfo64);
    ioctl_write_int_bad!(loop_set_capacity, 0x4C07);
}

use self::ioctl::{blkdiscard, blkgetsize64, loop_get_status64, loop_set_capacity};

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// struct loop_info64 from linux/loop.h
#[repr(C)]
#[allow(dead_code)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

/// The path a file was opened with, for error messages.
fn file_path(file: &File) -> PathBuf {
    let fd_link = PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()));
    fs::read_link(&fd_link).unwrap_or(fd_link)
}

fn block_device_error<E: ToString>(file: &File, err: E) -> DmError {
    DmError::Core(Error::BlockDevice(file_path(file), err.to_string()))
}

/// The size of a block device. The length of a regular file is taken as
/// its size, so that pools can be tried out on files.
pub fn blkdev_size(file: &File) -> DmResult<Bytes> {
    let metadata = file.metadata().map_err(|err| {
        DmError::Core(Error::MetadataIo(file_path(file), err.to_string()))
    })?;

    let file_type = metadata.file_type();
    if file_type.is_file() {
        return Ok(Bytes(u128::from(metadata.len())));
    }
    if !file_type.is_block_device() {
        return Err(block_device_error(
            file,
            "neither a block device nor a regular file",
        ));
    }

    let mut val: u64 = 0;
    match unsafe { blkgetsize64(file.as_raw_fd(), &mut val) } {
        Err(err) => {
            error!("Error getting block device size: {}", err);
            Err(block_device_error(file, err))
        }
        Ok(_) => Ok(Bytes(u128::from(val))),
    }
}

/// Discard every block of the device at `path`, then sync.
pub fn block_device_discard(path: &Path) -> DmResult<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| DmError::Core(Error::BlockDevice(path.to_owned(), err.to_string())))?;

    let size = blkdev_size(&file)?;
    let range: [u64; 2] = [0, *size as u64];
    unsafe { blkdiscard(file.as_raw_fd(), &range) }.map_err(|err| {
        error!("Error discarding blocks of {}: {}", path.display(), err);
        DmError::Core(Error::BlockDevice(path.to_owned(), err.to_string()))
    })?;

    // A removal that immediately follows a discard can fail with EBUSY
    // unless the discard has been flushed.
    nix::unistd::sync();
    Ok(())
}

/// The device and inode numbers of the file backing a loop device.
pub fn loopback_backing_file(file: &File) -> DmResult<(u64, u64)> {
    let mut info: LoopInfo64 = unsafe { mem::zeroed() };
    unsafe { loop_get_status64(file.as_raw_fd(), &mut info) }.map_err(|err| {
        DmError::Core(Error::Loopback(format!(
            "failed to get backing file of {}: {}",
            file_path(file).display(),
            err
        )))
    })?;
    Ok((info.lo_device, info.lo_inode))
}

/// Make a loop device pick up a change in the size of its backing file.
pub fn loopback_set_capacity(file: &File) -> DmResult<()> {
    unsafe { loop_set_capacity(file.as_raw_fd(), 0) }.map_err(|err| {
        error!("Error setting loop device capacity: {}", err);
        DmError::Core(Error::Loopback(format!(
            "failed to set capacity of {}: {}",
            file_path(file).display(),
            err
        )))
    })?;
    Ok(())
}

/// Find the loop device backed by `file`, scanning /dev/loopN from 0 up to
/// the first N for which there is no device node. Devices that can't be
/// opened are skipped.
pub fn find_loop_device_for(file: &File) -> DmResult<Option<(PathBuf, File)>> {
    let metadata = file.metadata().map_err(|err| {
        DmError::Core(Error::MetadataIo(file_path(file), err.to_string()))
    })?;
    let (target_dev, target_ino) = (metadata.dev(), metadata.ino());

    for index in 0.. {
        let path = PathBuf::from(format!("/dev/loop{index}"));
        let loop_file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(loop_file) => loop_file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => break,
            Err(err) => {
                trace!("Skipping {}: {}", path.display(), err);
                continue;
            }
        };

        match loopback_backing_file(&loop_file) {
            Ok((dev, ino)) if dev == target_dev && ino == target_ino => {
                return Ok(Some((path, loop_file)));
            }
            _ => (),
        }
    }

    Ok(None)
}
