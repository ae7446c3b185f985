// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Udev notification cookies.
//!
//! A cookie is the SysV IPC key of a semaphore set with a single semaphore.
//! The cookie is passed to the kernel in the event_nr field of an ioctl
//! header and is attached to the uevents the ioctl generates. The udev rules
//! decrement the semaphore once rule processing is complete, which lets the
//! caller wait for udev to settle the device nodes.
//!
//! The counter life cycle is: created at 1, incremented to 2 before the
//! ioctl, decremented once by udev (or by the caller if no uevent was
//! generated), decremented once more by the waiter, which then waits for 0.

use std::{io, path::Path};

use nix::{
    libc::{
        c_int, key_t, sembuf, semctl as libc_semctl, semget as libc_semget,
        semop as libc_semop, EEXIST, ENOMEM, ENOSPC, IPC_CREAT, IPC_EXCL, IPC_NOWAIT, IPC_RMID,
    },
    unistd::{access, AccessFlags},
};
use once_cell::sync::Lazy;
use rand::Rng;
use retry::{delay::NoDelay, retry, OperationResult};

use crate::{
    core::{
        dm_ioctl as dmi, errors,
        sysvsem::{semun, seminfo, GETVAL, SEM_INFO, SETVAL},
    },
    result::{DmError, DmResult},
};

// Mode for cookie semaphore creation
const COOKIE_MODE: i32 = 0o600;

// Attempts at finding an unused IPC key
const COOKIE_ALLOC_ATTEMPTS: usize = 4;

const UDEV_SOCKET_PATH: &str = "/run/udev/control";

impl DmError {
    fn udev_sync_error_from_os() -> DmError {
        DmError::Core(errors::Error::UdevSync(
            io::Error::last_os_error().to_string(),
        ))
    }
}

static SYSV_SEM_SUPPORTED: Lazy<bool> = Lazy::new(sysv_sem_supported);

/// Test whether the system is configured for SysV semaphore support.
fn sysv_sem_supported() -> bool {
    let mut info: seminfo = Default::default();
    let arg = semun { __buf: &mut info };
    match semctl(0, 0, SEM_INFO, Some(arg)) {
        Ok(maxid) if maxid < 0 => {
            warn!(concat!(
                "Kernel not configured for System V IPC semaphores. ",
                "Disabling udev notifications."
            ));
            false
        }
        Err(err) => {
            error!(
                concat!(
                    "Error retrieving System V semaphore limits: {}. ",
                    "Disabling udev notifications."
                ),
                err
            );
            false
        }
        Ok(_) => {
            if info.semmsl > 0 && info.semmni > 0 && info.semmns > 0 {
                if info.semmsl < 1000 || info.semmni < 1000 || info.semmns < 1000 {
                    warn!(concat!(
                        "Low System V IPC semaphore limits detected: consider ",
                        "increasing values in /proc/sys/kernel/sem to avoid exhaustion."
                    ));
                }
                true
            } else {
                false
            }
        }
    }
}

fn udev_running() -> bool {
    access(Path::new(UDEV_SOCKET_PATH), AccessFlags::F_OK).is_ok()
}

/// Whether cookies can be handed out at all: udev must be listening and the
/// kernel must offer SysV semaphores.
pub fn udev_sync_supported() -> bool {
    udev_running() && *SYSV_SEM_SUPPORTED
}

/// Allocate or retrieve a SysV semaphore set identifier
fn semget(key: i32, nsems: i32, semflg: i32) -> Result<i32, io::Error> {
    let semid = unsafe { libc_semget(key as key_t, nsems as c_int, semflg as c_int) };
    match semid {
        i if i < 0 => Err(io::Error::last_os_error()),
        _ => Ok(semid),
    }
}

fn semctl_cmd_allowed(cmd: i32) -> Result<(), io::Error> {
    match cmd {
        IPC_RMID | GETVAL | SETVAL | SEM_INFO => Ok(()),
        _ => Err(io::Error::from(io::ErrorKind::Unsupported)),
    }
}

/// SysV semaphore set control operations
fn semctl(semid: i32, semnum: i32, cmd: i32, semun: Option<semun>) -> Result<i32, io::Error> {
    semctl_cmd_allowed(cmd)?;
    let semun = semun.unwrap_or_default();
    let r = unsafe { libc_semctl(semid as c_int, semnum as c_int, cmd as c_int, semun) };
    match r {
        i if i < 0 => Err(io::Error::last_os_error()),
        _ => Ok(r),
    }
}

/// Apply `sem_op` to the only semaphore of the set.
fn semop(semid: i32, sem_op: i16, sem_flg: i16) -> Result<(), io::Error> {
    let mut sb = sembuf {
        sem_num: 0,
        sem_op,
        sem_flg,
    };
    match unsafe { libc_semop(semid, &mut sb, 1) } {
        i if i < 0 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Attempt to generate a unique, non-zero SysV IPC key and allocate a
/// semaphore set for notifications.
fn generate_semaphore_cookie() -> OperationResult<(u32, i32), io::Error> {
    let mut base_cookie = 0u16;
    while base_cookie == 0 {
        base_cookie = rand::rng().random::<u16>();
    }
    let cookie = dmi::DM_COOKIE_MAGIC << dmi::DM_UDEV_FLAGS_SHIFT | u32::from(base_cookie);
    match semget(cookie as i32, 1, COOKIE_MODE | IPC_CREAT | IPC_EXCL) {
        Ok(semid) => OperationResult::Ok((cookie, semid)),
        Err(err) => match err.raw_os_error() {
            Some(ENOMEM) | Some(ENOSPC) => OperationResult::Err(err),
            Some(EEXIST) => OperationResult::Retry(err),
            _ => OperationResult::Err(err),
        },
    }
}

/// Create a new, unique udev notification semaphore and return the cookie
/// value and semid. The counter starts at 1.
fn notify_sem_create() -> DmResult<(u32, i32)> {
    let (cookie, semid) = retry(
        NoDelay.take(COOKIE_ALLOC_ATTEMPTS),
        generate_semaphore_cookie,
    )
    .map_err(|err| {
        error!("Failed to generate udev notification semaphore: {}", err);
        DmError::Core(errors::Error::UdevSync(err.to_string()))
    })?;

    let sem_arg = semun { val: 1 };
    if let Err(err) = semctl(semid, 0, SETVAL, Some(sem_arg)) {
        error!("Failed to initialize udev notification semaphore: {}", err);
        if let Err(err2) = notify_sem_destroy(cookie, semid) {
            error!("Failed to clean up udev notification semaphore: {}", err2);
        }
        return Err(DmError::Core(errors::Error::UdevSync(err.to_string())));
    }
    match semctl(semid, 0, GETVAL, None) {
        Ok(1) => Ok((cookie, semid)),
        _ => {
            error!("Initialization of udev notification semaphore returned inconsistent value.");
            let err = DmError::udev_sync_error_from_os();
            if let Err(err2) = notify_sem_destroy(cookie, semid) {
                error!("Failed to clean up udev notification semaphore: {}", err2);
            }
            Err(err)
        }
    }
}

/// Destroy the notification semaphore identified by semid.
fn notify_sem_destroy(cookie: u32, semid: i32) -> DmResult<()> {
    semctl(semid, 0, IPC_RMID, None).map_err(|err| {
        error!(
            "Failed to remove udev synchronization semaphore {} for cookie {}",
            semid, cookie
        );
        DmError::Core(errors::Error::UdevSync(err.to_string()))
    })?;
    Ok(())
}

fn notify_sem_inc(cookie: u32, semid: i32) -> DmResult<()> {
    semop(semid, 1, 0).map_err(|err| {
        error!(
            "Failed to increment udev synchronization semaphore {} for cookie {}",
            semid, cookie
        );
        DmError::Core(errors::Error::UdevSync(err.to_string()))
    })
}

fn notify_sem_dec(cookie: u32, semid: i32) -> DmResult<()> {
    semop(semid, -1, IPC_NOWAIT as i16).map_err(|err| {
        error!(
            "Failed to decrement udev synchronization semaphore {} for cookie {}",
            semid, cookie
        );
        DmError::Core(errors::Error::UdevSync(err.to_string()))
    })
}

/// Block until the semaphore reaches zero, which happens once udev has
/// finished rule processing for every event tagged with the cookie.
fn notify_sem_wait(cookie: u32, semid: i32) -> DmResult<()> {
    if let Err(err) = notify_sem_dec(cookie, semid) {
        error!(
            concat!(
                "Failed to set initial state for notification ",
                "semaphore identified by cookie value {}: {}"
            ),
            cookie, err
        );
        if let Err(err2) = notify_sem_destroy(cookie, semid) {
            error!("Failed to clean up udev notification semaphore: {}", err2);
        }
        return Err(err);
    }
    semop(semid, 0, 0).map_err(|err| {
        error!(
            "Failed to wait on notification semaphore {} for cookie {}",
            semid, cookie
        );
        DmError::Core(errors::Error::UdevSync(err.to_string()))
    })
}

/// Look up the semaphore set belonging to a cookie.
fn cookie_semid(cookie: u32) -> DmResult<i32> {
    semget(cookie as i32, 1, 0).map_err(|err| {
        error!(
            "Failed to find udev notification semaphore for cookie {}: {}",
            cookie, err
        );
        DmError::Core(errors::Error::UdevSync(err.to_string()))
    })
}

/// Begin a notification transaction and return its cookie.
///
/// Returns 0 if udev synchronization is not available; a 0 cookie is never
/// waited on.
pub fn cookie_create() -> DmResult<u32> {
    if !udev_sync_supported() {
        debug!("Udev synchronization unavailable, using null cookie");
        return Ok(0);
    }

    let (cookie, semid) = notify_sem_create()?;
    if let Err(err) = notify_sem_inc(cookie, semid) {
        error!(
            "Failed to set udev notification semaphore initial state: {}",
            err
        );
        if let Err(err2) = notify_sem_destroy(cookie, semid) {
            error!("Failed to clean up udev notification semaphore: {}", err2);
        }
        return Err(err);
    }

    debug!("Created udev cookie {:#x} with semid {}", cookie, semid);
    Ok(cookie)
}

/// Account for the udev decrement that will never come because the ioctl
/// tagged with `cookie` failed or did not generate a uevent.
pub fn cookie_uevent_missed(cookie: u32) -> DmResult<()> {
    if cookie == 0 {
        return Ok(());
    }
    let semid = cookie_semid(cookie)?;
    trace!("No uevent for cookie {:#x}, releasing udev reference", cookie);
    notify_sem_dec(cookie, semid)
}

/// Wait for udev to complete processing of all events tagged with `cookie`
/// and destroy the cookie's semaphore.
pub fn cookie_wait(cookie: u32) -> DmResult<()> {
    if cookie == 0 {
        return Ok(());
    }
    let semid = cookie_semid(cookie)?;
    trace!("Waiting on udev cookie {:#x}", cookie);
    notify_sem_wait(cookie, semid)?;
    trace!("Destroying udev cookie {:#x}", cookie);
    notify_sem_destroy(cookie, semid)
}
