// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The engine log hook.
//!
//! Engines report what happened during a run as log lines. Besides being
//! forwarded to a `DmLogger`, each line is inspected for the two failure
//! causes callers care about: a busy device and an object that already
//! exists. The result of the inspection is captured per run.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Mutex, MutexGuard, PoisonError, RwLock,
};

use nix::errno::Errno;
use once_cell::sync::Lazy;

/// Error level
pub const LOG_ERR: i32 = 3;
/// Warning level
pub const LOG_WARN: i32 = 4;
/// Notice level
pub const LOG_NOTICE: i32 = 5;
/// Info level
pub const LOG_INFO: i32 = 6;
/// Debug level, never inspected for failure causes
pub const LOG_DEBUG: i32 = 7;

/// Receiver for engine log lines.
pub trait DmLogger: Send + Sync {
    /// Handle one line.
    fn log(&self, level: i32, file: &str, line: u32, errno: i32, message: &str);
}

/// Forwards engine log lines to the `log` crate.
#[derive(Debug, Default)]
pub struct DefaultLogger;

impl DmLogger for DefaultLogger {
    fn log(&self, level: i32, file: &str, line: u32, errno: i32, message: &str) {
        match level {
            i32::MIN..=LOG_ERR => error!("libdevmapper({level}): {file}:{line} ({errno}) {message}"),
            LOG_WARN => warn!("libdevmapper({level}): {file}:{line} ({errno}) {message}"),
            LOG_NOTICE | LOG_INFO => {
                info!("libdevmapper({level}): {file}:{line} ({errno}) {message}")
            }
            _ => debug!("libdevmapper({level}): {file}:{line} ({errno}) {message}"),
        }
    }
}

static LOGGER: Lazy<RwLock<Box<dyn DmLogger>>> =
    Lazy::new(|| RwLock::new(Box::new(DefaultLogger)));

static VERBOSITY: AtomicI32 = AtomicI32::new(LOG_DEBUG);

static SAW_BUSY: AtomicBool = AtomicBool::new(false);
static SAW_EXISTS: AtomicBool = AtomicBool::new(false);

/// Serializes task runs so that captured state belongs to exactly one run.
static RUN_LOCK: Mutex<()> = Mutex::new(());

/// The failure causes observed during one run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Captured {
    /// A log line reported a busy device
    pub busy: bool,
    /// A log line reported that an object already exists
    pub exists: bool,
}

/// Register the logger that receives engine log lines.
pub fn log_init(logger: Box<dyn DmLogger>) {
    let mut slot = LOGGER.write().unwrap_or_else(PoisonError::into_inner);
    *slot = logger;
}

/// Set the most verbose level that is forwarded to the logger. Capture is
/// unaffected.
pub fn log_init_verbose(level: i32) {
    VERBOSITY.store(level, Ordering::SeqCst);
}

/// Clear the captured failure causes.
pub fn reset_captured() {
    SAW_BUSY.store(false, Ordering::SeqCst);
    SAW_EXISTS.store(false, Ordering::SeqCst);
}

fn read_captured() -> Captured {
    Captured {
        busy: SAW_BUSY.load(Ordering::SeqCst),
        exists: SAW_EXISTS.load(Ordering::SeqCst),
    }
}

/// The log hook engines call.
pub fn dm_log(level: i32, file: &str, line: u32, errno: i32, message: &str) {
    if level < LOG_DEBUG {
        if errno == Errno::EBUSY as i32 || message.contains("busy") {
            SAW_BUSY.store(true, Ordering::SeqCst);
        }
        if errno == Errno::EEXIST as i32 || message.contains("File exists") {
            SAW_EXISTS.store(true, Ordering::SeqCst);
        }
    }

    if level <= VERBOSITY.load(Ordering::SeqCst) {
        LOGGER
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log(level, file, line, errno, message);
    }
}

fn run_lock() -> MutexGuard<'static, ()> {
    RUN_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` with the run lock held, with captured state cleared before and
/// read after.
pub fn capture<T, F>(f: F) -> (T, Captured)
where
    F: FnOnce() -> T,
{
    let _guard = run_lock();
    reset_captured();
    let result = f();
    (result, read_captured())
}
