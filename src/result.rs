// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt};

use crate::core::errors;

/// A very simple breakdown of outer layer errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorEnum {
    /// generic error code
    Error,
    /// invalid value passed as argument
    Invalid,
    /// something not found
    NotFound,
    /// the device is in use and the operation can not proceed
    Busy,
    /// the object the operation would create is already present
    AlreadyExists,
    /// the operation completed but left a device suspended
    Suspended,
}

impl fmt::Display for ErrorEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Super error type, with constructors distinguishing outer errors from
/// core errors.
#[derive(Clone, Debug)]
pub enum DmError {
    /// DM errors
    Dm(ErrorEnum, String),
    /// Errors in the core devicemapper functionality
    Core(errors::Error),
    /// An error annotated with the operation and device it occurred in
    Chained(String, Box<DmError>),
}

/// return result for DM functions
pub type DmResult<T> = Result<T, DmError>;

impl DmError {
    /// Wrap this error with a message naming the operation that failed.
    pub fn chain<S: Into<String>>(self, msg: S) -> DmError {
        DmError::Chained(msg.into(), Box::new(self))
    }

    /// The innermost error, with all annotations stripped.
    pub fn root(&self) -> &DmError {
        match self {
            DmError::Chained(_, err) => err.root(),
            err => err,
        }
    }

    /// The outer error kind, if the innermost error has one.
    pub fn kind(&self) -> Option<ErrorEnum> {
        match self.root() {
            DmError::Dm(kind, _) => Some(*kind),
            _ => None,
        }
    }

    /// True if the operation failed because the device was busy.
    pub fn is_busy(&self) -> bool {
        self.kind() == Some(ErrorEnum::Busy)
    }

    /// True if the operation failed because its object already existed.
    pub fn is_already_exists(&self) -> bool {
        self.kind() == Some(ErrorEnum::AlreadyExists)
    }
}

impl From<errors::Error> for DmError {
    fn from(err: errors::Error) -> DmError {
        DmError::Core(err)
    }
}

impl fmt::Display for DmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DmError::Core(ref err) => write!(f, "DM Core error: {err}"),
            DmError::Dm(ref err, ref msg) => write!(f, "DM error: {err}: {msg}"),
            DmError::Chained(ref msg, ref err) => write!(f, "{msg}: {err}"),
        }
    }
}

impl Error for DmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DmError::Core(err) => Some(err),
            DmError::Chained(_, err) => Some(err.as_ref()),
            DmError::Dm(..) => None,
        }
    }
}
