// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// SysV semaphore definitions that the libc crate does not export for Linux.

use nix::libc::{c_int, c_ushort, semid_ds};

/// Get the value of a semaphore.
pub const GETVAL: c_int = 12;
/// Set the value of a semaphore.
pub const SETVAL: c_int = 16;
/// Get system wide semaphore limits and usage.
pub const SEM_INFO: c_int = 19;

/// The fourth argument to semctl(2).
#[repr(C)]
#[allow(non_camel_case_types)]
pub union semun {
    pub val: c_int,
    pub buf: *mut semid_ds,
    pub array: *mut c_ushort,
    pub __buf: *mut seminfo,
}

impl Default for semun {
    fn default() -> Self {
        semun { val: 0 }
    }
}

/// System wide semaphore limits, filled in by SEM_INFO.
#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Debug, Default)]
pub struct seminfo {
    pub semmap: c_int,
    pub semmni: c_int,
    pub semmns: c_int,
    pub semmnu: c_int,
    pub semmsl: c_int,
    pub semopm: c_int,
    pub semume: c_int,
    pub semusz: c_int,
    pub semvmx: c_int,
    pub semaem: c_int,
}
