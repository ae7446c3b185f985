// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{mem::size_of, ptr, slice};

use nix::libc::c_char;

/// The smallest number divisible by `align_to` and at least `num`.
/// Precondition: `align_to` is a power of 2.
/// Precondition: `num` + `align_to` < usize::MAX + 1.
#[inline]
pub fn align_to(num: usize, align_to: usize) -> usize {
    let agn = align_to - 1;

    (num + agn) & !agn
}

/// Return the slice up to, but not including, the first NUL byte, or None
/// if there is no NUL byte.
pub fn slice_to_null(slc: &[u8]) -> Option<&[u8]> {
    slc.iter().position(|c| *c == b'\0').map(|i| &slc[..i])
}

/// Copy `src` into the C string buffer `dst`. The caller guarantees that
/// `src` is shorter than `dst` so that the buffer stays NUL terminated.
pub fn copy_to_c_str(dst: &mut [c_char], src: &[u8]) {
    let dst = unsafe { slice::from_raw_parts_mut(dst as *mut _ as *mut u8, dst.len()) };
    dst[..src.len()].clone_from_slice(src);
}

/// View a C struct as the bytes it occupies.
pub fn slice_from_c_struct<T>(strct: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(strct as *const _ as *const u8, size_of::<T>()) }
}

/// Read a C struct from the start of a byte slice, which need not be
/// aligned. Returns None if the slice is too short.
pub fn c_struct_from_slice<T>(slc: &[u8]) -> Option<T> {
    if slc.len() < size_of::<T>() {
        return None;
    }
    Some(unsafe { ptr::read_unaligned(slc.as_ptr() as *const T) })
}
