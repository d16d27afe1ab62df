// Copyright (c) 2024 The vblk Authors.
//
// vblk is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the
// Mulan PSL v2. You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Thin wrappers around the positional vector I/O syscalls, mirroring
//! `util::aio`'s `raw_readv`/`raw_writev`/`raw_datasync` free functions.
//! Every call here uses the positional variant so no shared seek pointer
//! exists between queues sharing one file descriptor (spec.md §5).

use std::os::unix::io::RawFd;

use crate::request::IoVec;

/// Convert our raw-pointer iovec into the libc shape. Shared with the ring
/// engine, which needs the same conversion to build an `io_uring` SQE.
pub(crate) fn to_libc_iovecs(iov: &[IoVec]) -> Vec<libc::iovec> {
    iov.iter()
        .map(|v| libc::iovec {
            iov_base: v.base as *mut libc::c_void,
            iov_len: v.len,
        })
        .collect()
}

/// Positional vector read. Returns the syscall's raw return value
/// (negative on error, `errno` describes it).
pub fn preadv(fd: RawFd, iov: &[IoVec], offset: u64) -> isize {
    let iovecs = to_libc_iovecs(iov);
    // SAFETY: iovecs borrow caller-valid memory per the `Request` contract;
    // preadv does not retain the pointers past the call.
    unsafe { libc::preadv(fd, iovecs.as_ptr(), iovecs.len() as i32, offset as libc::off_t) }
}

/// Positional vector write.
pub fn pwritev(fd: RawFd, iov: &[IoVec], offset: u64) -> isize {
    let iovecs = to_libc_iovecs(iov);
    // SAFETY: see `preadv`.
    unsafe { libc::pwritev(fd, iovecs.as_ptr(), iovecs.len() as i32, offset as libc::off_t) }
}

/// Positional read into a single contiguous buffer (used by the alignment
/// pre-fill / post-fill paths, which always deal with one bounce buffer).
pub fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> isize {
    // SAFETY: buf is a valid, exclusively borrowed slice for the call.
    unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    }
}

pub fn fsync(fd: RawFd) -> i32 {
    // SAFETY: fd is a valid, open descriptor owned by the caller.
    unsafe { libc::fsync(fd) }
}

pub fn fdatasync(fd: RawFd) -> i32 {
    // SAFETY: see `fsync`.
    unsafe { libc::fdatasync(fd) }
}
