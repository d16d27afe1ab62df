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

//! The sub-range advisory lock (spec.md §3 "Backing locks"). Uses an
//! open-file-description lock (`F_OFD_SETLK`) rather than a classic
//! process-associated `fcntl` lock, because an OFD lock is released only
//! when every descriptor referring to this open file description closes —
//! exactly the "held for the context's lifetime" semantics spec.md wants,
//! and it correctly conflicts with another process's sub-range instead of
//! silently merging with a lock this same process already holds on the
//! file via a different descriptor.

use std::os::unix::io::RawFd;

use crate::error::BlockError;

pub struct RangeLock {
    fd: RawFd,
    start: i64,
    len: i64,
}

impl RangeLock {
    /// Acquire an exclusive OFD lock on `[start, start+length)`. Fails the
    /// open (spec.md §4.8: "abort open on lock failure") if another
    /// process already holds an overlapping lock.
    pub fn acquire(fd: RawFd, start: u64, length: u64) -> Result<Self, BlockError> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_WRLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = length as libc::off_t;

        // SAFETY: fd is a valid open descriptor for the duration of the call.
        let ret = unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, &fl) };
        if ret != 0 {
            return Err(BlockError::Fatal(format!(
                "sub-range [{start}, {}) is already locked by another process: {}",
                start + length,
                std::io::Error::last_os_error()
            )));
        }
        Ok(RangeLock {
            fd,
            start: start as i64,
            len: length as i64,
        })
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_UNLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = self.start as libc::off_t;
        fl.l_len = self.len as libc::off_t;
        // SAFETY: fd is still open (the handle holding this lock is
        // dropped before the fd itself is closed — see `BackingHandle`).
        unsafe {
            libc::fcntl(self.fd, libc::F_OFD_SETLK, &fl);
        }
    }
}
