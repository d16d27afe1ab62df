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

//! Small host accessors that do not belong to any one module.

use std::sync::OnceLock;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The host's page size, queried once via `sysconf` and cached.
pub fn host_page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf with _SC_PAGESIZE never fails on a sane host.
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret <= 0 {
            4096
        } else {
            ret as usize
        }
    })
}

/// The calling thread's kernel tid, used to target signal-based
/// cancellation at exactly one worker thread.
pub fn gettid() -> libc::pid_t {
    // SAFETY: SYS_gettid takes no arguments and always succeeds.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_reasonable() {
        let sz = host_page_size();
        assert!(sz >= 4096);
        assert!(sz.is_power_of_two());
    }

    #[test]
    fn gettid_is_nonzero() {
        assert!(gettid() > 0);
    }
}
