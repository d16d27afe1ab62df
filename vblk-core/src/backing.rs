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

//! The immutable-after-open backing metadata (spec.md §3's `Context`
//! fields other than the queue array and engine table), shared by both
//! engines and by the discard path.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{DiscardLimits, WriteZeroesMode};
use crate::lock::RangeLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingKind {
    Regular,
    Block,
}

#[derive(Clone, Copy, Debug)]
pub struct SubRange {
    pub start: u64,
    pub length: u64,
}

pub struct BackingHandle {
    pub fd: RawFd,
    pub kind: BackingKind,
    pub read_only: bool,
    pub logical_size: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub sub_range: Option<SubRange>,
    pub discard: Option<DiscardLimits>,
    pub write_zeroes: WriteZeroesMode,
    pub bypass_host_cache: bool,
    write_cache: AtomicBool,
    /// Held for the lifetime of the context when a sub-range is configured
    /// (spec.md §3's "Backing locks"); dropping the handle releases it.
    _range_lock: Option<RangeLock>,
}

impl BackingHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fd: RawFd,
        kind: BackingKind,
        read_only: bool,
        logical_size: u64,
        logical_sector_size: u32,
        physical_sector_size: u32,
        sub_range: Option<SubRange>,
        discard: Option<DiscardLimits>,
        write_zeroes: WriteZeroesMode,
        bypass_host_cache: bool,
        write_cache: bool,
        range_lock: Option<RangeLock>,
    ) -> Self {
        BackingHandle {
            fd,
            kind,
            read_only,
            logical_size,
            logical_sector_size,
            physical_sector_size,
            sub_range,
            discard,
            write_zeroes,
            bypass_host_cache,
            write_cache: AtomicBool::new(write_cache),
            _range_lock: range_lock,
        }
    }

    pub fn write_cache(&self) -> bool {
        self.write_cache.load(Ordering::Acquire)
    }

    pub fn set_write_cache(&self, enabled: bool) {
        self.write_cache.store(enabled, Ordering::Release);
    }

    /// Translate a caller-visible offset into an absolute file offset,
    /// honouring the configured sub-range (spec.md §3, §4.6, P7).
    pub fn absolute_offset(&self, caller_offset: u64) -> u64 {
        match self.sub_range {
            Some(r) => r.start + caller_offset,
            None => caller_offset,
        }
    }

    /// The exclusive upper bound of the region the core is allowed to
    /// touch (spec.md P7).
    pub fn bound(&self) -> u64 {
        match self.sub_range {
            Some(r) => r.start + r.length,
            None => self.logical_size,
        }
    }
}

impl Drop for BackingHandle {
    fn drop(&mut self) {
        // Release the range lock (an `F_OFD_SETLK` unlock keyed on `self.fd`)
        // before closing the descriptor it names. Field drop order would
        // otherwise run this after the `libc::close` below, unlocking
        // against a descriptor number the kernel may already have handed to
        // an unrelated open in another thread.
        self._range_lock.take();
        // SAFETY: fd is owned exclusively by this handle and not used by
        // anyone after the context (and hence this handle) is dropped —
        // `Context::close` has already joined/torn down every engine by
        // the time its `Arc<BackingHandle>`'s last reference goes away.
        unsafe {
            libc::close(self.fd);
        }
    }
}
