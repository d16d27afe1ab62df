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

//! The caller-owned request (spec.md §3) and its scatter-gather vector.
//!
//! A guest-backed iovec is, in the real device model, a pointer into guest
//! memory handed to us by the frontend emulator. We keep that shape here
//! (a raw base pointer and length, exactly like `util::aio::Iovec` in the
//! teacher) rather than wrapping it in a borrowed slice, because the
//! request must be free to cross into a worker thread and back before the
//! borrow could ever be expressed lifetime-safely. The caller-side
//! invariant from spec.md §3 is load-bearing here: the memory `iov[i].base`
//! points at must stay valid and unmoved until the callback fires.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::align::AlignInfo;
use crate::error::BlockError;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug)]
pub struct IoVec {
    pub base: *mut u8,
    pub len: usize,
}

impl IoVec {
    pub fn new(base: *mut u8, len: usize) -> Self {
        IoVec { base, len }
    }

    /// # Safety
    /// The caller must guarantee `base..base+len` is valid, exclusively
    /// borrowed for the lifetime of the returned slice, and that no other
    /// alias is read or written for as long as the slice is live.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base, self.len)
    }

    /// # Safety
    /// Same contract as [`IoVec::as_slice`], plus exclusivity.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.base, self.len)
    }
}

pub type Callback = Box<dyn FnOnce(&Request, Option<BlockError>) + Send>;

/// A single block request, borrowed by the core until its callback fires.
pub struct Request {
    pub id: u64,
    pub qidx: usize,
    pub offset: u64,
    pub iov: Vec<IoVec>,
    pub resid: u64,
    pub align_info: Option<AlignInfo>,
    callback: Option<Callback>,
}

// SAFETY: `IoVec`'s raw pointers reference guest/caller memory that the
// caller guarantees (spec.md §3) stays valid and is not concurrently
// touched by anyone but the core until the callback fires; that's exactly
// the same contract that lets the core hand the request to a worker
// thread.
unsafe impl Send for Request {}

impl Request {
    pub fn new(qidx: usize, offset: u64, iov: Vec<IoVec>, callback: Callback) -> Self {
        let resid = iov.iter().map(|v| v.len as u64).sum();
        Request {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            qidx,
            offset,
            iov,
            resid,
            align_info: None,
            callback: Some(callback),
        }
    }

    /// A flush or zero-length discard carries no iovec; `resid`/`offset`
    /// still make sense as zero.
    pub fn new_without_iov(qidx: usize, offset: u64, resid: u64, callback: Callback) -> Self {
        Request {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            qidx,
            offset,
            iov: Vec::new(),
            resid,
            align_info: None,
            callback: Some(callback),
        }
    }

    pub fn iov_len(&self) -> u64 {
        self.iov.iter().map(|v| v.len as u64).sum()
    }

    /// Invoke the callback exactly once. Panics if called twice — that
    /// would mean a bug in the core, not a caller error.
    pub fn complete(mut self, err: Option<BlockError>) {
        let cb = self
            .callback
            .take()
            .expect("Request::complete invoked twice");
        cb(&self, err);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("qidx", &self.qidx)
            .field("offset", &self.offset)
            .field("resid", &self.resid)
            .field("iovcnt", &self.iov.len())
            .finish()
    }
}
