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

//! The error kinds surfaced to callers (spec.md §7). Internal plumbing uses
//! `anyhow::Result`; this type is the boundary the submission API and the
//! request callback's `errno` field speak.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("qidx {0} outside queue range")]
    InvalidQueueIndex(usize),

    #[error("queue is full")]
    TooBig,

    #[error("write or discard attempted on a read-only backend")]
    ReadOnly,

    #[error("operation not supported by this backend")]
    NotSupported,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("bounce buffer allocation failed")]
    AllocFail,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A condition spec.md §7 calls fatal: the backend cannot safely
    /// continue (sub-range lock conflict at open, allocation failure during
    /// open). The library returns this as an `Err` rather than aborting the
    /// process itself; a frontend's `main` is the right place to turn it
    /// into `std::process::abort()`.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl BlockError {
    /// The last OS error, wrapped as an `Io` variant. Used after a negative
    /// syscall return, matching the teacher's `std::io::Error::last_os_error`
    /// convention in `util::aio`.
    pub fn last_os_error() -> Self {
        BlockError::Io(std::io::Error::last_os_error())
    }
}
