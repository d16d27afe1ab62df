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

//! The external event-loop interface the ring engine needs (spec.md §6):
//! register a file descriptor with a readiness callback, or unregister it.
//! Implemented by whatever reactor the frontend process already runs; the
//! ring engine is the only consumer.

use std::os::unix::io::RawFd;
use std::sync::Arc;

pub trait Reactor: Send + Sync {
    /// Invoke `callback` whenever `fd` becomes readable.
    fn register(&self, fd: RawFd, callback: Arc<dyn Fn() + Send + Sync>);
    fn unregister(&self, fd: RawFd);
}
