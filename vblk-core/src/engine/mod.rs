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

//! The two interchangeable execution engines (spec.md §4.4, §4.5) behind
//! one small capability trait, per the design notes in spec.md §9: `init`,
//! `deinit`, and `kick`. `Context` stores a single `Arc<dyn Engine>` — "a
//! pointer to the selected engine's method table" — shared across every
//! queue it owns; each engine tracks its own per-queue resources (worker
//! threads, or a ring + reactor registration) keyed by `qidx` internally.

#[cfg(target_os = "linux")]
pub mod ring;
pub mod thread_pool;

use std::sync::Arc;

use crate::backing::BackingHandle;
use crate::queue::Queue;

pub trait Engine: Send + Sync {
    /// Attach whatever per-queue resources this engine needs. Called once
    /// per queue during `Context::open`.
    fn init(&self, backing: Arc<BackingHandle>, queue: Arc<Queue>) -> anyhow::Result<()>;

    /// Tear down a queue's resources (join workers, or deregister and close
    /// a ring). Called once per queue during `Context::close`.
    fn deinit(&self, queue: &Queue);

    /// Wake whatever waits for newly-pending work on `queue` (condition
    /// variable for the thread-pool engine, a self-kick on the ring engine
    /// so a partially-drained ring gets re-entered even with no further
    /// kernel completions — see SPEC_FULL.md §4's decision on the spec's
    /// open question).
    fn kick(&self, queue: &Queue);

    /// Whether `cancel` may interrupt a slot that is already `Busy` on this
    /// engine (true for the thread-pool engine, false for the ring engine —
    /// spec.md §4.7).
    fn supports_busy_cancel(&self) -> bool;
}
