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

//! A block I/O backend core for virtio-blk/AHCI-style device models: a
//! bounded per-queue request scheduler sitting in front of two
//! interchangeable execution engines (a synchronous thread pool, or an
//! io_uring ring driven by an external reactor), with an alignment-
//! conversion layer for O_DIRECT backings and an ordering gate that
//! serializes requests whose byte ranges meet.

pub mod align;
pub mod backing;
pub mod cancel;
pub mod config;
pub mod context;
pub mod discard;
pub mod engine;
pub mod error;
pub mod lock;
pub mod ordering;
pub mod queue;
pub mod rawio;
pub mod reactor;
pub mod request;

pub use backing::{BackingHandle, BackingKind};
pub use config::{BackendConfig, DiscardLimits, EngineKind, WriteZeroesMode};
pub use context::Context;
pub use error::BlockError;
pub use queue::Queue;
pub use reactor::Reactor;
pub use request::{Callback, IoVec, Request};
