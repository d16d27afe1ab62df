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

//! The io_uring engine (spec.md §4.5): one ring per queue, driven by the
//! frontend's own reactor rather than a dedicated thread. Submission
//! happens opportunistically from whichever thread calls `kick` or from the
//! reactor callback that reaps completions; no worker ever blocks in a
//! syscall, so `cancel` cannot interrupt a busy slot here the way it can on
//! the thread-pool engine.
//!
//! spec.md's own design notes flag a liveness bug in the obvious
//! implementation: if completions are only reaped from the eventfd
//! callback, a request that arrives while the ring is fully idle (nothing
//! in flight, so the eventfd will never become readable on its own) sits on
//! the pending list forever. SPEC_FULL.md §4 resolves this the way
//! `handle_continue`'s self-signal resolution in `vblk_util::waiter` resolves
//! an analogous race: `kick` submits synchronously instead of only nudging
//! something else to do it later.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use io_uring::{opcode, squeue, types, IoUring};
use log::error;

use crate::backing::BackingHandle;
use crate::engine::Engine;
use crate::error::BlockError;
use crate::queue::{OpKind, Queue};
use crate::reactor::Reactor;
use crate::request::{IoVec, Request};

/// Submission-queue depth. spec.md doesn't mandate a number; matched to the
/// thread-pool engine's default worker count so neither engine is
/// structurally shallower than the other under the same workload.
const RING_DEPTH: u32 = 128;

struct InFlightEntry {
    idx: u32,
    op: OpKind,
    request: Request,
    /// Kept alive until the matching completion is reaped: the SQE we
    /// pushed holds a raw pointer into this allocation.
    _iovecs: Vec<libc::iovec>,
}

struct RingState {
    ring: Mutex<IoUring>,
    eventfd: RawFd,
    queue: Arc<Queue>,
    backing: Arc<BackingHandle>,
    inflight: Mutex<HashMap<u64, InFlightEntry>>,
    next_user_data: AtomicU64,
}

pub struct RingEngine {
    reactor: Arc<dyn Reactor>,
    state: Mutex<HashMap<usize, Arc<RingState>>>,
}

impl RingEngine {
    pub fn new(reactor: Arc<dyn Reactor>) -> Self {
        RingEngine {
            reactor,
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl Engine for RingEngine {
    fn init(&self, backing: Arc<BackingHandle>, queue: Arc<Queue>) -> anyhow::Result<()> {
        let ring = IoUring::new(RING_DEPTH)?;
        // SAFETY: eventfd(2) with no flags we need to validate by hand;
        // EFD_NONBLOCK/EFD_CLOEXEC are plain flag bits.
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            return Err(anyhow::Error::from(std::io::Error::last_os_error()));
        }
        ring.submitter().register_eventfd(eventfd)?;

        let state = Arc::new(RingState {
            ring: Mutex::new(ring),
            eventfd,
            queue: Arc::clone(&queue),
            backing,
            inflight: Mutex::new(HashMap::new()),
            next_user_data: AtomicU64::new(1),
        });

        let cb_state = Arc::clone(&state);
        self.reactor.register(
            eventfd,
            Arc::new(move || {
                drain_eventfd(cb_state.eventfd);
                reap_completions(&cb_state);
            }),
        );

        self.state.lock().unwrap().insert(queue.qidx, state);
        Ok(())
    }

    fn deinit(&self, queue: &Queue) {
        let Some(state) = self.state.lock().unwrap().remove(&queue.qidx) else {
            return;
        };
        self.reactor.unregister(state.eventfd);
        // SAFETY: the reactor no longer polls this fd and no thread holds a
        // reference to `state` beyond this function once the map entry is
        // gone, so it's ours to close.
        unsafe { libc::close(state.eventfd) };
    }

    fn kick(&self, queue: &Queue) {
        let state = self.state.lock().unwrap().get(&queue.qidx).cloned();
        if let Some(state) = state {
            pump_submissions(&state);
        }
    }

    fn supports_busy_cancel(&self) -> bool {
        false
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    // SAFETY: fd is the engine's own eventfd, read-only use, buf is sized
    // for the 8-byte counter the kernel always writes.
    unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
    }
}

fn effective_iov_vec(request: &Request) -> Vec<IoVec> {
    match &request.align_info {
        Some(info) => info.effective_iov(&request.iov),
        None => request.iov.clone(),
    }
}

/// Pull as many pending slots as the submission queue has room for, execute
/// discards inline (they never touch the ring), and submit the rest.
/// Called both from `kick` (so newly-enqueued work is picked up even with
/// nothing currently in flight to trigger a completion) and after reaping
/// completions (so slots that were blocked behind the drained ones get a
/// chance to run).
///
/// `kick` runs on whatever thread submitted a request; the reactor callback
/// runs this same function (via `reap_completions`) on the reactor thread.
/// The fullness check and the push must therefore happen under one
/// `ring` lock acquisition — checking "not full" and pushing as two
/// separate critical sections lets both threads pass the check before
/// either pushes, and the loser's push then fails against a ring that
/// filled up in between.
fn pump_submissions(state: &Arc<RingState>) {
    let mut submitted_any = false;
    loop {
        let mut ring = state.ring.lock().unwrap();
        if ring.submission().is_full() {
            break;
        }
        let Some((idx, op, request)) = state.queue.dequeue(0) else {
            break;
        };

        if op == OpKind::Discard {
            drop(ring);
            let mut request = request;
            let err = crate::discard::execute(&state.backing, &request).err();
            if err.is_none() {
                request.resid = 0;
            }
            state.queue.complete(idx);
            request.complete(err);
            continue;
        }

        let iov = effective_iov_vec(&request);
        let iovecs = crate::rawio::to_libc_iovecs(&iov);
        let user_data = state.next_user_data.fetch_add(1, Ordering::Relaxed);
        let sqe = build_sqe(&state.backing, op, &request, &iovecs, user_data);

        state.inflight.lock().unwrap().insert(
            user_data,
            InFlightEntry {
                idx,
                op,
                request,
                _iovecs: iovecs,
            },
        );

        // SAFETY: `sqe` embeds a pointer into the `_iovecs` allocation just
        // moved into the inflight map above; a `Vec`'s heap buffer address
        // is unaffected by moving the `Vec` itself, and the entry (and
        // hence the allocation) lives until the matching completion is
        // reaped, after which the SQE is no longer outstanding. The push
        // happens under the same lock acquisition as the fullness check
        // above, so it cannot fail.
        unsafe {
            ring.submission().push(&sqe).expect("checked not full under the same lock");
        }
        submitted_any = true;
    }
    if submitted_any {
        let _ = state.ring.lock().unwrap().submit();
    }
}

fn build_sqe(
    backing: &BackingHandle,
    op: OpKind,
    request: &Request,
    iovecs: &[libc::iovec],
    user_data: u64,
) -> squeue::Entry {
    let fd = types::Fd(backing.fd);
    match op {
        OpKind::Read => {
            let info = request
                .align_info
                .as_ref()
                .expect("align_info computed at submission");
            opcode::Readv::new(fd, iovecs.as_ptr(), iovecs.len() as u32)
                .offset(info.effective_offset())
                .build()
                .user_data(user_data)
        }
        OpKind::Write => {
            let info = request
                .align_info
                .as_ref()
                .expect("align_info computed at submission");
            opcode::Writev::new(fd, iovecs.as_ptr(), iovecs.len() as u32)
                .offset(info.effective_offset())
                .build()
                .user_data(user_data)
        }
        OpKind::Flush => opcode::Fsync::new(fd).build().user_data(user_data),
        OpKind::Discard => unreachable!("discard is executed synchronously before reaching the ring"),
    }
}

fn reap_completions(state: &Arc<RingState>) {
    let completed: Vec<(u64, i32)> = {
        let mut ring = state.ring.lock().unwrap();
        ring.completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect()
    };

    for (user_data, res) in completed {
        let Some(entry) = state.inflight.lock().unwrap().remove(&user_data) else {
            continue;
        };
        let InFlightEntry {
            idx,
            op,
            mut request,
            ..
        } = entry;
        let err = finish(&state.backing, op, &mut request, res);
        if let Some(e) = &err {
            error!("block request {} ({:?}) failed: {}", request.id, op, e);
        }
        state.queue.complete(idx);
        request.complete(err);
    }

    pump_submissions(state);
}

fn finish(backing: &BackingHandle, op: OpKind, request: &mut Request, res: i32) -> Option<BlockError> {
    match op {
        OpKind::Read => {
            if res < 0 {
                return Some(BlockError::Io(std::io::Error::from_raw_os_error(-res)));
            }
            let info = request
                .align_info
                .as_ref()
                .expect("align_info computed at submission");
            let expect = if info.need_conversion {
                info.bounced_size
            } else {
                info.org_size
            };
            if res as u64 != expect {
                return Some(BlockError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read from backing",
                )));
            }
            crate::align::post_fill_read(info, &request.iov);
            request.resid = request.resid.saturating_sub(info.org_size);
            None
        }
        OpKind::Write => {
            if res < 0 {
                return Some(BlockError::Io(std::io::Error::from_raw_os_error(-res)));
            }
            let info = request
                .align_info
                .as_ref()
                .expect("align_info computed at submission");
            let expect = if info.need_conversion {
                info.bounced_size
            } else {
                info.org_size
            };
            if res as u64 != expect {
                return Some(BlockError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short write to backing",
                )));
            }
            request.resid = request.resid.saturating_sub(info.org_size);
            if !backing.write_cache() && crate::rawio::fsync(backing.fd) != 0 {
                return Some(BlockError::last_os_error());
            }
            None
        }
        OpKind::Flush => {
            if res < 0 {
                Some(BlockError::Io(std::io::Error::from_raw_os_error(-res)))
            } else {
                None
            }
        }
        OpKind::Discard => unreachable!("discard never reaches a ring completion"),
    }
}
