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

//! The thread-pool engine (spec.md §4.4): a fixed set of worker threads per
//! queue, each performing synchronous positional vector I/O. Mirrors
//! `util::aio::Aio::rw_sync`'s dispatch, generalised from one `Aio<T>`
//! covering every queue to one worker set per `Queue`, since spec.md's
//! `Context` gives each queue its own capacity and ordering-gate policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::error;
use vblk_util::unix::gettid;

use crate::backing::BackingHandle;
use crate::engine::Engine;
use crate::error::BlockError;
use crate::queue::{OpKind, Queue};
use crate::rawio;
use crate::request::Request;

struct QueueWorkers {
    closing: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct ThreadPoolEngine {
    workers_per_queue: usize,
    state: Mutex<HashMap<usize, QueueWorkers>>,
}

impl ThreadPoolEngine {
    pub fn new(workers_per_queue: usize) -> Self {
        ThreadPoolEngine {
            workers_per_queue,
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl Engine for ThreadPoolEngine {
    fn init(&self, backing: Arc<BackingHandle>, queue: Arc<Queue>) -> anyhow::Result<()> {
        let closing = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(self.workers_per_queue);
        for _ in 0..self.workers_per_queue {
            let backing = Arc::clone(&backing);
            let queue = Arc::clone(&queue);
            let closing = Arc::clone(&closing);
            handles.push(thread::spawn(move || worker_loop(backing, queue, closing)));
        }
        self.state
            .lock()
            .unwrap()
            .insert(queue.qidx, QueueWorkers { closing, handles });
        Ok(())
    }

    fn deinit(&self, queue: &Queue) {
        let entry = self.state.lock().unwrap().remove(&queue.qidx);
        if let Some(mut qw) = entry {
            qw.closing.store(true, Ordering::Release);
            queue.set_closing();
            for h in qw.handles.drain(..) {
                let _ = h.join();
            }
        }
    }

    fn kick(&self, queue: &Queue) {
        queue.kick();
    }

    fn supports_busy_cancel(&self) -> bool {
        true
    }
}

fn worker_loop(backing: Arc<BackingHandle>, queue: Arc<Queue>, closing: Arc<AtomicBool>) {
    let should_stop = || closing.load(Ordering::Acquire);
    loop {
        if !queue.wait_for_work(&should_stop) {
            return;
        }
        let tid = gettid();
        if let Some((idx, op, request)) = queue.dequeue(tid) {
            let (request, err) = execute(&backing, op, request);
            queue.complete(idx);
            request.complete(err);
        }
    }
}

/// Run one request to completion. Returns the request (so its bounce
/// buffer, if any, is freed on drop along the normal callback path) and the
/// error, if any.
fn execute(backing: &BackingHandle, op: OpKind, mut request: Request) -> (Request, Option<BlockError>) {
    let result = match op {
        OpKind::Read => do_read(backing, &mut request),
        OpKind::Write => do_write(backing, &mut request),
        OpKind::Flush => do_flush(backing),
        OpKind::Discard => crate::discard::execute(backing, &request).map(|()| {
            request.resid = 0;
        }),
    };
    if let Err(e) = &result {
        error!("block request {} ({:?}) failed: {}", request.id, op, e);
    }
    (request, result.err())
}

fn do_read(backing: &BackingHandle, request: &mut Request) -> Result<(), BlockError> {
    let info = request
        .align_info
        .as_ref()
        .expect("align_info computed at submission");
    let iov = info.effective_iov(&request.iov);
    let offset = info.effective_offset();
    let expect: u64 = iov.iter().map(|v| v.len as u64).sum();

    let n = rawio::preadv(backing.fd, &iov, offset);
    if n < 0 {
        return Err(BlockError::last_os_error());
    }
    if n as u64 != expect {
        return Err(BlockError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read from backing",
        )));
    }
    crate::align::post_fill_read(info, &request.iov);
    request.resid = request.resid.saturating_sub(info.org_size);
    Ok(())
}

fn do_write(backing: &BackingHandle, request: &mut Request) -> Result<(), BlockError> {
    if backing.read_only {
        return Err(BlockError::ReadOnly);
    }
    let info = request
        .align_info
        .as_ref()
        .expect("align_info computed at submission");
    let iov = info.effective_iov(&request.iov);
    let offset = info.effective_offset();
    let expect: u64 = iov.iter().map(|v| v.len as u64).sum();

    let n = rawio::pwritev(backing.fd, &iov, offset);
    if n < 0 {
        return Err(BlockError::last_os_error());
    }
    if n as u64 != expect {
        return Err(BlockError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short write to backing",
        )));
    }
    request.resid = request.resid.saturating_sub(info.org_size);

    if !backing.write_cache() && rawio::fsync(backing.fd) != 0 {
        return Err(BlockError::last_os_error());
    }
    Ok(())
}

fn do_flush(backing: &BackingHandle) -> Result<(), BlockError> {
    if rawio::fsync(backing.fd) != 0 {
        return Err(BlockError::last_os_error());
    }
    Ok(())
}
