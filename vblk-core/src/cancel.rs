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

//! Cancellation (spec.md §4.7): race a pending/busy slot safely to a
//! terminal state. The ring engine does not support interrupting a busy
//! slot (there is no dedicated worker thread blocked in a syscall to
//! signal) — only the pending-list branch applies there, matching spec.md
//! §4.7's closing note.

use std::time::Duration;

use vblk_util::waiter::{install_handler_once, interrupt, WaitRecord};

use crate::queue::Queue;

const INTERRUPT_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// Cancelled before execution; no callback will fire.
    Cancelled,
    /// Was executing; the callback will still fire exactly once from the
    /// worker's normal completion path.
    Busy,
    /// Not found on either list.
    NotFound,
}

impl CancelResult {
    /// The raw-code mapping spec.md §4.7 documents: `0`, `-BUSY`, `-1`.
    /// `-BUSY` is rendered as `-EBUSY`, matching the errno-style return
    /// values the rest of the submission API's internals use.
    pub fn as_code(self) -> i32 {
        match self {
            CancelResult::Cancelled => 0,
            CancelResult::Busy => -libc::EBUSY,
            CancelResult::NotFound => -1,
        }
    }
}

/// Cancel `req_id` on `queue`. `supports_busy_interrupt` is `false` for the
/// ring engine, where there is no worker thread to signal.
pub fn cancel(queue: &Queue, req_id: u64, supports_busy_interrupt: bool) -> CancelResult {
    if queue.cancel_pending(req_id).is_some() {
        return CancelResult::Cancelled;
    }

    if !queue.is_busy(req_id) {
        return CancelResult::NotFound;
    }

    if !supports_busy_interrupt {
        return CancelResult::NotFound;
    }

    install_handler_once();
    let Some(owner) = queue.busy_owner(req_id) else {
        // The worker finished between our `is_busy` check and now.
        return CancelResult::Busy;
    };

    // One record, published once, for the whole wait: the owning worker
    // doesn't change while a slot stays `Busy` (set once in `dequeue`), and
    // re-publishing a fresh record on every retry would leak every record
    // that times out without being popped — each is stack-allocated here,
    // so a record still linked into the global stack when this function
    // returns and drops it becomes a dangling pointer the next `SIGCONT`
    // handler invocation walks into.
    let record = WaitRecord::new(owner);
    record.publish();
    while queue.is_busy(req_id) {
        interrupt(owner);
        if record.wait_timeout(INTERRUPT_RETRY) {
            break;
        }
    }
    // The loop may have exited via `is_busy` turning false without the
    // handler ever signalling us (the interrupt raced past the worker's own
    // completion, or `owner`'s thread is gone and will never run the
    // handler). Unlink before `record` drops.
    record.retire();
    CancelResult::Busy
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    use vblk_util::unix::gettid;

    use super::*;
    use crate::queue::OpKind;
    use crate::request::{IoVec, Request};

    fn noop_request(offset: u64, len: usize, done: mpsc::Sender<()>) -> Request {
        let buf: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        let iov = vec![IoVec::new(buf.as_mut_ptr(), len)];
        Request::new(
            0,
            offset,
            iov,
            Box::new(move |_, _| {
                let _ = done.send(());
            }),
        )
    }

    #[test]
    fn cancel_on_pending_slot_is_immediate_and_fires_no_callback() {
        let queue = Queue::new(0, 4, false);
        let (tx, rx) = mpsc::channel();
        let req = noop_request(0, 8, tx);
        let id = req.id;
        queue.enqueue(req, OpKind::Write).unwrap();

        assert_eq!(cancel(&queue, id, true), CancelResult::Cancelled);
        assert!(rx.try_recv().is_err(), "cancelled-before-execution must not run the callback");
    }

    #[test]
    fn cancel_unknown_request_is_not_found() {
        let queue = Queue::new(0, 4, false);
        assert_eq!(cancel(&queue, 999_999, true), CancelResult::NotFound);
    }

    #[test]
    fn cancel_busy_slot_waits_for_completion_and_still_runs_callback() {
        let queue = Arc::new(Queue::new(0, 4, false));
        let (tx, rx) = mpsc::channel();
        let req = noop_request(0, 8, tx);
        let id = req.id;
        queue.enqueue(req, OpKind::Write).unwrap();

        let worker_queue = Arc::clone(&queue);
        let worker = thread::spawn(move || {
            let tid = gettid();
            let (idx, _op, request) = worker_queue.dequeue(tid).expect("slot is pending");
            thread::sleep(Duration::from_millis(80));
            worker_queue.complete(idx);
            request.complete(None);
        });

        while !queue.is_busy(id) {
            thread::yield_now();
        }

        assert_eq!(cancel(&queue, id, true), CancelResult::Busy);
        worker.join().unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("the worker's own completion path must still invoke the callback exactly once");
    }
}
