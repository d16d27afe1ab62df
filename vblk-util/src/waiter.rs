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

//! The process-wide wait-record stack used to interrupt a busy worker
//! thread during cancellation (spec.md §4.7).
//!
//! This is the one place in the core that keeps a global singleton: the
//! signal handler runs on whatever thread the kernel chose to interrupt and
//! has no way to receive context from the canceller except through shared
//! process state. Every other piece of mutable state in the core lives
//! inside `Context`/`Queue`.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Condvar, Mutex, Once};

static WAIT_STACK: AtomicPtr<WaitRecord> = AtomicPtr::new(ptr::null_mut());
static INSTALL_HANDLER: Once = Once::new();

/// A stack-allocated record a canceller publishes before signalling a busy
/// worker. Removed and signalled by the handler running on that worker's
/// thread.
pub struct WaitRecord {
    state: Mutex<bool>,
    cv: Condvar,
    next: AtomicPtr<WaitRecord>,
    worker_tid: libc::pid_t,
}

impl WaitRecord {
    pub fn new(worker_tid: libc::pid_t) -> Self {
        Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
            next: AtomicPtr::new(ptr::null_mut()),
            worker_tid,
        }
    }

    /// Publish `self` onto the global stack. Must not be called twice for
    /// the same record without an intervening `wait`.
    pub fn publish(&self) {
        let self_ptr = self as *const WaitRecord as *mut WaitRecord;
        loop {
            let head = WAIT_STACK.load(Ordering::Acquire);
            self.next.store(head, Ordering::Relaxed);
            if WAIT_STACK
                .compare_exchange_weak(head, self_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Block until the handler has popped and signalled this record.
    pub fn wait(&self) {
        let mut done = self.state.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }

    /// Block until signalled or `timeout` elapses, whichever comes first.
    /// Returns `true` if signalled. Needed because the worker may finish
    /// and free its slot in the window between the canceller observing
    /// `Busy` and actually delivering the interrupt, in which case no
    /// signal ever arrives for this record and the canceller must fall
    /// back to re-checking slot status itself.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let (guard, _) = self
            .cv
            .wait_timeout_while(self.state.lock().unwrap(), timeout, |done| !*done)
            .unwrap();
        *guard
    }

    fn signal(&self) {
        let mut done = self.state.lock().unwrap();
        *done = true;
        self.cv.notify_one();
    }

    /// Unlink `self` from the global stack if the handler hasn't already
    /// popped it. Must be called before a published record that was never
    /// signalled goes out of scope — e.g. the target thread exited before
    /// the interrupt was delivered, so no `SIGCONT` will ever arrive for it
    /// — or a later, unrelated `SIGCONT` delivery would dereference freed
    /// stack memory in [`handle_continue`]. A no-op (and cheap: one lock
    /// check) if we were in fact signalled, since the handler always
    /// removes a record before signalling it.
    pub fn retire(&self) {
        if *self.state.lock().unwrap() {
            return;
        }
        let self_ptr = self as *const WaitRecord as *mut WaitRecord;
        loop {
            let head = WAIT_STACK.swap(ptr::null_mut(), Ordering::AcqRel);
            let mut keep_head: *mut WaitRecord = ptr::null_mut();
            let mut keep_tail: *mut WaitRecord = ptr::null_mut();
            let mut found = false;
            let mut cur = head;
            while !cur.is_null() {
                // SAFETY: every node reachable from the stack was published
                // by a `WaitRecord` that is still alive — its owner hasn't
                // returned past `retire`/a handler signal yet, which is the
                // only way a node leaves the stack.
                let node = unsafe { &*cur };
                let next = node.next.load(Ordering::Acquire);
                if cur == self_ptr {
                    found = true;
                } else {
                    node.next.store(keep_head, Ordering::Relaxed);
                    if keep_head.is_null() {
                        keep_tail = cur;
                    }
                    keep_head = cur;
                }
                cur = next;
            }
            if !keep_head.is_null() {
                loop {
                    let cur_head = WAIT_STACK.load(Ordering::Acquire);
                    // SAFETY: keep_tail is non-null whenever keep_head is.
                    unsafe { (*keep_tail).next.store(cur_head, Ordering::Relaxed) };
                    if WAIT_STACK
                        .compare_exchange_weak(cur_head, keep_head, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
            if found {
                return;
            }
            if *self.state.lock().unwrap() {
                // The handler raced us between our snapshot and now: it
                // already swapped the whole stack out (taking our node with
                // it), signalled us, and whatever remained is what we just
                // rebuilt above.
                return;
            }
            // Our node wasn't in the snapshot we just took — a concurrent
            // `publish`/`retire` interleaved with ours — and we still
            // haven't been signalled, so it must be in whatever is on the
            // stack now. Retry.
        }
    }
}

/// Install the platform "continue" signal handler exactly once per process.
/// `cancel` calls this before sending the first interrupt; repeat calls are
/// no-ops.
pub fn install_handler_once() {
    INSTALL_HANDLER.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_continue as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGCONT, &action, ptr::null_mut());
    });
}

/// Send the continue signal to `tid`. The canceller must have published a
/// `WaitRecord` for `tid` before calling this.
pub fn interrupt(tid: libc::pid_t) {
    // SAFETY: tgkill with a valid tid and SIGCONT is always safe to issue;
    // a thread that has already exited simply yields ESRCH, which we ignore.
    unsafe {
        libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, libc::SIGCONT);
    }
}

/// Signal-handler body. Only async-signal-safe operations run here: atomic
/// swap/CAS on the wait stack and the mutex/condvar wake performed by
/// `WaitRecord::signal` (pthread mutex/cond operations are documented
/// async-signal-safe on Linux, unlike most libc calls).
extern "C" fn handle_continue(_sig: libc::c_int) {
    let head = WAIT_STACK.swap(ptr::null_mut(), Ordering::AcqRel);
    if head.is_null() {
        return;
    }
    let my_tid = crate::unix::gettid();

    let mut keep_head: *mut WaitRecord = ptr::null_mut();
    let mut keep_tail: *mut WaitRecord = ptr::null_mut();
    let mut cur = head;
    while !cur.is_null() {
        // SAFETY: every node reachable from the stack was published by a
        // `WaitRecord` that outlives this handler call (the canceller is
        // blocked in `wait` until we signal it).
        let node = unsafe { &*cur };
        let next = node.next.load(Ordering::Acquire);
        if node.worker_tid == my_tid {
            node.signal();
        } else {
            node.next.store(keep_head, Ordering::Relaxed);
            if keep_head.is_null() {
                keep_tail = cur;
            }
            keep_head = cur;
        }
        cur = next;
    }

    if keep_head.is_null() {
        return;
    }
    loop {
        let cur_head = WAIT_STACK.load(Ordering::Acquire);
        // SAFETY: keep_tail is non-null whenever keep_head is non-null.
        unsafe {
            (*keep_tail).next.store(cur_head, Ordering::Relaxed);
        }
        if WAIT_STACK
            .compare_exchange_weak(cur_head, keep_head, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn publish_and_self_signal_round_trips() {
        install_handler_once();
        let record = Arc::new(WaitRecord::new(crate::unix::gettid()));
        record.publish();

        let r2 = Arc::clone(&record);
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            interrupt(crate::unix::gettid());
            let _ = &r2;
        });
        record.wait();
        signaller.join().unwrap();
    }

    #[test]
    fn retire_unlinks_an_unsignalled_record() {
        // A record published for a tid that never interrupts it (e.g. the
        // target already exited) must still be safe to drop: `retire` has
        // to unlink it from `WAIT_STACK` itself, since no handler ever will.
        let never_signalled = WaitRecord::new(-1);
        never_signalled.publish();

        let other = Arc::new(WaitRecord::new(crate::unix::gettid()));
        other.publish();

        never_signalled.retire();
        assert!(!*never_signalled.state.lock().unwrap());

        // `other` must still be reachable and signallable after
        // `never_signalled` unlinked itself out from under it.
        install_handler_once();
        interrupt(crate::unix::gettid());
        other.wait_timeout(Duration::from_secs(5));
        assert!(*other.state.lock().unwrap());
    }
}
