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

//! The ordering gate (spec.md §4.2): serializes a request behind any
//! earlier pending-or-busy request whose byte range ends exactly where the
//! new one begins. Disabled for the ring engine by construction (spec.md
//! §4.5, §9) since the kernel may complete ring submissions out of order.

use vblk_util::link_list::IntrusiveList;

use crate::queue::{OpKind, Slot};

/// `block_key` for a flush: it never blocks anything and is never itself
/// blocked, since "end of a flush" has no byte-range meaning.
pub const INFINITE_KEY: u64 = u64::MAX;

pub fn block_key(op: OpKind, offset: u64, iov_len: u64) -> u64 {
    match op {
        OpKind::Flush => INFINITE_KEY,
        _ => offset + iov_len,
    }
}

/// True if some slot in `pending` or `busy` is a predecessor of a request
/// starting at `new_offset` (i.e. its `block_key` equals `new_offset`).
pub fn has_predecessor(
    arena: &[Slot],
    pending: &IntrusiveList,
    busy: &IntrusiveList,
    new_offset: u64,
) -> bool {
    pending
        .iter(arena)
        .chain(busy.iter(arena))
        .any(|idx| arena[idx as usize].block_key == new_offset)
}

/// Unblock every `Blocked` slot on `pending` whose request starts where the
/// just-completed slot's range ended (`key`). A single pass; one
/// predecessor may unblock several successors.
pub fn unblock_successors(arena: &mut [Slot], pending: &IntrusiveList, key: u64) {
    let candidates: Vec<u32> = pending.iter(arena).collect();
    for idx in candidates {
        let slot = &mut arena[idx as usize];
        if slot.status == crate::queue::SlotStatus::Blocked && slot.start_offset == key {
            slot.status = crate::queue::SlotStatus::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SlotStatus;
    use vblk_util::link_list::Linked;

    fn make_arena(n: usize) -> Vec<Slot> {
        (0..n).map(|_| Slot::free_slot()).collect()
    }

    #[test]
    fn flush_key_is_infinite() {
        assert_eq!(block_key(OpKind::Flush, 0, 0), INFINITE_KEY);
        assert_eq!(block_key(OpKind::Write, 100, 50), 150);
    }

    #[test]
    fn detects_predecessor_by_end_offset() {
        let mut arena = make_arena(2);
        let mut pending = IntrusiveList::new();
        arena[0].block_key = 512;
        arena[0].status = SlotStatus::Pending;
        pending.push_back(&mut arena, 0);
        let busy = IntrusiveList::new();
        assert!(has_predecessor(&arena, &pending, &busy, 512));
        assert!(!has_predecessor(&arena, &pending, &busy, 513));
    }

    #[test]
    fn unblock_flips_only_matching_blocked_slots() {
        let mut arena = make_arena(3);
        let mut pending = IntrusiveList::new();
        for i in 0..3 {
            arena[i].status = SlotStatus::Blocked;
            arena[i].start_offset = if i == 1 { 999 } else { 512 };
            pending.push_back(&mut arena, i as u32);
        }
        unblock_successors(&mut arena, &pending, 512);
        assert_eq!(arena[0].status, SlotStatus::Pending);
        assert_eq!(arena[1].status, SlotStatus::Blocked);
        assert_eq!(arena[2].status, SlotStatus::Pending);
        let _ = arena[0].link();
    }
}
