// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deadline heap for dispatched requests.
//!
//! Entries are never removed on completion. A popped entry is stale when
//! its request is gone, no longer in flight, or was re-armed with another
//! deadline; [`TimeoutQueue::expired`] filters those out. Stale slots with
//! distant deadlines are dropped by a compaction pass once the heap has
//! doubled since the last one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::rpc::{RpcRequest, RpcState, WeakRpc};

/// Heap size below which no compaction runs.
const COMPACT_FLOOR: usize = 1024;

struct Slot {
    deadline: Instant,
    seq: u64,
    rpc: WeakRpc,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.rpc.upgrade().is_some_and(|rpc| {
            rpc.state() == RpcState::Sent && rpc.deadline() == Some(self.deadline)
        })
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Slot {}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slot {
    // Reversed: BinaryHeap is a max-heap, we want the earliest deadline on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct TimeoutQueue {
    heap: BinaryHeap<Slot>,
    next_seq: u64,
    compact_at: usize,
}

impl Default for TimeoutQueue {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            compact_at: COMPACT_FLOOR,
        }
    }
}

impl TimeoutQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm(&mut self, rpc: &RpcRequest, deadline: Instant) {
        rpc.set_deadline(Some(deadline));
        self.next_seq += 1;
        self.heap.push(Slot {
            deadline,
            seq: self.next_seq,
            rpc: rpc.downgrade(),
        });
        if self.heap.len() >= self.compact_at {
            self.compact();
        }
    }

    /// Drop slots whose request completed or was re-armed.
    fn compact(&mut self) {
        let before = self.heap.len();
        self.heap.retain(Slot::is_live);
        self.compact_at = (self.heap.len() * 2).max(COMPACT_FLOOR);
        log::trace!(
            "[timeouts] compacted {} -> {} slots",
            before,
            self.heap.len()
        );
    }

    /// Pop every live request whose deadline is at or before `now`.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<RpcRequest> {
        let mut out = Vec::new();
        while self.heap.peek().is_some_and(|slot| slot.deadline <= now) {
            let Some(slot) = self.heap.pop() else { break };
            let Some(rpc) = slot.rpc.upgrade() else { continue };
            if rpc.is_tracked()
                && rpc.state() == RpcState::Sent
                && rpc.deadline() == Some(slot.deadline)
            {
                out.push(rpc);
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
