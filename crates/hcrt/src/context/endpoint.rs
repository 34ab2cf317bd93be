// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-destination admission bookkeeping.
//!
//! ```text
//! EndpointTable (one per Context)
//! +-- entries: DashMap<Rank, Arc<EndpointEntry>>   shard lock: insert/evict only
//!
//! EndpointEntry
//! +-- refs: AtomicUsize          one per tracked request (EntryRef)
//! +-- queues: Mutex<EndpointQueues>
//!     +-- dispatched / replied   outstanding = dispatched - replied
//!     +-- inflight: VecDeque     FIFO, len == outstanding
//!     +-- waitq:    VecDeque     FIFO, non-empty only when saturated
//! ```
//!
//! The hot path takes the shard lock only long enough to clone the entry's
//! `Arc`, then works under the entry's own mutex.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::rpc::{Rank, RpcRequest};

/// Admission state of one destination rank within one context.
pub(crate) struct EndpointEntry {
    rank: Rank,
    refs: AtomicUsize,
    queues: Mutex<EndpointQueues>,
}

#[derive(Default)]
pub(crate) struct EndpointQueues {
    pub(crate) dispatched: u64,
    pub(crate) replied: u64,
    pub(crate) inflight: VecDeque<RpcRequest>,
    pub(crate) waitq: VecDeque<RpcRequest>,
}

impl EndpointQueues {
    pub(crate) fn outstanding(&self) -> u64 {
        self.dispatched - self.replied
    }

    /// True when `credits` more requests may not be dispatched.
    /// A credit of zero means unlimited.
    pub(crate) fn saturated(&self, credits: u32) -> bool {
        credits != 0 && self.outstanding() >= u64::from(credits)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inflight.is_empty() && self.waitq.is_empty()
    }

    pub(crate) fn remove_waiting(&mut self, rpc: &RpcRequest) -> bool {
        match self.waitq.iter().position(|r| r.ptr_eq(rpc)) {
            Some(pos) => {
                self.waitq.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_inflight(&mut self, rpc: &RpcRequest) -> bool {
        match self.inflight.iter().position(|r| r.ptr_eq(rpc)) {
            Some(pos) => {
                self.inflight.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl EndpointEntry {
    fn new(rank: Rank) -> Self {
        Self {
            rank,
            refs: AtomicUsize::new(0),
            queues: Mutex::new(EndpointQueues::default()),
        }
    }

    pub(crate) fn rank(&self) -> Rank {
        self.rank
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EndpointQueues> {
        self.queues.lock()
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> EndpointStats {
        let q = self.lock();
        EndpointStats {
            rank: self.rank,
            dispatched: q.dispatched,
            replied: q.replied,
            in_flight: q.inflight.len(),
            queued: q.waitq.len(),
        }
    }
}

/// A tracked request's hold on its entry. Dropping it releases the hold.
pub(crate) struct EntryRef(Arc<EndpointEntry>);

impl EntryRef {
    pub(crate) fn new(entry: Arc<EndpointEntry>) -> Self {
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Self(entry)
    }

    pub(crate) fn shared(&self) -> Arc<EndpointEntry> {
        Arc::clone(&self.0)
    }
}

impl Deref for EntryRef {
    type Target = EndpointEntry;

    fn deref(&self) -> &EndpointEntry {
        &self.0
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.0.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of one endpoint's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    pub rank: Rank,
    pub dispatched: u64,
    pub replied: u64,
    pub in_flight: usize,
    pub queued: usize,
}

impl EndpointStats {
    /// `dispatched - replied`
    pub fn outstanding(&self) -> u64 {
        self.dispatched - self.replied
    }
}

/// Entries of one context, keyed by destination rank.
#[derive(Default)]
pub(crate) struct EndpointTable {
    entries: DashMap<Rank, Arc<EndpointEntry>>,
}

impl EndpointTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Entry for `rank`, created on first use.
    pub(crate) fn lookup_or_insert(&self, rank: Rank) -> Arc<EndpointEntry> {
        if let Some(entry) = self.entries.get(&rank) {
            return Arc::clone(entry.value());
        }
        let entry = self
            .entries
            .entry(rank)
            .or_insert_with(|| {
                log::trace!("[ep] new entry for rank {}", rank);
                Arc::new(EndpointEntry::new(rank))
            });
        Arc::clone(entry.value())
    }

    pub(crate) fn get(&self, rank: Rank) -> Option<Arc<EndpointEntry>> {
        self.entries.get(&rank).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<EndpointEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entry holds queued or in-flight work.
    pub(crate) fn is_idle(&self) -> bool {
        self.snapshot().iter().all(|entry| entry.lock().is_empty())
    }

    /// Drop entries with no holders and no work. Returns how many were dropped.
    pub(crate) fn evict_idle(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.ref_count() > 0 || !entry.lock().is_empty());
        before - self.entries.len()
    }
}
