// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-group record and its lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::rpc::{Rank, RpcRequest};

/// Lifecycle of a group. Moves forward only:
/// `Creating -> Normal -> Destroying -> removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupStatus {
    Creating,
    Normal,
    Destroying,
}

/// Outcome of a group create or destroy, handed to its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCompletion {
    pub group_id: Arc<str>,
    pub result: Result<()>,
}

/// Completion callback of a group create or destroy.
pub type GroupCallback = Box<dyn FnOnce(GroupCompletion) + Send + 'static>;

pub(crate) struct GroupPrivate {
    id: Arc<str>,
    members: Arc<[Rank]>,
    initiator: Rank,
    local: bool,
    primary: bool,
    refs: AtomicUsize,
    finalizing: AtomicBool,
    pub(crate) state: Mutex<GroupState>,
}

/// Coordination state, guarded by the group's own mutex.
pub(crate) struct GroupState {
    pub(crate) status: GroupStatus,
    pub(crate) child_num: usize,
    pub(crate) child_ack: usize,
    pub(crate) first_error: Option<Error>,
    pub(crate) pending: Vec<RpcRequest>,
    pub(crate) create_waiters: Vec<GroupCallback>,
    pub(crate) destroy_cb: Option<GroupCallback>,
}

impl GroupState {
    fn new(status: GroupStatus) -> Self {
        Self {
            status,
            child_num: 0,
            child_ack: 0,
            first_error: None,
            pending: Vec::new(),
            create_waiters: Vec::new(),
            destroy_cb: None,
        }
    }

    /// Start a fan-out run expecting `child_num` acknowledgements.
    pub(crate) fn begin(&mut self, status: GroupStatus, child_num: usize) {
        self.status = status;
        self.child_num = child_num;
        self.child_ack = 0;
        self.first_error = None;
    }

    /// Count `n` acknowledgements, keeping the first error seen.
    ///
    /// Returns true exactly when the count reaches `child_num`.
    pub(crate) fn ack(&mut self, n: usize, err: Option<Error>) -> bool {
        if let Some(err) = err {
            self.first_error.get_or_insert(err);
        }
        self.child_ack += n;
        debug_assert!(self.child_ack <= self.child_num);
        self.child_ack == self.child_num
    }

    /// Aggregated result of the finished run.
    pub(crate) fn outcome(&self) -> Result<()> {
        match &self.first_error {
            Some(first) => Err(Error::aggregate(first.clone())),
            None => Ok(()),
        }
    }
}

impl GroupPrivate {
    /// Group created through the create protocol, on the initiator or a member.
    pub(crate) fn new_local(
        id: &str,
        members: Vec<Rank>,
        initiator: Rank,
        status: GroupStatus,
    ) -> Self {
        Self::build(id, members, initiator, true, false, status)
    }

    /// Group known from elsewhere; removed when its last reference drops.
    pub(crate) fn new_attached(id: &str, members: Vec<Rank>) -> Self {
        let initiator = members.first().copied().unwrap_or_default();
        Self::build(id, members, initiator, false, false, GroupStatus::Normal)
    }

    /// Group of every rank in the job.
    pub(crate) fn new_primary(id: &str, size: u32) -> Self {
        Self::build(id, (0..size).collect(), 0, true, true, GroupStatus::Normal)
    }

    fn build(
        id: &str,
        members: Vec<Rank>,
        initiator: Rank,
        local: bool,
        primary: bool,
        status: GroupStatus,
    ) -> Self {
        Self {
            id: Arc::from(id),
            members: Arc::from(members),
            initiator,
            local,
            primary,
            refs: AtomicUsize::new(1),
            finalizing: AtomicBool::new(false),
            state: Mutex::new(GroupState::new(status)),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn id_arc(&self) -> Arc<str> {
        Arc::clone(&self.id)
    }

    pub(crate) fn members(&self) -> &[Rank] {
        &self.members
    }

    pub(crate) fn members_arc(&self) -> Arc<[Rank]> {
        Arc::clone(&self.members)
    }

    pub(crate) fn initiator(&self) -> Rank {
        self.initiator
    }

    pub(crate) fn is_local(&self) -> bool {
        self.local
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.primary
    }

    pub(crate) fn status(&self) -> GroupStatus {
        self.state.lock().status
    }

    pub(crate) fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::Acquire)
    }

    pub(crate) fn mark_finalizing(&self) {
        self.finalizing.store(true, Ordering::Release);
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn addref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Take a reference unless the group is already on its way out.
    pub(crate) fn try_addref(&self) -> bool {
        if self.is_finalizing() {
            return false;
        }
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    /// Drop a reference. Returns true when it was the last one.
    pub(crate) fn decref(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            self.mark_finalizing();
            true
        } else {
            false
        }
    }
}

/// Handle to a known group.
#[derive(Clone)]
pub struct Group {
    pub(crate) inner: Arc<GroupPrivate>,
}

impl Group {
    pub(crate) fn new(inner: Arc<GroupPrivate>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Sorted, de-duplicated member ranks.
    pub fn members(&self) -> &[Rank] {
        self.inner.members()
    }

    pub fn size(&self) -> u32 {
        self.inner.members().len() as u32
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.inner.members().binary_search(&rank).is_ok()
    }

    /// Rank that ran the create protocol.
    pub fn initiator(&self) -> Rank {
        self.inner.initiator()
    }

    pub fn status(&self) -> GroupStatus {
        self.inner.status()
    }

    /// Created through the protocol (as opposed to attached).
    pub fn is_local(&self) -> bool {
        self.inner.is_local()
    }

    pub fn is_primary(&self) -> bool {
        self.inner.is_primary()
    }

    pub fn ref_count(&self) -> usize {
        self.inner.ref_count()
    }

    pub fn is_finalizing(&self) -> bool {
        self.inner.is_finalizing()
    }

    pub fn ptr_eq(&self, other: &Group) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id())
            .field("members", &self.members())
            .field("status", &self.status())
            .field("local", &self.is_local())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_completes_exactly_once() {
        let mut st = GroupState::new(GroupStatus::Creating);
        st.begin(GroupStatus::Creating, 3);
        assert!(!st.ack(1, None));
        assert!(!st.ack(1, Some(Error::Unreachable(1))));
        assert!(st.ack(1, Some(Error::TimedOut)));
        assert_eq!(st.outcome(), Err(Error::aggregate(Error::Unreachable(1))));
    }

    #[test]
    fn test_bulk_ack_after_send_failure() {
        let mut st = GroupState::new(GroupStatus::Creating);
        st.begin(GroupStatus::Creating, 4);
        assert!(!st.ack(1, None));
        assert!(st.ack(3, Some(Error::Transport("refused".into()))));
        assert!(st.outcome().is_err());
    }

    #[test]
    fn test_begin_clears_previous_run() {
        let mut st = GroupState::new(GroupStatus::Normal);
        st.begin(GroupStatus::Destroying, 1);
        assert!(st.ack(1, Some(Error::Canceled)));
        st.begin(GroupStatus::Destroying, 2);
        assert_eq!(st.child_ack, 0);
        assert!(st.outcome().is_ok());
    }

    #[test]
    fn test_refcount_finalizes_on_last_drop() {
        let grp = GroupPrivate::new_attached("att", vec![1, 2]);
        assert_eq!(grp.ref_count(), 1);
        assert!(grp.try_addref());
        assert!(!grp.decref());
        assert!(grp.decref());
        assert!(grp.is_finalizing());
        assert!(!grp.try_addref());
    }

    #[test]
    fn test_primary_group_shape() {
        let grp = Group::new(Arc::new(GroupPrivate::new_primary("world", 4)));
        assert_eq!(grp.members(), &[0, 1, 2, 3]);
        assert_eq!(grp.status(), GroupStatus::Normal);
        assert!(grp.is_primary());
        assert!(grp.contains(3));
        assert!(!grp.contains(4));
    }
}
