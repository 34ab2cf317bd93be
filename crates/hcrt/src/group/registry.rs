// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group registry and reference guards.
//!
//! ```text
//! GroupRegistry (one per Runtime)
//! +-- groups: RwLock<BTreeMap<Arc<str>, Arc<GroupPrivate>>>
//!       read:  lookup, lookup_ref
//!       write: insert, remove, detach
//! ```
//!
//! Each group keeps its own mutex for coordination state, so a lookup never
//! waits on a fan-out in progress on another group.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;

use super::private::{Group, GroupPrivate};
use super::validate_group_id;
use crate::error::{Error, Result};
use crate::rpc::Rank;

#[derive(Default)]
pub(crate) struct GroupRegistry {
    groups: RwLock<BTreeMap<Arc<str>, Arc<GroupPrivate>>>,
}

impl GroupRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<Arc<GroupPrivate>> {
        self.groups.read().get(id).cloned()
    }

    /// Existing group for `id`, or the one built by `make`.
    ///
    /// The flag is true when `make` ran and its group was inserted.
    pub(crate) fn lookup_or_insert<F>(&self, id: &str, make: F) -> (Arc<GroupPrivate>, bool)
    where
        F: FnOnce() -> Arc<GroupPrivate>,
    {
        if let Some(existing) = self.lookup(id) {
            return (existing, false);
        }
        let mut groups = self.groups.write();
        if let Some(existing) = groups.get(id) {
            return (Arc::clone(existing), false);
        }
        let grp = make();
        groups.insert(grp.id_arc(), Arc::clone(&grp));
        (grp, true)
    }

    /// Remove `grp` if it is still the registered record for its id.
    pub(crate) fn remove(&self, grp: &Arc<GroupPrivate>) -> bool {
        let mut groups = self.groups.write();
        match groups.get(grp.id()) {
            Some(current) if Arc::ptr_eq(current, grp) => {
                groups.remove(grp.id());
                log::debug!("[group {}] removed from registry", grp.id());
                true
            }
            _ => false,
        }
    }

    /// Look up `id` and take a reference on it.
    pub(crate) fn lookup_ref(self: &Arc<Self>, id: &str) -> Option<GroupRef> {
        let groups = self.groups.read();
        let grp = groups.get(id)?;
        if !grp.try_addref() {
            return None;
        }
        Some(GroupRef {
            group: Group::new(Arc::clone(grp)),
            registry: Arc::clone(self),
        })
    }

    /// Record a group created elsewhere. The returned guard owns its only
    /// reference; dropping the last guard detaches the group.
    pub(crate) fn attach(self: &Arc<Self>, id: &str, members: Vec<Rank>) -> Result<GroupRef> {
        validate_group_id(id)?;
        let (grp, created) =
            self.lookup_or_insert(id, || Arc::new(GroupPrivate::new_attached(id, members)));
        if !created {
            return Err(Error::AlreadyExists(format!("group {}", id)));
        }
        log::debug!("[group {}] attached", id);
        Ok(GroupRef {
            group: Group::new(grp),
            registry: Arc::clone(self),
        })
    }

    pub(crate) fn ids(&self) -> Vec<Arc<str>> {
        self.groups.read().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub(crate) fn clear(&self) {
        self.groups.write().clear();
    }
}

/// Counted reference to a group.
///
/// Dropping the last reference of an attached group detaches it from the
/// registry. Protocol-created groups stay until their destroy completes.
pub struct GroupRef {
    group: Group,
    registry: Arc<GroupRegistry>,
}

impl GroupRef {
    pub fn group(&self) -> &Group {
        &self.group
    }
}

impl Deref for GroupRef {
    type Target = Group;

    fn deref(&self) -> &Group {
        &self.group
    }
}

impl Clone for GroupRef {
    fn clone(&self) -> Self {
        self.group.inner.addref();
        Self {
            group: self.group.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for GroupRef {
    fn drop(&mut self) {
        let grp = &self.group.inner;
        if grp.decref() && !grp.is_local() {
            log::debug!("[group {}] last reference dropped, detaching", grp.id());
            self.registry.remove(grp);
        }
    }
}

impl fmt::Debug for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupRef").field(&self.group).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupStatus;

    fn local(id: &str) -> Arc<GroupPrivate> {
        Arc::new(GroupPrivate::new_local(id, vec![0, 1], 0, GroupStatus::Creating))
    }

    #[test]
    fn test_lookup_or_insert_is_unique_by_id() {
        let reg = GroupRegistry::new();
        let (a, created) = reg.lookup_or_insert("g1", || local("g1"));
        assert!(created);
        let (b, created) = reg.lookup_or_insert("g1", || local("g1"));
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_remove_only_matching_record() {
        let reg = GroupRegistry::new();
        let (a, _) = reg.lookup_or_insert("g1", || local("g1"));
        let stale = local("g1");
        assert!(!reg.remove(&stale));
        assert!(reg.remove(&a));
        assert!(reg.lookup("g1").is_none());

        // The identifier is reusable once fully removed.
        let (_, created) = reg.lookup_or_insert("g1", || local("g1"));
        assert!(created);
    }

    #[test]
    fn test_attached_group_detaches_on_last_ref() {
        let reg = Arc::new(GroupRegistry::new());
        let first = reg.attach("remote", vec![3, 4]).expect("attach");
        assert!(!first.is_local());
        let second = reg.lookup_ref("remote").expect("lookup ref");
        assert_eq!(first.ref_count(), 2);

        drop(first);
        assert!(reg.lookup("remote").is_some());
        let copy = second.clone();
        drop(second);
        assert!(reg.lookup("remote").is_some());
        drop(copy);
        assert!(reg.lookup("remote").is_none());
        assert!(reg.lookup_ref("remote").is_none());
    }

    #[test]
    fn test_attach_rejects_duplicates_and_bad_ids() {
        let reg = Arc::new(GroupRegistry::new());
        let _g = reg.attach("remote", vec![1]).expect("attach");
        assert!(matches!(
            reg.attach("remote", vec![1]),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            reg.attach("bad'id", vec![1]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_local_group_survives_reference_drops() {
        let reg = Arc::new(GroupRegistry::new());
        reg.lookup_or_insert("g1", || local("g1"));
        let r = reg.lookup_ref("g1").expect("ref");
        assert_eq!(r.ref_count(), 2);
        drop(r);
        assert!(reg.lookup("g1").is_some());
        assert_eq!(reg.ids(), vec![Arc::<str>::from("g1")]);
    }
}
