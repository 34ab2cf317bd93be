// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named process groups.
//!
//! - `id`: identifier rules, [`validate_group_id`]
//! - `private`: per-group record, status machine, reference counting
//! - `registry`: the runtime's table of groups, [`GroupRef`] guards
//! - `coordinator`: create/destroy fan-out and the member-side handlers

mod coordinator;
mod id;
mod private;
mod registry;

pub use id::validate_group_id;
pub use private::{Group, GroupCallback, GroupCompletion, GroupStatus};
pub use registry::GroupRef;

pub(crate) use coordinator::{normalize_members, GroupCoordinator};
pub(crate) use private::GroupPrivate;
pub(crate) use registry::GroupRegistry;
