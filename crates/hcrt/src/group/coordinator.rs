// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Create/destroy fan-out.
//!
//! Both protocols have the same shape: set the group's transitional status,
//! send one control RPC per member in ascending rank order over context 0,
//! and count acknowledgements. A leg that fails (send error, remote error,
//! timeout, cancellation) still counts. When the count reaches the member
//! count the run is finished and the callback(s) get the aggregate result.
//!
//! ```text
//! initiator                         member r (for every r in members)
//!   Creating ──GROUP_CREATE{id, members, initiator}──> insert Normal
//!            <──{rank r, status}────────────────────
//!   ack == n: Normal (ok) | removed (error)
//!
//!   Destroying ──GROUP_DESTROY{id, initiator}──> remove
//!              <──{rank r, status}──────────────
//!   ack == n: removed (ok) | back to Normal (error)
//! ```

use std::sync::Arc;

use super::private::{Group, GroupCallback, GroupCompletion, GroupPrivate, GroupStatus};
use super::registry::GroupRegistry;
use super::validate_group_id;
use crate::context::Context;
use crate::error::{Error, Result, Status};
use crate::rpc::{
    CompletionInfo, Endpoint, GroupCreateIn, GroupCreateOut, GroupDestroyIn, GroupDestroyOut,
    Opcode, Rank, RpcInput, RpcOutput,
};
use crate::transport::IncomingRpc;

/// Sort and de-duplicate a membership list.
pub(crate) fn normalize_members(members: &[Rank]) -> Result<Vec<Rank>> {
    if members.is_empty() {
        return Err(Error::InvalidArgument("group membership is empty".into()));
    }
    let mut members = members.to_vec();
    members.sort_unstable();
    members.dedup();
    Ok(members)
}

fn protocol_name(opcode: Opcode) -> &'static str {
    if opcode == Opcode::GROUP_CREATE {
        "create"
    } else {
        "destroy"
    }
}

/// Runs the group protocols for one rank.
#[derive(Clone)]
pub(crate) struct GroupCoordinator {
    rank: Rank,
    groups: Arc<GroupRegistry>,
}

impl GroupCoordinator {
    pub(crate) fn new(rank: Rank, groups: Arc<GroupRegistry>) -> Self {
        Self { rank, groups }
    }

    /// Start creating `id` across `members`.
    ///
    /// Argument errors are returned here. Everything after the group is
    /// registered, including failures to send legs, reaches `cb`.
    pub(crate) fn create(
        &self,
        ctx: &Context,
        id: &str,
        members: &[Rank],
        cb: GroupCallback,
    ) -> Result<()> {
        validate_group_id(id)?;
        let members = normalize_members(members)?;
        if members.binary_search(&self.rank).is_err() {
            return Err(Error::InvalidArgument(format!(
                "rank {} is not a member of group {}",
                self.rank, id
            )));
        }

        let (grp, created) = self.groups.lookup_or_insert(id, || {
            Arc::new(GroupPrivate::new_local(
                id,
                members.clone(),
                self.rank,
                GroupStatus::Creating,
            ))
        });
        if !created {
            return self.join_existing(&grp, &members, cb);
        }

        log::info!("[group {}] creating across {} ranks", id, members.len());
        {
            let mut st = grp.state.lock();
            st.begin(GroupStatus::Creating, members.len());
            st.create_waiters.push(cb);
        }
        let input = RpcInput::GroupCreate(GroupCreateIn {
            group_id: grp.id_arc(),
            members: grp.members_arc(),
            initiator: self.rank,
        });
        self.fan_out(ctx, &grp, Opcode::GROUP_CREATE, input);
        Ok(())
    }

    /// A create for an identifier that is already registered.
    ///
    /// Same membership while our own creation is running: wait for it.
    /// Same membership, already created by us: succeed at once.
    /// Anything else is a conflict.
    fn join_existing(
        &self,
        grp: &Arc<GroupPrivate>,
        members: &[Rank],
        cb: GroupCallback,
    ) -> Result<()> {
        let same = grp.members() == members;
        let mut st = grp.state.lock();
        if grp.is_finalizing() {
            return Err(Error::Busy(format!("group {} is being torn down", grp.id())));
        }
        match st.status {
            GroupStatus::Creating if same && grp.initiator() == self.rank => {
                log::debug!("[group {}] duplicate create joins the running one", grp.id());
                st.create_waiters.push(cb);
                Ok(())
            }
            GroupStatus::Normal if same && grp.is_local() && grp.initiator() == self.rank => {
                drop(st);
                cb(GroupCompletion {
                    group_id: grp.id_arc(),
                    result: Ok(()),
                });
                Ok(())
            }
            GroupStatus::Destroying => {
                Err(Error::Busy(format!("group {} is being destroyed", grp.id())))
            }
            _ => Err(Error::AlreadyExists(format!("group {}", grp.id()))),
        }
    }

    /// Start destroying `group` on every member.
    pub(crate) fn destroy(&self, ctx: &Context, group: &Group, cb: GroupCallback) -> Result<()> {
        let grp = &group.inner;
        if grp.is_primary() {
            return Err(Error::InvalidArgument(format!(
                "primary group {} cannot be destroyed",
                grp.id()
            )));
        }
        if !grp.is_local() {
            return Err(Error::InvalidArgument(format!(
                "group {} is attached, not created here",
                grp.id()
            )));
        }
        match self.groups.lookup(grp.id()) {
            Some(current) if Arc::ptr_eq(&current, grp) => {}
            _ => return Err(Error::NotFound(format!("group {}", grp.id()))),
        }
        {
            let mut st = grp.state.lock();
            if grp.is_finalizing() || st.status != GroupStatus::Normal {
                return Err(Error::Busy(format!(
                    "group {} is {:?}",
                    grp.id(),
                    st.status
                )));
            }
            st.begin(GroupStatus::Destroying, grp.members().len());
            st.destroy_cb = Some(cb);
        }

        log::info!("[group {}] destroying across {} ranks", grp.id(), grp.members().len());
        let input = RpcInput::GroupDestroy(GroupDestroyIn {
            group_id: grp.id_arc(),
            initiator: self.rank,
        });
        self.fan_out(ctx, grp, Opcode::GROUP_DESTROY, input);
        Ok(())
    }

    fn fan_out(&self, ctx: &Context, grp: &Arc<GroupPrivate>, opcode: Opcode, input: RpcInput) {
        let members = grp.members();
        let total = members.len();
        for (i, &rank) in members.iter().enumerate() {
            let rpc = ctx.new_request(Endpoint::primary(rank), opcode, input.clone());
            grp.state.lock().pending.push(rpc.clone());

            let coordinator = self.clone();
            let leg_grp = Arc::clone(grp);
            let sent = ctx.send(&rpc, move |info| coordinator.leg_done(&leg_grp, info));
            if let Err(e) = sent {
                log::error!(
                    "[group {}] {} leg to rank {} not sent: {}",
                    grp.id(),
                    protocol_name(opcode),
                    rank,
                    e
                );
                // This leg and every unsent one count as failed acknowledgements.
                let done = {
                    let mut st = grp.state.lock();
                    st.pending.retain(|r| !r.ptr_eq(&rpc));
                    st.ack(total - i, Some(e))
                };
                if done {
                    self.finish(grp, opcode);
                }
                return;
            }
        }
    }

    fn leg_done(&self, grp: &Arc<GroupPrivate>, info: CompletionInfo) {
        let opcode = info.rpc.opcode();
        let err = match info.result {
            Err(e) => Some(e),
            Ok(RpcOutput::GroupCreate(GroupCreateOut { rank, status })) => {
                Error::from_status(status, rank)
            }
            // A member without the group is already where destroy leaves it.
            Ok(RpcOutput::GroupDestroy(GroupDestroyOut {
                status: Status::NotFound,
                rank,
            })) => {
                log::debug!("[group {}] rank {} no longer has the group", grp.id(), rank);
                None
            }
            Ok(RpcOutput::GroupDestroy(GroupDestroyOut { rank, status })) => {
                Error::from_status(status, rank)
            }
            Ok(other) => Some(Error::Transport(format!("unexpected reply {:?}", other))),
        };
        if let Some(e) = &err {
            log::warn!(
                "[group {}] {} leg to rank {} failed: {}",
                grp.id(),
                protocol_name(opcode),
                info.rpc.endpoint().rank,
                e
            );
        }
        let done = {
            let mut st = grp.state.lock();
            st.pending.retain(|r| !r.ptr_eq(&info.rpc));
            st.ack(1, err)
        };
        if done {
            self.finish(grp, opcode);
        }
    }

    fn finish(&self, grp: &Arc<GroupPrivate>, opcode: Opcode) {
        if opcode == Opcode::GROUP_CREATE {
            self.finish_create(grp);
        } else {
            self.finish_destroy(grp);
        }
    }

    fn finish_create(&self, grp: &Arc<GroupPrivate>) {
        let (waiters, result) = {
            let mut st = grp.state.lock();
            let result = st.outcome();
            if result.is_ok() {
                st.status = GroupStatus::Normal;
            } else {
                grp.mark_finalizing();
            }
            (std::mem::take(&mut st.create_waiters), result)
        };
        match &result {
            Ok(()) => log::info!("[group {}] created", grp.id()),
            Err(e) => log::error!("[group {}] create failed: {}", grp.id(), e),
        }
        for cb in waiters {
            cb(GroupCompletion {
                group_id: grp.id_arc(),
                result: result.clone(),
            });
        }
        if result.is_err() {
            self.groups.remove(grp);
        }
    }

    fn finish_destroy(&self, grp: &Arc<GroupPrivate>) {
        let (cb, result) = {
            let mut st = grp.state.lock();
            let result = st.outcome();
            if result.is_ok() {
                grp.mark_finalizing();
            } else {
                st.status = GroupStatus::Normal;
            }
            (st.destroy_cb.take(), result)
        };
        match &result {
            Ok(()) => log::info!("[group {}] destroyed", grp.id()),
            Err(e) => log::error!("[group {}] destroy failed, group stays up: {}", grp.id(), e),
        }
        if let Some(cb) = cb {
            cb(GroupCompletion {
                group_id: grp.id_arc(),
                result: result.clone(),
            });
        }
        if result.is_ok() {
            self.groups.remove(grp);
        }
    }

    // ---------------------------------------------------------------------
    // Member side
    // ---------------------------------------------------------------------

    pub(crate) fn handle_create(&self, request: IncomingRpc) {
        let result = match request.input() {
            RpcInput::GroupCreate(input) => self.accept_create(input),
            _ => Err(Error::InvalidArgument("malformed group create".into())),
        };
        if let Err(e) = &result {
            log::warn!(
                "[group] rejecting create from {}: {}",
                request.source(),
                e
            );
        }
        request.reply(Ok(RpcOutput::GroupCreate(GroupCreateOut {
            rank: self.rank,
            status: Status::of(&result),
        })));
    }

    fn accept_create(&self, input: &GroupCreateIn) -> Result<()> {
        validate_group_id(&input.group_id)?;
        let members = normalize_members(&input.members)?;
        if members.binary_search(&self.rank).is_err() {
            return Err(Error::InvalidArgument(format!(
                "rank {} is not a member of group {}",
                self.rank, input.group_id
            )));
        }

        let (grp, created) = self.groups.lookup_or_insert(&input.group_id, || {
            Arc::new(GroupPrivate::new_local(
                &input.group_id,
                members.clone(),
                input.initiator,
                GroupStatus::Normal,
            ))
        });
        if created {
            log::debug!(
                "[group {}] joined, initiator rank {}",
                input.group_id,
                input.initiator
            );
            return Ok(());
        }

        // Already known: success only if it is the same group.
        if grp.members() != members.as_slice() {
            return Err(Error::AlreadyExists(format!(
                "group {} with different membership",
                input.group_id
            )));
        }
        let status = grp.status();
        if grp.is_finalizing() || status == GroupStatus::Destroying {
            return Err(Error::Busy(format!("group {} is being destroyed", input.group_id)));
        }
        Ok(())
    }

    pub(crate) fn handle_destroy(&self, request: IncomingRpc) {
        let result = match request.input() {
            RpcInput::GroupDestroy(input) => self.accept_destroy(input),
            _ => Err(Error::InvalidArgument("malformed group destroy".into())),
        };
        if let Err(e) = &result {
            log::warn!(
                "[group] rejecting destroy from {}: {}",
                request.source(),
                e
            );
        }
        request.reply(Ok(RpcOutput::GroupDestroy(GroupDestroyOut {
            rank: self.rank,
            status: Status::of(&result),
        })));
    }

    fn accept_destroy(&self, input: &GroupDestroyIn) -> Result<()> {
        let Some(grp) = self.groups.lookup(&input.group_id) else {
            return Err(Error::NotFound(format!("group {}", input.group_id)));
        };
        if grp.is_primary() || !grp.is_local() {
            return Err(Error::InvalidArgument(format!(
                "group {} cannot be destroyed remotely",
                grp.id()
            )));
        }
        if !grp.members().contains(&input.initiator) {
            return Err(Error::InvalidArgument(format!(
                "rank {} is not a member of group {}",
                input.initiator,
                grp.id()
            )));
        }
        if input.initiator == self.rank {
            // Removed by our own fan-out once every member has answered.
            return Ok(());
        }
        {
            let mut st = grp.state.lock();
            if st.status == GroupStatus::Creating {
                return Err(Error::Busy(format!("group {} is still being created", grp.id())));
            }
            st.status = GroupStatus::Destroying;
            grp.mark_finalizing();
        }
        self.groups.remove(&grp);
        log::debug!(
            "[group {}] destroyed on request of rank {}",
            grp.id(),
            input.initiator
        );
        Ok(())
    }
}
