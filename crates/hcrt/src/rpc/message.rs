// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC payloads.
//!
//! Payloads stay typed end to end; encoding them for a real wire is the
//! transport's business.

use std::sync::Arc;

use crate::error::Status;
use crate::rpc::Rank;

/// Request body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RpcInput {
    #[default]
    Empty,
    Raw(Vec<u8>),
    GroupCreate(GroupCreateIn),
    GroupDestroy(GroupDestroyIn),
}

/// Reply body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RpcOutput {
    #[default]
    Empty,
    Raw(Vec<u8>),
    GroupCreate(GroupCreateOut),
    GroupDestroy(GroupDestroyOut),
}

/// Group create leg: identifier, full membership, initiating rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCreateIn {
    pub group_id: Arc<str>,
    pub members: Arc<[Rank]>,
    pub initiator: Rank,
}

/// Group create leg reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCreateOut {
    pub rank: Rank,
    pub status: Status,
}

/// Group destroy leg: identifier and the rank running the destroy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDestroyIn {
    pub group_id: Arc<str>,
    pub initiator: Rank,
}

/// Group destroy leg reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDestroyOut {
    pub rank: Rank,
    pub status: Status,
}
