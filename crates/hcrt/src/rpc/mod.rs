// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC objects: addressing, payloads, request handles, and completions.

mod message;
mod request;
mod types;

pub use message::{
    GroupCreateIn, GroupCreateOut, GroupDestroyIn, GroupDestroyOut, RpcInput, RpcOutput,
};
pub use request::{CompletionCallback, CompletionInfo, ReplyHandle, RpcRequest};
pub use types::{Endpoint, Opcode, Rank, RpcState, TrackOutcome};

pub(crate) use request::WeakRpc;

#[cfg(test)]
mod tests;
