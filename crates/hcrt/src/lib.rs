// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HCRT - RPC transport core
//!
//! Admission control for RPCs multiplexed over a few transport contexts, and
//! the distributed create/destroy protocol for named process groups built on
//! the same RPC path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hcrt::{Endpoint, LoopbackFabric, Opcode, Result, RpcInput, Runtime};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let fabric = LoopbackFabric::new();
//!     let rt = Runtime::builder().rank(0).size(2).fabric(fabric).build()?;
//!     let ctx = rt.context_create()?;
//!
//!     let rpc = ctx.new_request(Endpoint::primary(1), Opcode(7), RpcInput::Raw(vec![1]));
//!     let reply = ctx.send_with_handle(&rpc)?;
//!     let _out = reply.wait_progress(&ctx, Some(Duration::from_secs(5)))?;
//!
//!     rt.group_create("storage", &[0, 1], |done| println!("{:?}", done.result))?;
//!     ctx.progress_cond(Some(Duration::from_secs(5)), || rt.group_lookup("storage").is_some())?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                             Runtime                                  |
//! |   context registry | handler table | group registry | primary group |
//! +---------------------------------------------------------------------+
//! |          Context                |          GroupCoordinator          |
//! |   EndpointTable (per rank)      |   fan-out GROUP_CREATE/DESTROY     |
//! |   inflight <= credits, waitq    |   ack counting, aggregate error    |
//! |   timeouts, abort, progress     |   GroupPrivate state machine       |
//! +---------------------------------------------------------------------+
//! |                         Transport (trait)                            |
//! |   send | abort | progress -> Reply / Request events                  |
//! |   LoopbackFabric: in-process ports with fault injection              |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Runtime`] | State of one rank; creates contexts, runs group protocols |
//! | [`Context`] | Transport channel with per-endpoint flow control |
//! | [`RpcRequest`] | One call, tracked from admission to its single completion |
//! | [`Group`] | Named set of ranks |
//! | [`Transport`] | What a network backend provides to a context |

/// Runtime configuration, defaults, env and YAML overlays.
pub mod config;
/// Contexts, endpoint admission control, progress.
pub mod context;
/// Error taxonomy and wire status codes.
pub mod error;
/// Named process groups and their create/destroy protocol.
pub mod group;
/// Request objects, addressing, payloads.
pub mod rpc;
/// Per-rank runtime state.
pub mod runtime;
/// Transport contract and the in-process fabric.
pub mod transport;

pub use config::RuntimeConfig;
pub use context::{CallbackId, Context, EndpointStats, RpcHandler};
pub use error::{Error, Result, Status};
pub use group::{Group, GroupCompletion, GroupRef, GroupStatus};
pub use rpc::{
    CompletionInfo, Endpoint, Opcode, Rank, ReplyHandle, RpcInput, RpcOutput, RpcRequest,
    RpcState, TrackOutcome,
};
pub use runtime::{Runtime, RuntimeBuilder};
pub use transport::{Fabric, IncomingRpc, LoopbackFabric, Transport, TransportEvent};
