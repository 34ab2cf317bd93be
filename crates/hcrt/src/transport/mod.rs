// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport contract.
//!
//! The context tracker never moves bytes itself. It hands dispatched
//! requests to a [`Transport`], asks it to cancel them, and polls it for
//! events. One transport handle exists per context; a [`Fabric`] opens them.
//!
//! ```text
//! Context ──send/abort──> Transport ──> network
//!    ^                        |
//!    +──progress(timeout)─────+  Vec<TransportEvent>
//!          Reply { rpc, result }   Request(IncomingRpc)
//! ```

pub mod loopback;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::rpc::{Endpoint, Opcode, Rank, RpcInput, RpcOutput, RpcRequest};

pub use loopback::{LoopbackFabric, LoopbackTransport};

/// Moves requests and replies for one context.
pub trait Transport: Send + Sync {
    /// Start sending `rpc`. The outcome arrives later as a
    /// [`TransportEvent::Reply`], exactly once, unless this returns `Err`.
    fn send(&self, rpc: &RpcRequest) -> Result<()>;

    /// Best-effort cancel of a sent request. On success the transport
    /// reports the request with a `Canceled` result, unless a reply beat it.
    fn abort(&self, rpc: &RpcRequest) -> Result<()>;

    /// Wait up to `timeout` for events and return everything ready.
    fn progress(&self, timeout: Duration) -> Result<Vec<TransportEvent>>;

    /// Stop accepting traffic. Called once when the context is destroyed.
    fn shutdown(&self) {}
}

/// Opens one transport per (rank, context index).
pub trait Fabric: Send + Sync {
    fn open(&self, rank: Rank, ctx_idx: u32) -> Result<Arc<dyn Transport>>;
}

/// Something the transport has ready for the context.
#[derive(Debug)]
pub enum TransportEvent {
    /// Outcome of a request sent from this context.
    Reply {
        rpc: RpcRequest,
        result: Result<RpcOutput>,
    },
    /// Request addressed to this context.
    Request(IncomingRpc),
}

type Responder = Box<dyn FnOnce(Result<RpcOutput>) + Send + 'static>;

/// Inbound request awaiting a reply.
pub struct IncomingRpc {
    opcode: Opcode,
    source: Endpoint,
    input: RpcInput,
    responder: Responder,
}

impl IncomingRpc {
    pub fn new<F>(opcode: Opcode, source: Endpoint, input: RpcInput, responder: F) -> Self
    where
        F: FnOnce(Result<RpcOutput>) + Send + 'static,
    {
        Self {
            opcode,
            source,
            input,
            responder: Box::new(responder),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn source(&self) -> Endpoint {
        self.source
    }

    pub fn input(&self) -> &RpcInput {
        &self.input
    }

    /// Send the reply. Consumes the request, so a reply goes out once.
    pub fn reply(self, result: Result<RpcOutput>) {
        (self.responder)(result);
    }
}

impl fmt::Debug for IncomingRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRpc")
            .field("opcode", &self.opcode)
            .field("source", &self.source)
            .field("input", &self.input)
            .finish()
    }
}
