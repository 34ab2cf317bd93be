// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Addressing and lifecycle types shared by every RPC.

use std::fmt;

/// Process rank within the job.
pub type Rank = u32;

/// Destination of an RPC: a rank and the context index (tag) on that rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub rank: Rank,
    pub tag: u32,
}

impl Endpoint {
    pub fn new(rank: Rank, tag: u32) -> Self {
        Self { rank, tag }
    }

    /// Context 0 of `rank`, where control traffic is addressed.
    pub fn primary(rank: Rank) -> Self {
        Self { rank, tag: 0 }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank, self.tag)
    }
}

/// RPC operation code.
///
/// Codes at or above [`Opcode::INTERNAL_BASE`] are reserved for control
/// traffic and cannot be registered by applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u32);

impl Opcode {
    pub const INTERNAL_BASE: u32 = 0xFF00_0000;

    /// Group create fan-out leg.
    pub const GROUP_CREATE: Opcode = Opcode(Self::INTERNAL_BASE | 0x01);

    /// Group destroy fan-out leg.
    pub const GROUP_DESTROY: Opcode = Opcode(Self::INTERNAL_BASE | 0x02);

    pub fn is_internal(self) -> bool {
        self.0 >= Self::INTERNAL_BASE
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Lifecycle state of an [`RpcRequest`](crate::rpc::RpcRequest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RpcState {
    /// Created, or returned to the caller after a failed send
    #[default]
    Initialized,
    /// Waiting for credit on its endpoint
    Queued,
    /// Handed to the transport
    Sent,
    /// Reply received
    Completed,
    /// Completed by abort or teardown
    Canceled,
    /// Deadline expired
    TimedOut,
    /// Transport reported a failure
    Failed,
}

impl RpcState {
    /// True once the completion has been (or is being) delivered.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::TimedOut | Self::Failed
        )
    }
}

/// Result of admitting a request on its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Credit was available; the request is in flight.
    Dispatched,
    /// The endpoint is saturated; the request waits for credit.
    Queued,
}
