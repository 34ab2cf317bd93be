// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared by the context tracker and the group coordinator.
//!
//! [`Error`] is the synchronous error of every API call and the `result` of
//! every completion. [`Status`] is its wire form, carried in control-RPC
//! replies so a responder's failure can be reconstructed on the initiator.

use std::fmt;

use crate::rpc::Rank;

/// Result type for hcrt operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by hcrt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Allocation failure
    NoMemory,

    /// Malformed identifier, missing parameter, or rank not in group
    InvalidArgument(String),

    /// Duplicate group identifier where idempotent join does not apply
    AlreadyExists(String),

    /// Unknown group, context, handler, or untracked request
    NotFound(String),

    /// Outstanding work prevents the operation
    Busy(String),

    /// Deadline exceeded at the transport level
    TimedOut,

    /// Completed because of an explicit abort or teardown
    Canceled,

    /// At least one fan-out leg failed; carries the first failure
    Aggregate(Box<Error>),

    /// Target rank has no listening context
    Unreachable(Rank),

    /// Transport refused a send or abort
    Transport(String),

    /// Configuration could not be loaded
    Config(String),

    /// Runtime used before it was built or after finalize
    Uninitialized,
}

impl Error {
    /// Wrap the first failure of a fan-out protocol.
    pub fn aggregate(first: Error) -> Self {
        Self::Aggregate(Box::new(first))
    }

    /// Wire status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::NoMemory => Status::NoMemory,
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::AlreadyExists(_) => Status::AlreadyExists,
            Self::NotFound(_) => Status::NotFound,
            Self::Busy(_) => Status::Busy,
            Self::TimedOut => Status::TimedOut,
            Self::Canceled => Status::Canceled,
            Self::Aggregate(_) => Status::Aggregate,
            Self::Unreachable(_) => Status::Unreachable,
            Self::Transport(_) => Status::Transport,
            Self::Config(_) => Status::Config,
            Self::Uninitialized => Status::Uninitialized,
        }
    }

    /// Rebuild an error from a status reported by `rank`.
    ///
    /// Returns `None` for [`Status::Ok`].
    pub fn from_status(status: Status, rank: Rank) -> Option<Self> {
        let detail = || format!("reported by rank {}", rank);
        let err = match status {
            Status::Ok => return None,
            Status::NoMemory => Self::NoMemory,
            Status::InvalidArgument => Self::InvalidArgument(detail()),
            Status::AlreadyExists => Self::AlreadyExists(detail()),
            Status::NotFound => Self::NotFound(detail()),
            Status::Busy => Self::Busy(detail()),
            Status::TimedOut => Self::TimedOut,
            Status::Canceled => Self::Canceled,
            Status::Aggregate => Self::aggregate(Self::Transport(detail())),
            Status::Unreachable => Self::Unreachable(rank),
            Status::Transport | Status::Unknown => Self::Transport(detail()),
            Status::Config => Self::Config(detail()),
            Status::Uninitialized => Self::Uninitialized,
        };
        Some(err)
    }

    /// True for completions caused by abort or teardown.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "Out of memory"),
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::AlreadyExists(what) => write!(f, "Already exists: {}", what),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Busy(msg) => write!(f, "Busy: {}", msg),
            Self::TimedOut => write!(f, "RPC timed out"),
            Self::Canceled => write!(f, "RPC canceled"),
            Self::Aggregate(first) => write!(f, "Fan-out failed (first error: {})", first),
            Self::Unreachable(rank) => write!(f, "Rank {} unreachable", rank),
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Uninitialized => write!(f, "Runtime not initialized"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Aggregate(first) => Some(first.as_ref()),
            _ => None,
        }
    }
}

/// Status codes carried in control-RPC replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum Status {
    #[default]
    Ok = 0,
    NoMemory = -1,
    InvalidArgument = -2,
    AlreadyExists = -3,
    NotFound = -4,
    Busy = -5,
    TimedOut = -6,
    Canceled = -7,
    Aggregate = -8,
    Unreachable = -9,
    Transport = -10,
    Config = -11,
    Uninitialized = -12,
    /// Code not known to this build
    Unknown = -1000,
}

impl Status {
    /// Convert from i32
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            -1 => Self::NoMemory,
            -2 => Self::InvalidArgument,
            -3 => Self::AlreadyExists,
            -4 => Self::NotFound,
            -5 => Self::Busy,
            -6 => Self::TimedOut,
            -7 => Self::Canceled,
            -8 => Self::Aggregate,
            -9 => Self::Unreachable,
            -10 => Self::Transport,
            -11 => Self::Config,
            -12 => Self::Uninitialized,
            _ => Self::Unknown,
        }
    }

    /// Convert to i32
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Status of an operation result.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip_through_i32() {
        for status in [
            Status::Ok,
            Status::Busy,
            Status::Canceled,
            Status::Unreachable,
            Status::Uninitialized,
        ] {
            assert_eq!(Status::from_i32(status.as_i32()), status);
        }
        assert_eq!(Status::from_i32(42), Status::Unknown);
    }

    #[test]
    fn test_from_status_keeps_responder_rank() {
        assert_eq!(Error::from_status(Status::Ok, 3), None);
        assert_eq!(
            Error::from_status(Status::Unreachable, 3),
            Some(Error::Unreachable(3))
        );
        let err = Error::from_status(Status::Busy, 7).expect("error status");
        assert_eq!(err.status(), Status::Busy);
        assert!(err.to_string().contains("rank 7"));
    }

    #[test]
    fn test_aggregate_exposes_first_error_as_source() {
        use std::error::Error as _;

        let err = Error::aggregate(Error::TimedOut);
        assert_eq!(err.status(), Status::Aggregate);
        let source = err.source().expect("aggregate has a source");
        assert_eq!(source.to_string(), Error::TimedOut.to_string());
    }
}
