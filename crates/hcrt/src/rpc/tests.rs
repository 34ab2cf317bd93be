// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unit tests for request handles and reply handles.

use super::*;
use crate::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn request(id: u64) -> RpcRequest {
    RpcRequest::new(
        id,
        0,
        Endpoint::new(1, 0),
        Opcode(0x42),
        RpcInput::Raw(vec![1, 2, 3]),
    )
}

#[test]
fn test_new_request_is_initialized_and_untracked() {
    let rpc = request(7);
    assert_eq!(rpc.id(), 7);
    assert_eq!(rpc.state(), RpcState::Initialized);
    assert!(!rpc.is_tracked());
    assert!(rpc.deadline().is_none());
    assert_eq!(rpc.input(), &RpcInput::Raw(vec![1, 2, 3]));
}

#[test]
fn test_arm_twice_is_rejected() {
    let rpc = request(1);
    rpc.arm(Box::new(|_| {})).expect("first arm");
    let err = rpc.arm(Box::new(|_| {})).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_finish_only_once() {
    let rpc = request(1);
    assert!(rpc.finish(RpcState::Canceled));
    assert!(!rpc.finish(RpcState::Completed));
    assert_eq!(rpc.state(), RpcState::Canceled);

    // A completed request cannot be re-armed.
    assert!(rpc.arm(Box::new(|_| {})).is_err());
}

#[test]
fn test_deliver_invokes_callback_once() {
    let rpc = request(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    rpc.arm(Box::new(move |info| {
        assert_eq!(info.rpc.id(), 1);
        assert_eq!(info.result, Ok(RpcOutput::Empty));
        seen.fetch_add(1, Ordering::SeqCst);
    }))
    .expect("arm");

    rpc.deliver(Ok(RpcOutput::Empty));
    rpc.deliver(Err(Error::Canceled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reply_handle_resolves_once() {
    let rpc = request(3);
    let (cb, handle) = ReplyHandle::channel(&rpc);
    assert!(handle.try_recv().is_none());

    rpc.arm(cb).expect("arm");
    rpc.deliver(Ok(RpcOutput::Raw(vec![9])));

    assert_eq!(handle.try_recv(), Some(Ok(RpcOutput::Raw(vec![9]))));
    // Sender dropped with the callback: later polls report cancellation.
    assert_eq!(handle.try_recv(), Some(Err(Error::Canceled)));
}

#[test]
fn test_reply_handle_wait_times_out() {
    let rpc = request(4);
    let (cb, handle) = ReplyHandle::channel(&rpc);
    rpc.arm(cb).expect("arm");
    assert_eq!(
        handle.wait(Duration::from_millis(10)),
        Err(Error::TimedOut)
    );
}

#[test]
fn test_weak_rpc_does_not_keep_request_alive() {
    let rpc = request(5);
    let weak = rpc.downgrade();
    assert!(weak.upgrade().is_some());
    drop(rpc);
    assert!(weak.upgrade().is_none());
}
