// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Context teardown: refusal while busy, forced destroy, exactly-once
//! completion, runtime finalize.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{Cluster, ECHO, PUMP_TIMEOUT};
use hcrt::{Endpoint, Error, RpcInput, RpcState, RuntimeConfig};
use parking_lot::Mutex;

#[test]
fn test_forced_destroy_completes_every_request_once() {
    const N: usize = 12;
    let cluster = Cluster::with_config(2, RuntimeConfig::default().with_credits(3));
    cluster.fabric.blackhole(1);
    let rt = &cluster.ranks[0];
    let ctx = cluster.ctxs[0].clone();

    let calls: Arc<Vec<AtomicUsize>> = Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect());
    let results = Arc::new(Mutex::new(Vec::new()));
    let mut rpcs = Vec::new();
    for i in 0..N {
        let rpc = ctx.new_request(Endpoint::primary(1), ECHO, RpcInput::Empty);
        let calls = Arc::clone(&calls);
        let results = Arc::clone(&results);
        ctx.send(&rpc, move |info| {
            calls[i].fetch_add(1, Ordering::SeqCst);
            results.lock().push(info.result);
        })
        .expect("send");
        rpcs.push(rpc);
    }

    assert!(matches!(rt.context_destroy(&ctx, false), Err(Error::Busy(_))));
    assert!(!ctx.is_closing());

    rt.context_destroy(&ctx, true).expect("forced destroy");
    assert!(ctx.is_destroyed());
    assert!(rt.context_lookup(0).is_none());

    for (i, count) in calls.iter().enumerate() {
        assert_eq!(count.load(Ordering::SeqCst), 1, "rpc {} completions", i);
    }
    assert!(results.lock().iter().all(|r| *r == Err(Error::Canceled)));
    assert!(rpcs.iter().all(|r| r.state() == RpcState::Canceled));
    assert_eq!(ctx.endpoint_count(), 0);

    // A destroyed context takes no more work.
    let late = ctx.new_request(Endpoint::primary(1), ECHO, RpcInput::Empty);
    assert!(matches!(ctx.send(&late, |_| {}), Err(Error::NotFound(_))));
}

#[test]
fn test_forced_destroy_fails_when_abort_fails() {
    let cluster = Cluster::new(2);
    cluster.fabric.blackhole(1);
    let rt = &cluster.ranks[0];
    let ctx = cluster.ctxs[0].clone();

    let done = Arc::new(AtomicUsize::new(0));
    let rpc = ctx.new_request(Endpoint::primary(1), ECHO, RpcInput::Empty);
    let counter = Arc::clone(&done);
    ctx.send(&rpc, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("send");

    cluster.fabric.fail_aborts(true);
    assert!(matches!(rt.context_destroy(&ctx, true), Err(Error::Transport(_))));
    assert!(!ctx.is_destroyed());
    assert!(!ctx.is_closing());
    assert!(rt.context_lookup(0).is_some());
    assert_eq!(done.load(Ordering::SeqCst), 0);

    cluster.fabric.fail_aborts(false);
    rt.context_destroy(&ctx, true).expect("forced destroy");
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroy_after_drain_and_finalize() {
    let cluster = Cluster::new(2);
    cluster.serve_echo();
    let ctx = &cluster.ctxs[0];

    let rpc = ctx.new_request(Endpoint::primary(1), ECHO, RpcInput::Raw(vec![9]));
    let handle = ctx.send_with_handle(&rpc).expect("send");
    assert!(cluster.pump_until(PUMP_TIMEOUT, || handle.try_recv().is_some() || !rpc.is_tracked()));
    assert!(ctx.is_idle());

    for (rt, ctx) in cluster.ranks.iter().zip(&cluster.ctxs) {
        rt.context_destroy(ctx, false).expect("destroy");
        rt.finalize().expect("finalize");
        assert!(matches!(rt.finalize(), Err(Error::Uninitialized)));
    }
    assert_eq!(cluster.fabric.port_count(), 0);
}

#[test]
fn test_requests_to_closed_port_fail_fast() {
    let cluster = Cluster::new(2);
    let (rt1, ctx1) = (&cluster.ranks[1], &cluster.ctxs[1]);
    rt1.context_destroy(ctx1, false).expect("destroy rank 1 context");

    let ctx = &cluster.ctxs[0];
    let rpc = ctx.new_request(Endpoint::primary(1), ECHO, RpcInput::Empty);
    let handle = ctx.send_with_handle(&rpc).expect("send accepted");
    assert_eq!(
        handle.wait_progress(ctx, Some(Duration::from_secs(5))),
        Err(Error::Unreachable(1))
    );
}
