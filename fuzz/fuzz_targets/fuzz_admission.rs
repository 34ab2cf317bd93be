// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

//! Random send / reply / abort / progress sequences against one context.
//!
//! Checks the credit bound after every step, and that a forced teardown
//! leaves every accepted request completed exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hcrt::{
    Endpoint, Error, Fabric, Opcode, Rank, Result, RpcInput, RpcOutput, RpcRequest, Runtime,
    RuntimeConfig, Transport, TransportEvent,
};
use libfuzzer_sys::fuzz_target;

const CREDITS: u32 = 3;
const PEERS: u32 = 3;

/// Holds sent requests until the input decides their fate.
#[derive(Default)]
struct Wire {
    sent: Mutex<VecDeque<RpcRequest>>,
    events: Mutex<Vec<TransportEvent>>,
}

struct FuzzTransport(Arc<Wire>);

impl Transport for FuzzTransport {
    fn send(&self, rpc: &RpcRequest) -> Result<()> {
        self.0.sent.lock().unwrap().push_back(rpc.clone());
        Ok(())
    }

    fn abort(&self, rpc: &RpcRequest) -> Result<()> {
        let mut sent = self.0.sent.lock().unwrap();
        if let Some(pos) = sent.iter().position(|r| r.ptr_eq(rpc)) {
            let rpc = sent.remove(pos).unwrap();
            self.0.events.lock().unwrap().push(TransportEvent::Reply {
                rpc,
                result: Err(Error::Canceled),
            });
        }
        Ok(())
    }

    fn progress(&self, _timeout: Duration) -> Result<Vec<TransportEvent>> {
        Ok(std::mem::take(&mut *self.0.events.lock().unwrap()))
    }
}

struct FuzzFabric(Arc<Wire>);

impl Fabric for FuzzFabric {
    fn open(&self, _rank: Rank, _ctx_idx: u32) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(FuzzTransport(self.0.clone())))
    }
}

fuzz_target!(|data: &[u8]| {
    let wire = Arc::new(Wire::default());
    let rt = Runtime::builder()
        .size(PEERS + 1)
        .config(RuntimeConfig::default().with_credits(CREDITS))
        .fabric(FuzzFabric(wire.clone()))
        .build()
        .unwrap();
    let ctx = rt.context_create().unwrap();

    let mut accepted: Vec<(RpcRequest, Arc<AtomicUsize>)> = Vec::new();
    for &byte in data {
        let arg = (byte >> 3) as usize;
        match byte & 0x07 {
            0 | 1 => {
                let dest = 1 + (arg as u32 % PEERS);
                let rpc = ctx.new_request(Endpoint::primary(dest), Opcode(1), RpcInput::Empty);
                let calls = Arc::new(AtomicUsize::new(0));
                let counter = calls.clone();
                ctx.send(&rpc, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
                accepted.push((rpc, calls));
            }
            2 | 3 => {
                let mut sent = wire.sent.lock().unwrap();
                if !sent.is_empty() {
                    let rpc = sent.remove(arg % sent.len()).unwrap();
                    wire.events.lock().unwrap().push(TransportEvent::Reply {
                        rpc,
                        result: Ok(RpcOutput::Empty),
                    });
                }
            }
            4 => {
                if !accepted.is_empty() {
                    let (rpc, _) = &accepted[arg % accepted.len()];
                    let _ = ctx.abort(rpc);
                }
            }
            5 => {
                let _ = ctx.abort_endpoint(1 + (arg as u32 % PEERS));
            }
            _ => {
                ctx.progress(Duration::ZERO).unwrap();
            }
        }

        for rank in 1..=PEERS {
            if let Some(stats) = ctx.endpoint_stats(rank) {
                assert!(stats.outstanding() <= CREDITS as u64);
                assert!(stats.queued == 0 || stats.outstanding() == CREDITS as u64);
            }
        }
        for (_, calls) in &accepted {
            assert!(calls.load(Ordering::SeqCst) <= 1);
        }
    }

    rt.context_destroy(&ctx, true).unwrap();
    for (rpc, calls) in &accepted {
        assert_eq!(calls.load(Ordering::SeqCst), 1, "rpc {}", rpc.id());
    }
});
