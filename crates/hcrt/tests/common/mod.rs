// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Several runtimes on one loopback fabric, driven from the test thread.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use hcrt::{
    Context, GroupCompletion, IncomingRpc, LoopbackFabric, Opcode, Result, RpcInput, RpcOutput,
    Runtime, RuntimeConfig,
};
use parking_lot::Mutex;

/// Opcode served by [`Cluster::serve_echo`].
pub const ECHO: Opcode = Opcode(0x10);

pub const PUMP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Cluster {
    pub fabric: LoopbackFabric,
    pub ranks: Vec<Runtime>,
    pub ctxs: Vec<Context>,
}

impl Cluster {
    pub fn new(size: u32) -> Self {
        Self::with_config(size, RuntimeConfig::default())
    }

    pub fn with_config(size: u32, config: RuntimeConfig) -> Self {
        let fabric = LoopbackFabric::new();
        let mut ranks = Vec::new();
        let mut ctxs = Vec::new();
        for rank in 0..size {
            let rt = Runtime::builder()
                .rank(rank)
                .size(size)
                .config(config.clone())
                .fabric(fabric.clone())
                .build()
                .expect("build runtime");
            ctxs.push(rt.context_create().expect("context 0"));
            ranks.push(rt);
        }
        Self {
            fabric,
            ranks,
            ctxs,
        }
    }

    /// Every rank replies to [`ECHO`] with its input bytes.
    pub fn serve_echo(&self) {
        for rt in &self.ranks {
            rt.register_handler(ECHO, |_: &Context, req: IncomingRpc| {
                let out = match req.input() {
                    RpcInput::Raw(bytes) => RpcOutput::Raw(bytes.clone()),
                    _ => RpcOutput::Empty,
                };
                req.reply(Ok(out));
            })
            .expect("register echo");
        }
    }

    /// One non-blocking progress pass over every context, in rank order.
    pub fn pump_once(&self) {
        for ctx in &self.ctxs {
            ctx.progress(Duration::ZERO).expect("progress");
        }
    }

    /// One pass in the given order.
    pub fn pump_order(&self, order: &[usize]) {
        for &i in order {
            self.ctxs[i].progress(Duration::ZERO).expect("progress");
        }
    }

    /// Pump until `cond` holds; false on timeout.
    pub fn pump_until<F>(&self, timeout: Duration, mut cond: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if cond() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.pump_once();
            std::thread::yield_now();
        }
    }
}

/// Collects group completions.
#[derive(Clone, Default)]
pub struct Outcomes {
    inner: Arc<Mutex<Vec<GroupCompletion>>>,
}

impl Outcomes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorder(&self) -> impl FnOnce(GroupCompletion) + Send + 'static {
        let inner = Arc::clone(&self.inner);
        move |done| inner.lock().push(done)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn results(&self) -> Vec<Result<()>> {
        self.inner.lock().iter().map(|d| d.result.clone()).collect()
    }
}
