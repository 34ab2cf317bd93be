// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Progress: poll the transport, complete replies, serve requests, expire
//! deadlines.

use std::time::{Duration, Instant};

use super::Context;
use crate::config::{INFINITE_PROGRESS_SLICE, MAX_PROGRESS_SLICE};
use crate::error::{Error, Result};
use crate::transport::TransportEvent;

impl Context {
    /// Poll the transport once, waiting up to `timeout` for events.
    ///
    /// Returns the number of transport events handled. Timeout checks and
    /// progress callbacks run on every call.
    pub fn progress(&self, timeout: Duration) -> Result<usize> {
        let events = self.inner.transport.progress(timeout)?;
        let handled = events.len();
        for event in events {
            self.handle_event(event);
        }
        self.check_timeouts();
        self.run_progress_callbacks();
        Ok(handled)
    }

    /// Drive progress until `cond` returns true.
    ///
    /// `cond` is evaluated before the first poll and after every slice.
    /// `None` waits without deadline, in short slices so a condition set by
    /// another thread is noticed. Fails with `TimedOut` when the deadline
    /// passes with `cond` still false. A timeout too large to represent as
    /// a deadline behaves like `None`.
    pub fn progress_cond<F>(&self, timeout: Option<Duration>, mut cond: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        if cond() {
            return Ok(());
        }
        if timeout == Some(Duration::ZERO) {
            self.progress(Duration::ZERO)?;
            return if cond() { Ok(()) } else { Err(Error::TimedOut) };
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let slice = match deadline {
                None => INFINITE_PROGRESS_SLICE,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    left.min(MAX_PROGRESS_SLICE)
                }
            };
            self.progress(slice)?;
            if cond() {
                return Ok(());
            }
        }
        if cond() {
            Ok(())
        } else {
            Err(Error::TimedOut)
        }
    }

    /// Drive progress until every endpoint of this context is empty.
    pub fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        self.progress_cond(timeout, || self.is_idle())
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Reply { rpc, result } => {
                let result = match result {
                    Err(Error::Canceled) if rpc.is_timed_out() => Err(Error::TimedOut),
                    other => other,
                };
                self.complete(&rpc, result);
            }
            TransportEvent::Request(request) => match self.inner.handlers.get(request.opcode()) {
                Some(handler) => handler.handle(self, request),
                None => {
                    let opcode = request.opcode();
                    log::warn!(
                        "[ctx {}] no handler for opcode {} from {}",
                        self.inner.idx,
                        opcode,
                        request.source()
                    );
                    request.reply(Err(Error::NotFound(format!("handler for opcode {}", opcode))));
                }
            },
        }
    }

    fn check_timeouts(&self) {
        let expired = self.inner.timeouts.lock().expired(Instant::now());
        if expired.is_empty() {
            return;
        }
        let callbacks: Vec<_> = self
            .inner
            .timeout_cbs
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for rpc in expired {
            rpc.mark_timed_out();
            log::warn!(
                "[ctx {}] rpc {} (opcode {}) to {} timed out",
                self.inner.idx,
                rpc.id(),
                rpc.opcode(),
                rpc.endpoint()
            );
            for cb in &callbacks {
                cb(self, &rpc);
            }
            if let Err(e) = self.inner.transport.abort(&rpc) {
                log::warn!(
                    "[ctx {}] abort of timed out rpc {} failed ({}), completing locally",
                    self.inner.idx,
                    rpc.id(),
                    e
                );
                self.complete(&rpc, Err(Error::TimedOut));
            }
        }
    }

    fn run_progress_callbacks(&self) {
        let callbacks: Vec<_> = self
            .inner
            .progress_cbs
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(self);
        }
    }
}
