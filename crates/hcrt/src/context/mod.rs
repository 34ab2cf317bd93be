// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Contexts and per-endpoint flow control.
//!
//! A [`Context`] is one logical channel to the transport. Every request sent
//! through it is tracked on the [`EndpointEntry`](endpoint) of its
//! destination rank, which caps how many requests may be outstanding toward
//! that rank. Requests beyond the cap wait in FIFO order and are promoted
//! as earlier ones complete.
//!
//! ```text
//!             track                      untrack (reply/abort/timeout)
//! Initialized ─────┬──> inflight ──send──> Sent ──> Completed | Canceled
//!                  │                                 TimedOut  | Failed
//!                  └──> waitq (Queued) ──promote on credit──> inflight
//! ```
//!
//! Completion callbacks run on whichever thread drives [`Context::progress`]
//! and never while an endpoint lock is held.

pub(crate) mod endpoint;
mod handler;
mod progress;
mod timeout;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::rpc::{
    CompletionCallback, CompletionInfo, Endpoint, Opcode, Rank, ReplyHandle, RpcInput, RpcOutput,
    RpcRequest, RpcState, TrackOutcome,
};
use crate::transport::Transport;

use endpoint::{EndpointEntry, EndpointTable, EntryRef};
use timeout::TimeoutQueue;

pub use endpoint::EndpointStats;
pub use handler::RpcHandler;
pub(crate) use handler::HandlerTable;

/// Runs once per progress slice.
pub type ProgressCallback = Arc<dyn Fn(&Context) + Send + Sync>;

/// Runs for every request whose deadline expires.
pub type TimeoutCallback = Arc<dyn Fn(&Context, &RpcRequest) + Send + Sync>;

/// Registration handle for progress and timeout callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Handle to one context. Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    idx: u32,
    rank: Rank,
    credits: u32,
    transport: Arc<dyn Transport>,
    endpoints: EndpointTable,
    handlers: Arc<HandlerTable>,
    timeout_ns: AtomicU64,
    timeouts: Mutex<TimeoutQueue>,
    progress_cbs: Mutex<Vec<(CallbackId, ProgressCallback)>>,
    timeout_cbs: Mutex<Vec<(CallbackId, TimeoutCallback)>>,
    next_cb: AtomicU64,
    next_rpc: AtomicU64,
    closing: AtomicBool,
    destroyed: AtomicBool,
}

impl Context {
    pub(crate) fn new(
        idx: u32,
        rank: Rank,
        config: &RuntimeConfig,
        transport: Arc<dyn Transport>,
        handlers: Arc<HandlerTable>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                idx,
                rank,
                credits: config.credits_per_ep_ctx,
                transport,
                endpoints: EndpointTable::new(),
                handlers,
                timeout_ns: AtomicU64::new(duration_to_nanos(config.rpc_timeout)),
                timeouts: Mutex::new(TimeoutQueue::new()),
                progress_cbs: Mutex::new(Vec::new()),
                timeout_cbs: Mutex::new(Vec::new()),
                next_cb: AtomicU64::new(1),
                next_rpc: AtomicU64::new(1),
                closing: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Index of this context within its runtime.
    pub fn index(&self) -> u32 {
        self.inner.idx
    }

    /// Rank of the owning runtime.
    pub fn rank(&self) -> Rank {
        self.inner.rank
    }

    /// Outstanding requests allowed per endpoint (`0` = unlimited).
    pub fn credits(&self) -> u32 {
        self.inner.credits
    }

    /// Deadline applied to requests dispatched from now on.
    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.inner.timeout_ns.load(Ordering::Acquire))
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument("context timeout must be positive".into()));
        }
        self.inner
            .timeout_ns
            .store(duration_to_nanos(timeout), Ordering::Release);
        log::debug!("[ctx {}] rpc timeout set to {:?}", self.inner.idx, timeout);
        Ok(())
    }

    /// Same underlying context.
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create a request owned by this context.
    pub fn new_request(&self, endpoint: Endpoint, opcode: Opcode, input: RpcInput) -> RpcRequest {
        let id = self.inner.next_rpc.fetch_add(1, Ordering::Relaxed);
        RpcRequest::new(id, self.inner.idx, endpoint, opcode, input)
    }

    // ---------------------------------------------------------------------
    // Admission
    // ---------------------------------------------------------------------

    /// Admit `rpc` on its endpoint without touching the transport.
    ///
    /// [`Context::send`] is `track` followed by a transport send; this is
    /// exposed for callers that account for requests themselves.
    pub fn track(&self, rpc: &RpcRequest) -> Result<TrackOutcome> {
        self.check_owner(rpc)?;
        if rpc.is_tracked() {
            return Err(Error::InvalidArgument(format!("rpc {} already tracked", rpc.id())));
        }
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::NotFound(format!("context {}", self.inner.idx)));
        }
        if self.is_closing() {
            return Err(Error::Busy(format!("context {} is shutting down", self.inner.idx)));
        }

        let entry = self.inner.endpoints.lookup_or_insert(rpc.endpoint().rank);
        let outcome = {
            let mut q = entry.lock();
            rpc.attach(EntryRef::new(Arc::clone(&entry)));
            if q.saturated(self.inner.credits) {
                q.waitq.push_back(rpc.clone());
                rpc.set_state(RpcState::Queued);
                TrackOutcome::Queued
            } else {
                q.inflight.push_back(rpc.clone());
                q.dispatched += 1;
                TrackOutcome::Dispatched
            }
        };
        log::trace!(
            "[ctx {}] rpc {} to {} {:?}",
            self.inner.idx,
            rpc.id(),
            rpc.endpoint(),
            outcome
        );
        Ok(outcome)
    }

    /// Remove `rpc` from its endpoint and hand freed credit to waiters.
    ///
    /// A request in state `Completed` counts as replied; any other in-flight
    /// request gives its credit back. Promoted requests are sent in FIFO
    /// order; a promoted request whose send fails is completed with that
    /// error through its own callback. A request owned by another context
    /// is left alone.
    pub fn untrack(&self, rpc: &RpcRequest) {
        if let Err(e) = self.check_owner(rpc) {
            log::warn!("[ctx {}] untrack ignored: {}", self.inner.idx, e);
            return;
        }
        let mut promoted: VecDeque<RpcRequest> = self.release(rpc).into();
        while let Some(next) = promoted.pop_front() {
            match self.dispatch(&next) {
                Ok(()) => log::trace!(
                    "[ctx {}] promoted rpc {} to {}",
                    self.inner.idx,
                    next.id(),
                    next.endpoint()
                ),
                Err(e) => {
                    log::warn!(
                        "[ctx {}] resend of queued rpc {} to {} failed: {}",
                        self.inner.idx,
                        next.id(),
                        next.endpoint(),
                        e
                    );
                    next.finish(RpcState::Failed);
                    promoted.extend(self.release(&next));
                    next.deliver(Err(e));
                }
            }
        }
    }

    fn release(&self, rpc: &RpcRequest) -> Vec<RpcRequest> {
        let Some(entry) = rpc.detach() else {
            return Vec::new();
        };
        let mut q = entry.lock();
        if q.remove_waiting(rpc) {
            return Vec::new();
        }
        if q.remove_inflight(rpc) {
            if rpc.state() == RpcState::Completed {
                q.replied += 1;
            } else {
                q.dispatched -= 1;
            }
        } else {
            log::warn!(
                "[ctx {}] rpc {} missing from endpoint {} lists",
                self.inner.idx,
                rpc.id(),
                entry.rank()
            );
        }

        let mut promoted = Vec::new();
        if self.is_closing() {
            return promoted;
        }
        while !q.saturated(self.inner.credits) {
            let Some(next) = q.waitq.pop_front() else {
                break;
            };
            q.inflight.push_back(next.clone());
            q.dispatched += 1;
            promoted.push(next);
        }
        promoted
    }

    fn dispatch(&self, rpc: &RpcRequest) -> Result<()> {
        rpc.set_state(RpcState::Sent);
        // Unrepresentable deadlines leave the request unarmed.
        if let Some(deadline) = Instant::now().checked_add(self.timeout()) {
            self.inner.timeouts.lock().arm(rpc, deadline);
        }
        if let Err(e) = self.inner.transport.send(rpc) {
            rpc.set_state(RpcState::Initialized);
            rpc.set_deadline(None);
            return Err(e);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Send / complete
    // ---------------------------------------------------------------------

    /// Track `rpc` and, if credit allows, send it.
    ///
    /// `on_complete` runs exactly once if this returns `Ok`. If the
    /// transport refuses the send outright, the request is untracked, the
    /// error is returned here, and `on_complete` is dropped uncalled.
    pub fn send<F>(&self, rpc: &RpcRequest, on_complete: F) -> Result<TrackOutcome>
    where
        F: FnOnce(CompletionInfo) + Send + 'static,
    {
        self.send_boxed(rpc, Box::new(on_complete))
    }

    /// Send `rpc` and get a handle that resolves with its result.
    pub fn send_with_handle(&self, rpc: &RpcRequest) -> Result<ReplyHandle> {
        let (cb, handle) = ReplyHandle::channel(rpc);
        self.send_boxed(rpc, cb)?;
        Ok(handle)
    }

    fn send_boxed(&self, rpc: &RpcRequest, cb: CompletionCallback) -> Result<TrackOutcome> {
        rpc.arm(cb)?;
        let outcome = match self.track(rpc) {
            Ok(outcome) => outcome,
            Err(e) => {
                rpc.take_completion();
                return Err(e);
            }
        };
        if outcome == TrackOutcome::Queued {
            return Ok(outcome);
        }
        if let Err(e) = self.dispatch(rpc) {
            log::warn!(
                "[ctx {}] send of rpc {} to {} failed: {}",
                self.inner.idx,
                rpc.id(),
                rpc.endpoint(),
                e
            );
            rpc.take_completion();
            self.untrack(rpc);
            return Err(e);
        }
        Ok(outcome)
    }

    /// Finish `rpc` with `result`: settle its state, untrack, run its callback.
    pub(crate) fn complete(&self, rpc: &RpcRequest, result: Result<RpcOutput>) {
        let state = match &result {
            Ok(_) => RpcState::Completed,
            Err(Error::Canceled) => RpcState::Canceled,
            Err(Error::TimedOut) => RpcState::TimedOut,
            Err(_) => RpcState::Failed,
        };
        if !rpc.finish(state) {
            log::debug!(
                "[ctx {}] ignoring second completion of rpc {}",
                self.inner.idx,
                rpc.id()
            );
            return;
        }
        self.untrack(rpc);
        rpc.deliver(result);
    }

    // ---------------------------------------------------------------------
    // Abort
    // ---------------------------------------------------------------------

    /// Cancel one request. A queued request completes with `Canceled`
    /// immediately; an in-flight one is aborted through the transport.
    ///
    /// Requests created by another context are rejected with
    /// `InvalidArgument`; request ids are only unique per context.
    pub fn abort(&self, rpc: &RpcRequest) -> Result<()> {
        self.check_owner(rpc)?;
        let Some(entry) = rpc.entry() else {
            return Err(Error::NotFound(format!("rpc {} is not tracked", rpc.id())));
        };
        let was_waiting = {
            let mut q = entry.lock();
            let removed = q.remove_waiting(rpc);
            if removed {
                drop(rpc.detach());
            }
            removed
        };
        if was_waiting {
            cancel(rpc);
            return Ok(());
        }
        self.inner.transport.abort(rpc)
    }

    fn check_owner(&self, rpc: &RpcRequest) -> Result<()> {
        if rpc.context_index() == self.inner.idx {
            return Ok(());
        }
        Err(Error::InvalidArgument(format!(
            "rpc {} belongs to context {}, not {}",
            rpc.id(),
            rpc.context_index(),
            self.inner.idx
        )))
    }

    /// Cancel everything queued toward `rank` and abort everything in flight.
    ///
    /// Does not wait for the aborted requests to complete.
    pub fn abort_endpoint(&self, rank: Rank) -> Result<()> {
        match self.inner.endpoints.get(rank) {
            Some(entry) => self.abort_entry(&entry),
            None => Ok(()),
        }
    }

    fn abort_entry(&self, entry: &EndpointEntry) -> Result<()> {
        let (waiting, inflight) = {
            let mut q = entry.lock();
            let waiting: Vec<RpcRequest> = q.waitq.drain(..).collect();
            for rpc in &waiting {
                drop(rpc.detach());
            }
            let inflight: Vec<RpcRequest> = q.inflight.iter().cloned().collect();
            (waiting, inflight)
        };
        if !waiting.is_empty() || !inflight.is_empty() {
            log::debug!(
                "[ctx {}] aborting rank {}: {} queued, {} in flight",
                self.inner.idx,
                entry.rank(),
                waiting.len(),
                inflight.len()
            );
        }
        for rpc in &waiting {
            cancel(rpc);
        }
        let mut first_err = None;
        for rpc in &inflight {
            if let Err(e) = self.inner.transport.abort(rpc) {
                log::warn!(
                    "[ctx {}] abort of rpc {} to {} failed: {}",
                    self.inner.idx,
                    rpc.id(),
                    rpc.endpoint(),
                    e
                );
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Tear the context down.
    ///
    /// Without `force`, outstanding work makes this fail with `Busy`. With
    /// `force`, queued requests are canceled, in-flight ones aborted, and
    /// progress is driven until all of them have completed (bounded by
    /// twice the RPC timeout).
    pub(crate) fn destroy(&self, force: bool) -> Result<()> {
        let idx = self.inner.idx;
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::NotFound(format!("context {}", idx)));
        }
        if !force && !self.is_idle() {
            return Err(Error::Busy(format!("context {} has outstanding rpcs", idx)));
        }
        self.inner.closing.store(true, Ordering::Release);

        if force {
            let mut abort_err = None;
            for entry in self.inner.endpoints.snapshot() {
                if let Err(e) = self.abort_entry(&entry) {
                    abort_err.get_or_insert(e);
                }
            }
            if let Some(e) = abort_err {
                log::error!("[ctx {}] destroy: abort failed: {}", idx, e);
                self.inner.closing.store(false, Ordering::Release);
                return Err(e);
            }
            let bound = self.timeout().saturating_mul(2);
            if let Err(e) = self.flush(Some(bound)) {
                log::error!("[ctx {}] destroy: in-flight rpcs did not drain: {}", idx, e);
            }
        }

        if !self.is_idle() {
            self.inner.closing.store(false, Ordering::Release);
            return Err(Error::Busy(format!("context {} has outstanding rpcs", idx)));
        }

        let evicted = self.inner.endpoints.evict_idle();
        self.inner.transport.shutdown();
        self.inner.destroyed.store(true, Ordering::Release);
        log::info!("[ctx {}] destroyed ({} endpoints released)", idx, evicted);
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// True when no endpoint holds queued or in-flight work.
    pub fn is_idle(&self) -> bool {
        self.inner.endpoints.is_idle()
    }

    pub fn endpoint_stats(&self, rank: Rank) -> Option<EndpointStats> {
        self.inner.endpoints.get(rank).map(|entry| entry.stats())
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.len()
    }

    // ---------------------------------------------------------------------
    // Callbacks
    // ---------------------------------------------------------------------

    pub fn register_progress_callback<F>(&self, cb: F) -> CallbackId
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        let id = self.next_callback_id();
        self.inner.progress_cbs.lock().push((id, Arc::new(cb)));
        id
    }

    pub fn unregister_progress_callback(&self, id: CallbackId) -> Result<()> {
        remove_callback(&self.inner.progress_cbs, id)
    }

    pub fn register_timeout_callback<F>(&self, cb: F) -> CallbackId
    where
        F: Fn(&Context, &RpcRequest) + Send + Sync + 'static,
    {
        let id = self.next_callback_id();
        self.inner.timeout_cbs.lock().push((id, Arc::new(cb)));
        id
    }

    pub fn unregister_timeout_callback(&self, id: CallbackId) -> Result<()> {
        remove_callback(&self.inner.timeout_cbs, id)
    }

    fn next_callback_id(&self) -> CallbackId {
        CallbackId(self.inner.next_cb.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("idx", &self.inner.idx)
            .field("rank", &self.inner.rank)
            .field("credits", &self.inner.credits)
            .field("endpoints", &self.inner.endpoints.len())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Complete a request that never reached the transport.
fn cancel(rpc: &RpcRequest) {
    if rpc.finish(RpcState::Canceled) {
        rpc.deliver(Err(Error::Canceled));
    }
}

fn remove_callback<T>(list: &Mutex<Vec<(CallbackId, T)>>, id: CallbackId) -> Result<()> {
    let mut list = list.lock();
    match list.iter().position(|(cb_id, _)| *cb_id == id) {
        Some(pos) => {
            list.remove(pos);
            Ok(())
        }
        None => Err(Error::NotFound(format!("callback {:?}", id))),
    }
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
