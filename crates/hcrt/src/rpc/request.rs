// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC request handle and one-shot completion.
//!
//! An [`RpcRequest`] is shared between the caller, the endpoint list that
//! tracks it, and the transport. The completion slot is taken exactly once;
//! every later attempt finds it empty, which is what makes completion
//! exactly-once no matter how many paths (reply, abort, timeout, teardown)
//! race to finish the request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, TryRecvError};
use parking_lot::Mutex;

use crate::context::endpoint::{EndpointEntry, EntryRef};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::rpc::{Endpoint, Opcode, RpcInput, RpcOutput, RpcState};

/// Completion callback of a sent request.
pub type CompletionCallback = Box<dyn FnOnce(CompletionInfo) + Send + 'static>;

/// What a completion callback receives.
#[derive(Debug)]
pub struct CompletionInfo {
    pub rpc: RpcRequest,
    pub result: Result<RpcOutput>,
}

/// Shared handle to one RPC.
#[derive(Clone)]
pub struct RpcRequest {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    id: u64,
    ctx_idx: u32,
    opcode: Opcode,
    endpoint: Endpoint,
    input: RpcInput,
    state: Mutex<RpcState>,
    completion: Mutex<Option<CompletionCallback>>,
    tracked: AtomicBool,
    entry: Mutex<Option<EntryRef>>,
    deadline: Mutex<Option<Instant>>,
    timed_out: AtomicBool,
}

impl RpcRequest {
    pub(crate) fn new(
        id: u64,
        ctx_idx: u32,
        endpoint: Endpoint,
        opcode: Opcode,
        input: RpcInput,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id,
                ctx_idx,
                opcode,
                endpoint,
                input,
                state: Mutex::new(RpcState::Initialized),
                completion: Mutex::new(None),
                tracked: AtomicBool::new(false),
                entry: Mutex::new(None),
                deadline: Mutex::new(None),
                timed_out: AtomicBool::new(false),
            }),
        }
    }

    /// Identifier, unique within the owning context.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Index of the context that created this request.
    pub fn context_index(&self) -> u32 {
        self.inner.ctx_idx
    }

    pub fn opcode(&self) -> Opcode {
        self.inner.opcode
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    pub fn input(&self) -> &RpcInput {
        &self.inner.input
    }

    pub fn state(&self) -> RpcState {
        *self.inner.state.lock()
    }

    /// True while the request sits on an endpoint's in-flight or wait list.
    pub fn is_tracked(&self) -> bool {
        self.inner.tracked.load(Ordering::Acquire)
    }

    /// Deadline of the current dispatch, if any.
    pub fn deadline(&self) -> Option<Instant> {
        *self.inner.deadline.lock()
    }

    /// True once the request's deadline has expired.
    pub fn is_timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::Acquire)
    }

    /// Same underlying request.
    pub fn ptr_eq(&self, other: &RpcRequest) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_state(&self, state: RpcState) {
        *self.inner.state.lock() = state;
    }

    /// Move to a terminal state. Returns `false` if already terminal.
    pub(crate) fn finish(&self, state: RpcState) -> bool {
        let mut current = self.inner.state.lock();
        if current.is_terminal() {
            return false;
        }
        *current = state;
        true
    }

    /// Install the completion callback ahead of a send.
    pub(crate) fn arm(&self, cb: CompletionCallback) -> Result<()> {
        if self.state().is_terminal() {
            return Err(Error::InvalidArgument(format!(
                "rpc {} already completed",
                self.inner.id
            )));
        }
        let mut slot = self.inner.completion.lock();
        if slot.is_some() {
            return Err(Error::InvalidArgument(format!(
                "rpc {} already has a completion",
                self.inner.id
            )));
        }
        *slot = Some(cb);
        Ok(())
    }

    pub(crate) fn take_completion(&self) -> Option<CompletionCallback> {
        self.inner.completion.lock().take()
    }

    /// Invoke the completion, if it has not been invoked yet.
    pub(crate) fn deliver(&self, result: Result<RpcOutput>) {
        if let Some(cb) = self.take_completion() {
            cb(CompletionInfo {
                rpc: self.clone(),
                result,
            });
        }
    }

    pub(crate) fn attach(&self, entry: EntryRef) {
        *self.inner.entry.lock() = Some(entry);
        self.inner.tracked.store(true, Ordering::Release);
    }

    /// Clear the tracked flag and hand back the entry reference.
    ///
    /// Only the first caller gets `Some`; this is the untrack gate.
    pub(crate) fn detach(&self) -> Option<EntryRef> {
        if !self.inner.tracked.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.inner.entry.lock().take()
    }

    pub(crate) fn entry(&self) -> Option<Arc<EndpointEntry>> {
        self.inner.entry.lock().as_ref().map(EntryRef::shared)
    }

    pub(crate) fn set_deadline(&self, deadline: Option<Instant>) {
        *self.inner.deadline.lock() = deadline;
    }

    pub(crate) fn mark_timed_out(&self) {
        self.inner.timed_out.store(true, Ordering::Release);
    }

    pub(crate) fn downgrade(&self) -> WeakRpc {
        WeakRpc(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for RpcRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcRequest")
            .field("id", &self.inner.id)
            .field("ctx", &self.inner.ctx_idx)
            .field("opcode", &self.inner.opcode)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("tracked", &self.is_tracked())
            .finish()
    }
}

/// Non-owning reference kept by the timeout heap.
pub(crate) struct WeakRpc(Weak<RequestInner>);

impl WeakRpc {
    pub(crate) fn upgrade(&self) -> Option<RpcRequest> {
        self.0.upgrade().map(|inner| RpcRequest { inner })
    }
}

/// Resolving side of [`Context::send_with_handle`].
///
/// Yields the request's result exactly once.
pub struct ReplyHandle {
    rpc: RpcRequest,
    rx: Receiver<Result<RpcOutput>>,
}

impl ReplyHandle {
    pub(crate) fn channel(rpc: &RpcRequest) -> (CompletionCallback, ReplyHandle) {
        let (tx, rx) = channel::bounded(1);
        let cb: CompletionCallback = Box::new(move |info: CompletionInfo| {
            // Receiver may be gone; the result is then simply dropped.
            let _ = tx.send(info.result);
        });
        (
            cb,
            ReplyHandle {
                rpc: rpc.clone(),
                rx,
            },
        )
    }

    pub fn rpc(&self) -> &RpcRequest {
        &self.rpc
    }

    /// Non-blocking poll. `None` while the request is outstanding.
    pub fn try_recv(&self) -> Option<Result<RpcOutput>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Canceled)),
        }
    }

    /// Block until resolved. Another thread must be driving progress.
    pub fn wait(&self, timeout: Duration) -> Result<RpcOutput> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(channel::RecvTimeoutError::Timeout) => Err(Error::TimedOut),
            Err(channel::RecvTimeoutError::Disconnected) => Err(Error::Canceled),
        }
    }

    /// Drive `ctx` progress until resolved. `None` waits without deadline.
    pub fn wait_progress(&self, ctx: &Context, timeout: Option<Duration>) -> Result<RpcOutput> {
        let mut slot = None;
        ctx.progress_cond(timeout, || {
            if slot.is_none() {
                slot = self.try_recv();
            }
            slot.is_some()
        })?;
        slot.unwrap_or(Err(Error::TimedOut))
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle").field("rpc", &self.rpc).finish()
    }
}
