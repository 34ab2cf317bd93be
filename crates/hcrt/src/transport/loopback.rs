// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process fabric.
//!
//! Every opened (rank, context) pair gets a port: an unbounded crossbeam
//! channel registered in a shared map. Sending a request pushes it onto the
//! destination port; replies travel back on the source port. Several
//! runtimes (one per simulated rank) can share one [`LoopbackFabric`].
//!
//! Per-rank fault injection covers the failure paths of the tracker and the
//! group protocol:
//!
//! | Fault | Effect on `send` to that rank |
//! |-------|-------------------------------|
//! | [`LoopbackFabric::fail_sends_to`] | returns `Err(Transport)` synchronously |
//! | [`LoopbackFabric::fail_deliveries_to`] | accepted, completes with `Unreachable` |
//! | [`LoopbackFabric::blackhole`] | accepted, never answered |

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Fabric, IncomingRpc, Transport, TransportEvent};
use crate::error::{Error, Result};
use crate::rpc::{Endpoint, Opcode, Rank, RpcInput, RpcOutput, RpcRequest};

/// Upper bound of events returned by one progress call.
const MAX_EVENTS_PER_POLL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    RefuseSend,
    FailDelivery,
    Blackhole,
}

enum Envelope {
    Request {
        id: u64,
        opcode: Opcode,
        source: Endpoint,
        input: RpcInput,
    },
    Reply {
        id: u64,
        result: Result<RpcOutput>,
    },
}

struct FabricShared {
    ports: DashMap<Endpoint, Sender<Envelope>>,
    faults: DashMap<Rank, Fault>,
    fail_aborts: AtomicBool,
}

/// Shared in-process fabric. Cloning yields another handle to the same one.
#[derive(Clone)]
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FabricShared {
                ports: DashMap::new(),
                faults: DashMap::new(),
                fail_aborts: AtomicBool::new(false),
            }),
        }
    }

    /// Sends to `rank` fail synchronously.
    pub fn fail_sends_to(&self, rank: Rank) {
        self.shared.faults.insert(rank, Fault::RefuseSend);
    }

    /// Sends to `rank` are accepted and then complete with `Unreachable`.
    pub fn fail_deliveries_to(&self, rank: Rank) {
        self.shared.faults.insert(rank, Fault::FailDelivery);
    }

    /// Sends to `rank` are accepted and never answered.
    pub fn blackhole(&self, rank: Rank) {
        self.shared.faults.insert(rank, Fault::Blackhole);
    }

    /// Remove any fault set for `rank`.
    pub fn heal(&self, rank: Rank) {
        self.shared.faults.remove(&rank);
    }

    /// Make every abort fail.
    pub fn fail_aborts(&self, fail: bool) {
        self.shared.fail_aborts.store(fail, Ordering::Release);
    }

    /// Number of open ports.
    pub fn port_count(&self) -> usize {
        self.shared.ports.len()
    }
}

impl Fabric for LoopbackFabric {
    fn open(&self, rank: Rank, ctx_idx: u32) -> Result<Arc<dyn Transport>> {
        let local = Endpoint::new(rank, ctx_idx);
        let (tx, rx) = channel::unbounded();
        match self.shared.ports.entry(local) {
            Entry::Occupied(_) => {
                return Err(Error::AlreadyExists(format!("loopback port {}", local)));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }
        log::debug!("[loopback] opened port {}", local);
        Ok(Arc::new(LoopbackTransport {
            local,
            shared: Arc::clone(&self.shared),
            tx,
            rx,
            outstanding: Mutex::new(HashMap::new()),
        }))
    }
}

/// One context's port on a [`LoopbackFabric`].
pub struct LoopbackTransport {
    local: Endpoint,
    shared: Arc<FabricShared>,
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    outstanding: Mutex<HashMap<u64, RpcRequest>>,
}

impl LoopbackTransport {
    pub fn local(&self) -> Endpoint {
        self.local
    }

    /// Queue a reply for one of our own requests.
    fn loop_back(&self, id: u64, result: Result<RpcOutput>) {
        // We hold the receiver, so the channel cannot be disconnected.
        let _ = self.tx.send(Envelope::Reply { id, result });
    }

    fn translate(&self, envelope: Envelope, events: &mut Vec<TransportEvent>) {
        match envelope {
            Envelope::Reply { id, result } => {
                match self.outstanding.lock().remove(&id) {
                    Some(rpc) => events.push(TransportEvent::Reply { rpc, result }),
                    None => log::trace!("[loopback {}] dropping stale reply for rpc {}", self.local, id),
                }
            }
            Envelope::Request {
                id,
                opcode,
                source,
                input,
            } => {
                let reply_to = self.shared.ports.get(&source).map(|tx| tx.value().clone());
                let responder = move |result: Result<RpcOutput>| match reply_to {
                    Some(tx) => {
                        let _ = tx.send(Envelope::Reply { id, result });
                    }
                    None => log::debug!("[loopback] reply for rpc {} to closed port {}", id, source),
                };
                events.push(TransportEvent::Request(IncomingRpc::new(
                    opcode, source, input, responder,
                )));
            }
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, rpc: &RpcRequest) -> Result<()> {
        let dest = rpc.endpoint();
        let fault = self.shared.faults.get(&dest.rank).map(|f| *f.value());
        if fault == Some(Fault::RefuseSend) {
            return Err(Error::Transport(format!("send to rank {} refused", dest.rank)));
        }

        self.outstanding.lock().insert(rpc.id(), rpc.clone());
        match fault {
            Some(Fault::FailDelivery) => {
                self.loop_back(rpc.id(), Err(Error::Unreachable(dest.rank)));
                return Ok(());
            }
            Some(Fault::Blackhole) => return Ok(()),
            _ => {}
        }

        let port = self.shared.ports.get(&dest).map(|tx| tx.value().clone());
        let delivered = port.is_some_and(|tx| {
            tx.send(Envelope::Request {
                id: rpc.id(),
                opcode: rpc.opcode(),
                source: self.local,
                input: rpc.input().clone(),
            })
            .is_ok()
        });
        if !delivered {
            log::debug!("[loopback {}] no port at {}", self.local, dest);
            self.loop_back(rpc.id(), Err(Error::Unreachable(dest.rank)));
        }
        Ok(())
    }

    fn abort(&self, rpc: &RpcRequest) -> Result<()> {
        if self.shared.fail_aborts.load(Ordering::Acquire) {
            return Err(Error::Transport(format!("abort of rpc {} refused", rpc.id())));
        }
        if self.outstanding.lock().contains_key(&rpc.id()) {
            self.loop_back(rpc.id(), Err(Error::Canceled));
        }
        Ok(())
    }

    fn progress(&self, timeout: Duration) -> Result<Vec<TransportEvent>> {
        let mut events = Vec::new();
        let first = if timeout.is_zero() {
            self.rx.try_recv().ok()
        } else {
            self.rx.recv_timeout(timeout).ok()
        };
        let Some(first) = first else {
            return Ok(events);
        };
        self.translate(first, &mut events);
        while events.len() < MAX_EVENTS_PER_POLL {
            match self.rx.try_recv() {
                Ok(envelope) => self.translate(envelope, &mut events),
                Err(_) => break,
            }
        }
        Ok(events)
    }

    fn shutdown(&self) {
        self.shared
            .ports
            .remove_if(&self.local, |_, tx| tx.same_channel(&self.tx));
        log::debug!("[loopback] closed port {}", self.local);
    }
}
