// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Opcode dispatch for inbound requests.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::Context;
use crate::error::{Error, Result};
use crate::rpc::Opcode;
use crate::transport::IncomingRpc;

/// Server side of an opcode. Runs on the thread driving progress and must
/// eventually call [`IncomingRpc::reply`].
pub trait RpcHandler: Send + Sync {
    fn handle(&self, ctx: &Context, request: IncomingRpc);
}

impl<F> RpcHandler for F
where
    F: Fn(&Context, IncomingRpc) + Send + Sync,
{
    fn handle(&self, ctx: &Context, request: IncomingRpc) {
        self(ctx, request);
    }
}

/// Handlers shared by every context of a runtime.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: DashMap<Opcode, Arc<dyn RpcHandler>>,
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, opcode: Opcode, handler: Arc<dyn RpcHandler>) -> Result<()> {
        match self.handlers.entry(opcode) {
            Entry::Occupied(_) => Err(Error::AlreadyExists(format!("handler for opcode {}", opcode))),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                log::debug!("[handlers] registered opcode {}", opcode);
                Ok(())
            }
        }
    }

    pub(crate) fn unregister(&self, opcode: Opcode) -> Result<()> {
        self.handlers
            .remove(&opcode)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("handler for opcode {}", opcode)))
    }

    pub(crate) fn get(&self, opcode: Opcode) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(&opcode).map(|h| Arc::clone(h.value()))
    }
}
