// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime: the state of one rank.
//!
//! ```text
//! Runtime (rank r of size n)
//! +-- contexts:  RwLock<BTreeMap<idx, Context>>   smallest free index first
//! +-- handlers:  HandlerTable                      shared by every context
//! +-- groups:    GroupRegistry                     primary group + protocol groups
//! +-- coordinator                                  GROUP_CREATE / GROUP_DESTROY
//! +-- fabric:    Arc<dyn Fabric>                   opens one transport per context
//! ```
//!
//! Group traffic always travels over context 0, so every rank taking part
//! in a group protocol must have created its first context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{clamp_credits, RuntimeConfig};
use crate::context::{Context, HandlerTable, RpcHandler};
use crate::error::{Error, Result};
use crate::group::{
    normalize_members, Group, GroupCompletion, GroupCoordinator, GroupPrivate, GroupRef,
    GroupRegistry,
};
use crate::rpc::{Opcode, Rank};
use crate::transport::{Fabric, IncomingRpc};

/// Builder for [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    rank: Rank,
    size: u32,
    config: Option<RuntimeConfig>,
    fabric: Option<Arc<dyn Fabric>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            size: 1,
            ..Self::default()
        }
    }

    /// Rank of this process.
    pub fn rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    /// Number of ranks in the job.
    pub fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Configuration. Defaults to [`RuntimeConfig::from_env`].
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Fabric that opens the context transports.
    pub fn fabric<F>(mut self, fabric: F) -> Self
    where
        F: Fabric + 'static,
    {
        self.fabric = Some(Arc::new(fabric));
        self
    }

    /// Build the runtime and register the primary group.
    pub fn build(self) -> Result<Runtime> {
        if self.size == 0 {
            return Err(Error::InvalidArgument("runtime size must be positive".into()));
        }
        if self.rank >= self.size {
            return Err(Error::InvalidArgument(format!(
                "rank {} out of range for size {}",
                self.rank, self.size
            )));
        }
        let fabric = self
            .fabric
            .ok_or_else(|| Error::InvalidArgument("fabric required".into()))?;
        let mut config = self.config.unwrap_or_else(RuntimeConfig::from_env);
        config.validate()?;
        config.credits_per_ep_ctx = clamp_credits(config.credits_per_ep_ctx);

        let groups = Arc::new(GroupRegistry::new());
        let primary_id = config.primary_group_id.clone();
        let (primary, _) = groups.lookup_or_insert(&primary_id, || {
            Arc::new(GroupPrivate::new_primary(&primary_id, self.size))
        });

        let handlers = Arc::new(HandlerTable::new());
        let coordinator = GroupCoordinator::new(self.rank, Arc::clone(&groups));
        let on_create = coordinator.clone();
        handlers.register(
            Opcode::GROUP_CREATE,
            Arc::new(move |_: &Context, request: IncomingRpc| on_create.handle_create(request)),
        )?;
        let on_destroy = coordinator.clone();
        handlers.register(
            Opcode::GROUP_DESTROY,
            Arc::new(move |_: &Context, request: IncomingRpc| on_destroy.handle_destroy(request)),
        )?;

        log::info!(
            "[runtime {}] up: size={} credits={} timeout={:?} primary={}",
            self.rank,
            self.size,
            config.credits_per_ep_ctx,
            config.rpc_timeout,
            primary_id
        );

        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                rank: self.rank,
                size: self.size,
                config,
                fabric,
                contexts: RwLock::new(BTreeMap::new()),
                handlers,
                groups,
                coordinator,
                primary: Group::new(primary),
                finalized: AtomicBool::new(false),
            }),
        })
    }
}

/// Handle to one rank's runtime. Cloning yields another handle to it.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    rank: Rank,
    size: u32,
    config: RuntimeConfig,
    fabric: Arc<dyn Fabric>,
    contexts: RwLock<BTreeMap<u32, Context>>,
    handlers: Arc<HandlerTable>,
    groups: Arc<GroupRegistry>,
    coordinator: GroupCoordinator,
    primary: Group,
    finalized: AtomicBool,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank
    }

    pub fn size(&self) -> u32 {
        self.inner.size
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.finalized.load(Ordering::Acquire) {
            return Err(Error::Uninitialized);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Contexts
    // ---------------------------------------------------------------------

    /// Create a context at the smallest free index.
    pub fn context_create(&self) -> Result<Context> {
        self.ensure_live()?;
        let mut contexts = self.inner.contexts.write();
        if contexts.len() >= self.inner.config.max_contexts {
            return Err(Error::Busy(format!(
                "context limit {} reached",
                self.inner.config.max_contexts
            )));
        }
        let idx = (0u32..)
            .find(|i| !contexts.contains_key(i))
            .ok_or(Error::NoMemory)?;
        let transport = self.inner.fabric.open(self.inner.rank, idx)?;
        let ctx = Context::new(
            idx,
            self.inner.rank,
            &self.inner.config,
            transport,
            Arc::clone(&self.inner.handlers),
        );
        contexts.insert(idx, ctx.clone());
        log::info!("[runtime {}] context {} created", self.inner.rank, idx);
        Ok(ctx)
    }

    /// Destroy `ctx`, see [`Context`] teardown. On success it leaves the
    /// registry and its index becomes free.
    pub fn context_destroy(&self, ctx: &Context, force: bool) -> Result<()> {
        match self.context_lookup(ctx.index()) {
            Some(current) if current.ptr_eq(ctx) => {}
            _ => return Err(Error::NotFound(format!("context {}", ctx.index()))),
        }
        // Forced teardown drives progress; the registry lock is not held.
        ctx.destroy(force)?;
        let mut contexts = self.inner.contexts.write();
        if matches!(contexts.get(&ctx.index()), Some(current) if current.ptr_eq(ctx)) {
            contexts.remove(&ctx.index());
        }
        Ok(())
    }

    pub fn context_lookup(&self, idx: u32) -> Option<Context> {
        self.inner.contexts.read().get(&idx).cloned()
    }

    pub fn context_count(&self) -> usize {
        self.inner.contexts.read().len()
    }

    /// Abort every request toward `rank` on every context.
    ///
    /// All contexts are visited; the first failure is returned.
    pub fn endpoint_abort(&self, rank: Rank) -> Result<()> {
        let contexts: Vec<Context> = self.inner.contexts.read().values().cloned().collect();
        let mut first = None;
        for ctx in contexts {
            if let Err(e) = ctx.abort_endpoint(rank) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    // ---------------------------------------------------------------------
    // Handlers
    // ---------------------------------------------------------------------

    /// Serve `opcode` on every context of this runtime.
    pub fn register_handler<H>(&self, opcode: Opcode, handler: H) -> Result<()>
    where
        H: RpcHandler + 'static,
    {
        if opcode.is_internal() {
            return Err(Error::InvalidArgument(format!("opcode {} is reserved", opcode)));
        }
        self.inner.handlers.register(opcode, Arc::new(handler))
    }

    pub fn unregister_handler(&self, opcode: Opcode) -> Result<()> {
        if opcode.is_internal() {
            return Err(Error::InvalidArgument(format!("opcode {} is reserved", opcode)));
        }
        self.inner.handlers.unregister(opcode)
    }

    // ---------------------------------------------------------------------
    // Groups
    // ---------------------------------------------------------------------

    fn control_context(&self) -> Result<Context> {
        self.context_lookup(0)
            .ok_or_else(|| Error::NotFound("context 0 carries group traffic".into()))
    }

    /// Create group `id` over `members`.
    ///
    /// Returns once the fan-out is started; its outcome reaches `on_complete`.
    pub fn group_create<F>(&self, id: &str, members: &[Rank], on_complete: F) -> Result<()>
    where
        F: FnOnce(GroupCompletion) + Send + 'static,
    {
        self.ensure_live()?;
        let ctx = self.control_context()?;
        self.inner
            .coordinator
            .create(&ctx, id, members, Box::new(on_complete))
    }

    /// Destroy a group created through [`Runtime::group_create`].
    pub fn group_destroy<F>(&self, group: &Group, on_complete: F) -> Result<()>
    where
        F: FnOnce(GroupCompletion) + Send + 'static,
    {
        self.ensure_live()?;
        let ctx = self.control_context()?;
        self.inner
            .coordinator
            .destroy(&ctx, group, Box::new(on_complete))
    }

    /// Group registered under `id`, unless it is being torn down.
    pub fn group_lookup(&self, id: &str) -> Option<Group> {
        self.inner
            .groups
            .lookup(id)
            .filter(|grp| !grp.is_finalizing())
            .map(Group::new)
    }

    /// Like [`Runtime::group_lookup`], holding a reference.
    pub fn group_lookup_ref(&self, id: &str) -> Option<GroupRef> {
        self.inner.groups.lookup_ref(id)
    }

    /// Record a group created elsewhere. It stays registered while a
    /// returned [`GroupRef`] (or a clone) lives.
    pub fn group_attach(&self, id: &str, members: &[Rank]) -> Result<GroupRef> {
        self.ensure_live()?;
        let members = normalize_members(members)?;
        self.inner.groups.attach(id, members)
    }

    /// The group of every rank.
    pub fn primary_group(&self) -> &Group {
        &self.inner.primary
    }

    /// Own rank, checked against `group` when given.
    pub fn group_rank(&self, group: Option<&Group>) -> Result<Rank> {
        let rank = self.inner.rank;
        match group {
            None => Ok(rank),
            Some(grp) if grp.is_local() && grp.contains(rank) => Ok(rank),
            Some(grp) => Err(Error::InvalidArgument(format!(
                "rank {} is not a local member of group {}",
                rank,
                grp.id()
            ))),
        }
    }

    /// Member count of `group`, or of the primary group.
    pub fn group_size(&self, group: Option<&Group>) -> u32 {
        group.unwrap_or(&self.inner.primary).size()
    }

    /// Identifiers of every registered group.
    pub fn group_ids(&self) -> Vec<String> {
        self.inner
            .groups
            .ids()
            .iter()
            .map(|id| id.to_string())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Shut the runtime down. Every context must have been destroyed.
    pub fn finalize(&self) -> Result<()> {
        self.ensure_live()?;
        let remaining = self.context_count();
        if remaining > 0 {
            return Err(Error::Busy(format!("{} contexts still open", remaining)));
        }
        self.inner.finalized.store(true, Ordering::Release);
        let groups = self.inner.groups.len();
        self.inner.groups.clear();
        log::info!(
            "[runtime {}] finalized ({} groups dropped)",
            self.inner.rank,
            groups
        );
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("rank", &self.inner.rank)
            .field("size", &self.inner.size)
            .field("contexts", &self.context_count())
            .field("groups", &self.inner.groups.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_CREDITS_PER_EP_CTX;
    use crate::rpc::{Endpoint, RpcInput, RpcOutput};
    use crate::transport::LoopbackFabric;
    use std::time::Duration;

    fn runtime(rank: Rank, size: u32, fabric: &LoopbackFabric) -> Runtime {
        Runtime::builder()
            .rank(rank)
            .size(size)
            .config(RuntimeConfig::default().with_max_contexts(3))
            .fabric(fabric.clone())
            .build()
            .expect("build runtime")
    }

    #[test]
    fn test_builder_validation() {
        let fabric = LoopbackFabric::new();
        assert!(Runtime::builder().size(0).fabric(fabric.clone()).build().is_err());
        assert!(Runtime::builder().rank(2).size(2).fabric(fabric.clone()).build().is_err());
        assert!(Runtime::builder().size(2).build().is_err());
        let bad = RuntimeConfig::default().with_primary_group_id("no;pe");
        assert!(Runtime::builder().config(bad).fabric(fabric).build().is_err());
    }

    #[test]
    fn test_builder_clamps_oversized_credits() {
        let fabric = LoopbackFabric::new();
        let config = RuntimeConfig {
            credits_per_ep_ctx: 1000,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_ok());
        let rt = Runtime::builder()
            .config(config)
            .fabric(fabric)
            .build()
            .expect("oversized credits are clamped");
        assert_eq!(rt.config().credits_per_ep_ctx, MAX_CREDITS_PER_EP_CTX);
        let ctx = rt.context_create().expect("ctx");
        assert_eq!(ctx.credits(), MAX_CREDITS_PER_EP_CTX);
        rt.context_destroy(&ctx, false).expect("destroy");
    }

    #[test]
    fn test_context_indices_are_reused() {
        let fabric = LoopbackFabric::new();
        let rt = runtime(0, 1, &fabric);
        let c0 = rt.context_create().expect("ctx 0");
        let c1 = rt.context_create().expect("ctx 1");
        let c2 = rt.context_create().expect("ctx 2");
        assert_eq!((c0.index(), c1.index(), c2.index()), (0, 1, 2));
        assert!(matches!(rt.context_create(), Err(Error::Busy(_))));

        rt.context_destroy(&c1, false).expect("destroy ctx 1");
        assert!(rt.context_lookup(1).is_none());
        assert!(matches!(rt.context_destroy(&c1, false), Err(Error::NotFound(_))));
        let again = rt.context_create().expect("reuse");
        assert_eq!(again.index(), 1);
        assert_eq!(rt.context_count(), 3);
    }

    #[test]
    fn test_finalize_requires_no_contexts() {
        let fabric = LoopbackFabric::new();
        let rt = runtime(0, 1, &fabric);
        let ctx = rt.context_create().expect("ctx");
        assert!(matches!(rt.finalize(), Err(Error::Busy(_))));
        rt.context_destroy(&ctx, false).expect("destroy");
        rt.finalize().expect("finalize");
        assert!(rt.is_finalized());
        assert_eq!(fabric.port_count(), 0);
        assert!(matches!(rt.context_create(), Err(Error::Uninitialized)));
        assert!(rt.group_lookup("hcrt_default_group").is_none());
    }

    #[test]
    fn test_reserved_opcodes_rejected() {
        let fabric = LoopbackFabric::new();
        let rt = runtime(0, 1, &fabric);
        let noop = |_: &Context, req: IncomingRpc| req.reply(Ok(RpcOutput::Empty));
        assert!(matches!(
            rt.register_handler(Opcode::GROUP_CREATE, noop),
            Err(Error::InvalidArgument(_))
        ));
        rt.register_handler(Opcode(7), noop).expect("register");
        assert!(matches!(
            rt.register_handler(Opcode(7), noop),
            Err(Error::AlreadyExists(_))
        ));
        rt.unregister_handler(Opcode(7)).expect("unregister");
        assert!(matches!(rt.unregister_handler(Opcode(7)), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_primary_group_and_rank_queries() {
        let fabric = LoopbackFabric::new();
        let rt = runtime(1, 4, &fabric);
        assert_eq!(rt.group_size(None), 4);
        assert_eq!(rt.group_rank(None), Ok(1));

        let primary = rt.group_lookup("hcrt_default_group").expect("primary");
        assert!(primary.ptr_eq(rt.primary_group()));
        assert_eq!(rt.group_rank(Some(&primary)), Ok(1));

        let remote = rt.group_attach("remote", &[3, 2, 3]).expect("attach");
        assert_eq!(rt.group_size(Some(&remote)), 2);
        assert!(matches!(
            rt.group_rank(Some(&remote)),
            Err(Error::InvalidArgument(_))
        ));
        drop(remote);
        assert!(rt.group_lookup("remote").is_none());
    }

    #[test]
    fn test_group_calls_need_context_zero() {
        let fabric = LoopbackFabric::new();
        let rt = runtime(0, 1, &fabric);
        assert!(matches!(
            rt.group_create("g1", &[0], |_| {}),
            Err(Error::NotFound(_))
        ));
        let primary = rt.primary_group().clone();
        let ctx = rt.context_create().expect("ctx");
        assert!(matches!(
            rt.group_destroy(&primary, |_| {}),
            Err(Error::InvalidArgument(_))
        ));
        rt.context_destroy(&ctx, false).expect("destroy");
    }

    #[test]
    fn test_user_handler_round_trip() {
        let fabric = LoopbackFabric::new();
        let server = runtime(0, 2, &fabric);
        let client = runtime(1, 2, &fabric);
        let sctx = server.context_create().expect("server ctx");
        let cctx = client.context_create().expect("client ctx");
        server
            .register_handler(Opcode(42), |_: &Context, req: IncomingRpc| {
                let echo = match req.input() {
                    RpcInput::Raw(bytes) => bytes.iter().rev().copied().collect(),
                    _ => Vec::new(),
                };
                req.reply(Ok(RpcOutput::Raw(echo)));
            })
            .expect("register");

        let rpc = cctx.new_request(Endpoint::primary(0), Opcode(42), RpcInput::Raw(vec![1, 2, 3]));
        let handle = cctx.send_with_handle(&rpc).expect("send");
        sctx.progress(Duration::from_millis(100)).expect("server progress");
        let out = handle
            .wait_progress(&cctx, Some(Duration::from_secs(5)))
            .expect("reply");
        assert_eq!(out, RpcOutput::Raw(vec![3, 2, 1]));
    }
}
