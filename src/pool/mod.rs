// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A set of subconnections over one resolved target, balanced and health
//! routed (§4.9). The teacher has no direct analogue — `pool_sessions.rs`
//! keys connections by iSCSI TSIH/CID, not by resolved address — so this
//! module's shape is drawn from general load-balancer idiom, the same
//! source `balancer` itself draws from (see DESIGN.md).

pub mod subconnection;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

pub use subconnection::{HealthStatus, SubState, Subconnection};

use crate::{
    address::{Address, Target},
    balancer::{self, Picker},
    call::unary::Unary,
    cfg::config::{ClientConfig, PoolConfig},
    context::CallContext,
    interceptor::chain::UnaryInvoker,
    resolver,
    transport::Dialer,
    wire::{
        error::{ErrorCode, RpcStatus},
        message::{Descriptor, Metadata, RpcType},
    },
};

struct ReadyState {
    list: Vec<Arc<Subconnection>>,
    event: CancellationToken,
}

/// Builds a `Dialer` for a resolved address. Kept transport-agnostic rather
/// than hardwiring `TcpDialer` so a `DuplexTransport`-backed test pool can
/// supply its own factory.
pub type DialerFactory = Arc<dyn Fn(&Address) -> Arc<dyn Dialer> + Send + Sync>;

pub struct Pool {
    target: Target,
    dialer_factory: DialerFactory,
    client_cfg: ClientConfig,
    cfg: PoolConfig,

    subconns: DashMap<String, Arc<Subconnection>>,
    ready: std::sync::Mutex<ReadyState>,
    closed: CancellationToken,
    balancer: Box<dyn Picker<Arc<Subconnection>>>,
}

impl Pool {
    /// Resolves `raw_target` through the scheme registry (§4.7) and builds
    /// one subconnection per resolved address.
    pub async fn new(
        raw_target: &str,
        dialer_factory: DialerFactory,
        client_cfg: ClientConfig,
        cfg: PoolConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let target = Target::parse(raw_target)?;
        let res = resolver::build_for_scheme(&target.scheme)?;
        let addresses = res.resolve(&target).await?;
        Ok(Self::from_addresses(target, addresses, dialer_factory, client_cfg, cfg))
    }

    /// Builds a pool over an already-resolved address set, bypassing the
    /// resolver registry — what `Pool::new` delegates to, and what tests
    /// reach for directly when they want explicit control over addresses.
    pub fn from_addresses(
        target: Target,
        addresses: Vec<Address>,
        dialer_factory: DialerFactory,
        client_cfg: ClientConfig,
        cfg: PoolConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            target,
            dialer_factory,
            balancer: balancer::build(cfg.balancer),
            client_cfg,
            cfg,
            subconns: DashMap::new(),
            ready: std::sync::Mutex::new(ReadyState {
                list: Vec::new(),
                event: CancellationToken::new(),
            }),
            closed: CancellationToken::new(),
        });

        for addr in addresses {
            pool.add_subconnection(addr);
        }

        if pool.cfg.health_check_interval_ms > 0 {
            let health_pool = Arc::clone(&pool);
            tokio::spawn(async move { health_pool.health_check_loop().await });
        }

        pool
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    fn add_subconnection(self: &Arc<Self>, address: Address) {
        let dialer = (self.dialer_factory)(&address);
        let key = address.addr.clone();
        let sc = Subconnection::new(address, dialer, self.client_cfg.clone());
        sc.connect();
        self.subconns.insert(key, sc);
        self.rebuild_ready();
    }

    /// Rebuilds the ready list from current subconnection state. On an
    /// empty -> non-empty transition, fires the current broadcast event and
    /// allocates a fresh one — a one-shot fan-out; waiters re-check the
    /// ready list after waking up rather than being handed it directly
    /// (§4.9).
    fn rebuild_ready(&self) {
        let new_list: Vec<Arc<Subconnection>> =
            self.subconns.iter().filter(|e| e.value().is_ready()).map(|e| e.value().clone()).collect();
        let mut guard = self.ready.lock().expect("pool ready lock poisoned");
        let was_empty = guard.list.is_empty();
        guard.list = new_list;
        if was_empty && !guard.list.is_empty() {
            guard.event.cancel();
            guard.event = CancellationToken::new();
        }
    }

    /// Picks a ready subconnection (§4.9). Reads the ready list and the
    /// broadcast event under lock; the actual pick happens outside it, so
    /// the balancer never runs while holding the pool's state lock. With
    /// `wait_for_ready=false` an empty ready list fails immediately;
    /// otherwise this blocks on the broadcast event, the pool's close
    /// signal, or `ctx`, re-picking each time the event fires.
    pub async fn pick(&self, ctx: &CallContext, wait_for_ready: bool) -> Result<Arc<Subconnection>, RpcStatus> {
        loop {
            let (snapshot, wait_token) = {
                let guard = self.ready.lock().expect("pool ready lock poisoned");
                (guard.list.clone(), guard.event.clone())
            };
            if let Some(sc) = self.balancer.pick(&snapshot) {
                return Ok(sc);
            }
            if !wait_for_ready {
                return Err(RpcStatus::unavailable("no ready subconnections"));
            }
            tokio::select! {
                _ = wait_token.cancelled() => continue,
                _ = self.closed.cancelled() => return Err(RpcStatus::unavailable("pool closed")),
                status = ctx.done() => return Err(status),
            }
        }
    }

    fn is_connection_error(status: &RpcStatus) -> bool {
        status.code == ErrorCode::Unavailable
    }

    /// Reports an RPC-observed failure on `sc` so the pool can kick off
    /// reconnection and rebuild its ready list, but only for errors that
    /// look connection-level rather than application-level (§4.9).
    pub fn report_call_result(&self, sc: &Arc<Subconnection>, result: &Result<Vec<u8>, RpcStatus>) {
        if let Err(status) = result {
            if Self::is_connection_error(status) {
                sc.handle_connection_failure(status.clone());
                self.rebuild_ready();
            }
        }
    }

    /// Picks a subconnection and runs one unary RPC through it, reporting
    /// the outcome back so connection failures trigger reconnection (§4.9
    /// "RPC delegation").
    pub async fn call_unary(
        &self,
        descriptor: Descriptor,
        metadata: Metadata,
        req: Vec<u8>,
        ctx: &CallContext,
        wait_for_ready: bool,
    ) -> Result<Vec<u8>, RpcStatus> {
        let sc = self.pick(ctx, wait_for_ready).await?;
        let Some(conn) = sc.client_connection() else {
            return Err(RpcStatus::unavailable("subconnection has no active connection"));
        };

        let result = async {
            let unary = Unary::open(conn, descriptor, metadata, ctx).await?;
            let resp = unary.call(req, ctx).await;
            let _ = unary.close().await;
            resp
        }
        .await;

        self.report_call_result(&sc, &result);
        result
    }

    async fn health_check_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.health_check_interval()) => {}
            }
            let subconns: Vec<Arc<Subconnection>> = self.subconns.iter().map(|e| e.value().clone()).collect();
            for sc in subconns {
                sc.check_health(self.cfg.health_check_timeout()).await;
            }
            self.rebuild_ready();
        }
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().expect("pool ready lock poisoned").list.len()
    }

    pub fn len(&self) -> usize {
        self.subconns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subconns.is_empty()
    }

    /// Closes every subconnection gracefully, in parallel, bounded by `ctx`
    /// (§4.9).
    pub async fn graceful_close(&self, ctx: &CallContext) -> Result<(), RpcStatus> {
        self.closed.cancel();
        let subconns: Vec<Arc<Subconnection>> = self.subconns.iter().map(|e| e.value().clone()).collect();
        let mut set = tokio::task::JoinSet::new();
        for sc in subconns {
            let ctx = ctx.clone();
            set.spawn(async move { sc.graceful_shutdown(&ctx).await });
        }
        tokio::select! {
            _ = async { while set.join_next().await.is_some() {} } => Ok(()),
            status = ctx.done() => {
                set.abort_all();
                Err(status)
            }
        }
    }
}

/// Lets interceptor chains (§4.5) treat a `Pool` as the terminal invoker: the
/// method string is the usual `pkg/service/method` URI, always dispatched as
/// `Synchronous`.
#[async_trait]
impl UnaryInvoker for Pool {
    async fn invoke(&self, ctx: &CallContext, method: &str, req: Vec<u8>) -> Result<Vec<u8>, RpcStatus> {
        let mut parts = method.splitn(3, '/');
        let (pkg, service, m) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(s), Some(m)) => (p, s, m),
            _ => return Err(RpcStatus::invalid_argument(format!("malformed method uri {method:?}"))),
        };
        let descriptor = Descriptor::new(pkg, service, m, RpcType::Synchronous);
        self.call_unary(descriptor, Metadata::new(), req, ctx, false).await
    }
}
