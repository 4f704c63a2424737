// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-side dispatch (§4.2). A `Server` owns a `Registry` of handlers and
//! the set of `ServerConnection`s currently accepted off a `Listener`; it is
//! the accept-loop and graceful-shutdown counterpart to the client's `Pool`.

pub mod connection;
pub mod handler;
pub mod registry;
pub mod stream;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tracing::{info, warn};

pub use connection::ServerConnection;
pub use handler::Handler;
pub use registry::{MethodInfo, RegisterError, Registry};

use crate::{
    cfg::config::ServerConfig,
    context::CallContext,
    wire::{error::RpcStatus, message::Descriptor},
};

/// Owns the handler registry and every currently-accepted connection.
/// `register` before `serve`; registering after connections are already
/// accepting `Open`s is legal but racy — new connections see it immediately,
/// connections already mid-dispatch only see it on their next `Open`.
pub struct Server {
    registry: Arc<Registry>,
    cfg: ServerConfig,
    connections: DashMap<u64, Arc<ServerConnection>>,
    next_conn_id: AtomicU64,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            cfg,
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, descriptor: &Descriptor, handler: Handler) -> Result<(), RegisterError> {
        self.registry.register(descriptor, handler)
    }

    pub fn methods(&self) -> Vec<MethodInfo> {
        self.registry.methods()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accepts connections off `listener` until it returns an error (the
    /// caller closing the listener is the normal way to stop this loop).
    pub async fn serve(self: &Arc<Self>, listener: &dyn crate::transport::Listener) -> anyhow::Result<()> {
        loop {
            let transport = listener.accept().await?;
            let conn = ServerConnection::accept(transport, Arc::clone(&self.registry), self.cfg.clone());
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
            self.connections.insert(conn_id, Arc::clone(&conn));

            let this = Arc::clone(self);
            tokio::spawn(async move {
                conn.transport_closed.cancelled().await;
                this.connections.remove(&conn_id);
            });
        }
    }

    /// Accepts a single already-dialed transport directly, bypassing
    /// `Listener` — used by in-process loopback setups (pools, tests) that
    /// hand the server one half of a `DuplexTransport` pair.
    pub fn accept_transport(self: &Arc<Self>, transport: Box<dyn crate::transport::Transport>) -> Arc<ServerConnection> {
        let conn = ServerConnection::accept(transport, Arc::clone(&self.registry), self.cfg.clone());
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(conn_id, Arc::clone(&conn));

        let this = Arc::clone(self);
        let watched = Arc::clone(&conn);
        tokio::spawn(async move {
            watched.transport_closed.cancelled().await;
            this.connections.remove(&conn_id);
        });

        conn
    }

    /// Sends `GoAway` on every live connection and waits (in parallel) for
    /// each to finish draining, bounded by `cfg.drain_timeout` unless `ctx`
    /// carries a tighter deadline (§4.10).
    pub async fn graceful_shutdown(&self, ctx: &CallContext) -> Result<(), RpcStatus> {
        let drain_ctx = ctx.clone().with_fallback_timeout(self.cfg.drain_timeout());
        let conns: Vec<Arc<ServerConnection>> = self.connections.iter().map(|e| e.value().clone()).collect();
        info!("graceful shutdown: draining {} connection(s)", conns.len());

        let mut set = tokio::task::JoinSet::new();
        for conn in conns {
            let drain_ctx = drain_ctx.clone();
            set.spawn(async move { conn.graceful_close(&drain_ctx).await });
        }

        let mut had_error = None;
        while let Some(res) = set.join_next().await {
            if let Ok(Err(status)) = res {
                warn!("connection failed to drain cleanly: {status}");
                had_error = Some(status);
            }
        }
        self.connections.clear();
        match had_error {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}
