// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Loopback wiring shared by the scenario tests: a `DuplexTransport` pair
//! standing in for a real socket, with a `ServerConnection` on one end and a
//! `ClientConnection` on the other.

use std::sync::Arc;

use rpcmux::{
    address::Address,
    cfg::config::{ClientConfig, ServerConfig},
    client::connection::ClientConnection,
    pool::DialerFactory,
    server::{Registry, ServerConnection},
    transport::{Dialer, DuplexTransport, Transport},
};

pub const LOOPBACK_BUF: usize = 256 * 1024;

/// Connects a fresh `ClientConnection` to a fresh `ServerConnection` over an
/// in-process duplex pipe, dispatching against `registry`.
pub fn connect_pair(registry: Arc<Registry>, client_cfg: ClientConfig, server_cfg: ServerConfig) -> (Arc<ClientConnection>, Arc<ServerConnection>) {
    let (client_t, server_t) = DuplexTransport::pair(LOOPBACK_BUF);
    let server = ServerConnection::accept(Box::new(server_t), registry, server_cfg);
    let client = ClientConnection::connect(Box::new(client_t), client_cfg);
    (client, server)
}

/// Dials a fresh in-process `ServerConnection` per call, backed by the same
/// registry — what a `Pool` needs to treat every resolved `Address` as its
/// own loopback "remote".
pub struct LoopbackDialer {
    pub registry: Arc<Registry>,
}

#[async_trait::async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self) -> anyhow::Result<Box<dyn Transport>> {
        let (client_t, server_t) = DuplexTransport::pair(LOOPBACK_BUF);
        ServerConnection::accept(Box::new(server_t), Arc::clone(&self.registry), ServerConfig::default());
        Ok(Box::new(client_t))
    }
}

pub fn loopback_dialer_factory(registry: Arc<Registry>) -> DialerFactory {
    Arc::new(move |_addr: &Address| Arc::new(LoopbackDialer { registry: Arc::clone(&registry) }) as Arc<dyn Dialer>)
}
