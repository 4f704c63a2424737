// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One pooled transport and its lifecycle (§4.8). A subconnection owns a
//! single `ClientConnection`, redialing it with exponential backoff whenever
//! the transport is lost or an RPC reports it dead. State transitions mirror
//! the teacher's `Connection`/`Session` split in `client/pool_sessions.rs`,
//! generalized from iSCSI TSIH/CID bookkeeping to an address-keyed pool
//! entry — see DESIGN.md.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    address::{Address, Balanced},
    call::unary::Unary,
    cfg::config::ClientConfig,
    client::connection::ClientConnection,
    context::CallContext,
    health,
    transport::Dialer,
    utils::{full_jitter, geometric_backoff},
    wire::{error::RpcStatus, message::Metadata},
};

const RECONNECT_INITIAL: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(5);
const RECONNECT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Serving,
    NotServing,
    ServiceUnknown,
}

/// One pooled connection to one resolved address (§4.8). `Pool` holds one of
/// these per address and feeds `Arc<Subconnection>` into the balancer — the
/// blanket `Balanced for Arc<T>` impl (`address.rs`) is what makes that work
/// without an extra wrapper type.
pub struct Subconnection {
    pub address: Address,
    dialer: Arc<dyn Dialer>,
    client_cfg: ClientConfig,

    state: std::sync::Mutex<SubState>,
    health: std::sync::Mutex<HealthStatus>,
    client_conn: std::sync::Mutex<Option<Arc<ClientConnection>>>,
    last_error: std::sync::Mutex<Option<RpcStatus>>,

    close_event: CancellationToken,
    connect_in_flight: AtomicBool,
}

impl Balanced for Subconnection {
    fn address(&self) -> &Address {
        &self.address
    }
}

impl Subconnection {
    pub fn new(address: Address, dialer: Arc<dyn Dialer>, client_cfg: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            address,
            dialer,
            client_cfg,
            state: std::sync::Mutex::new(SubState::Idle),
            health: std::sync::Mutex::new(HealthStatus::Unknown),
            client_conn: std::sync::Mutex::new(None),
            last_error: std::sync::Mutex::new(None),
            close_event: CancellationToken::new(),
            connect_in_flight: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> SubState {
        *self.state.lock().expect("subconnection state lock poisoned")
    }

    fn set_state(&self, s: SubState) {
        *self.state.lock().expect("subconnection state lock poisoned") = s;
    }

    pub fn health_status(&self) -> HealthStatus {
        *self.health.lock().expect("subconnection health lock poisoned")
    }

    fn set_health(&self, h: HealthStatus) {
        *self.health.lock().expect("subconnection health lock poisoned") = h;
    }

    pub fn last_error(&self) -> Option<RpcStatus> {
        self.last_error.lock().expect("subconnection last_error lock poisoned").clone()
    }

    pub fn client_connection(&self) -> Option<Arc<ClientConnection>> {
        self.client_conn.lock().expect("subconnection client_conn lock poisoned").clone()
    }

    /// A ready subconnection has `state=READY ∧ health=SERVING` (§4.9).
    pub fn is_ready(&self) -> bool {
        self.state() == SubState::Ready && self.health_status() == HealthStatus::Serving
    }

    /// Starts (or restarts) the connect/backoff loop. A second call while
    /// one is already in flight is a no-op; only the first caller's task
    /// runs to completion.
    pub fn connect(self: &Arc<Self>) {
        if self.state() == SubState::Shutdown {
            return;
        }
        if self.connect_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.connect_loop().await });
    }

    async fn connect_loop(self: Arc<Self>) {
        self.set_state(SubState::Connecting);
        let mut attempt = 0u32;
        loop {
            if self.state() == SubState::Shutdown {
                self.connect_in_flight.store(false, Ordering::SeqCst);
                return;
            }

            let dial_result = tokio::select! {
                biased;
                _ = self.close_event.cancelled() => {
                    self.connect_in_flight.store(false, Ordering::SeqCst);
                    return;
                }
                res = self.dialer.dial() => res,
            };

            match dial_result {
                Ok(mut transport) => {
                    // A SHUTDOWN observed while we were dialing: close what
                    // we just opened rather than handing it to ClientConnection.
                    if self.state() == SubState::Shutdown {
                        let _ = tokio::io::AsyncWriteExt::shutdown(&mut transport).await;
                        self.connect_in_flight.store(false, Ordering::SeqCst);
                        return;
                    }

                    let conn = ClientConnection::connect(transport, self.client_cfg.clone());
                    *self.client_conn.lock().expect("subconnection client_conn lock poisoned") = Some(conn);
                    self.set_health(HealthStatus::Serving);
                    self.set_state(SubState::Ready);
                    self.connect_in_flight.store(false, Ordering::SeqCst);
                    return;
                },
                Err(e) => {
                    let status = RpcStatus::unavailable(format!("dial {} failed: {e}", self.address.addr));
                    warn!("subconnection {} dial attempt {attempt} failed: {status}", self.address.addr);
                    *self.last_error.lock().expect("subconnection last_error lock poisoned") = Some(status);
                    self.set_state(SubState::TransientFailure);

                    let delay = full_jitter(geometric_backoff(attempt, RECONNECT_INITIAL, RECONNECT_MAX, RECONNECT_MULTIPLIER));
                    tokio::select! {
                        _ = self.close_event.cancelled() => {
                            self.connect_in_flight.store(false, Ordering::SeqCst);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                },
            }
        }
    }

    /// Observed by the pool when an RPC surfaces a connection-level failure:
    /// drops the stale `ClientConnection`, moves to CONNECTING, and restarts
    /// the backoff loop from attempt zero (§4.8).
    pub fn handle_connection_failure(self: &Arc<Self>, err: RpcStatus) {
        if self.state() == SubState::Shutdown {
            return;
        }
        *self.last_error.lock().expect("subconnection last_error lock poisoned") = Some(err);
        *self.client_conn.lock().expect("subconnection client_conn lock poisoned") = None;
        self.set_health(HealthStatus::Unknown);
        self.set_state(SubState::Connecting);
        self.connect_in_flight.store(false, Ordering::SeqCst);
        self.connect();
    }

    /// Runs the standard `health/Health/Check` unary RPC against the current
    /// `ClientConnection` (§4.8). Only meaningful when READY; a failing
    /// check moves `health` to `NotServing` without touching `state` — the
    /// pool drops this subconnection from its ready list without tearing
    /// down the transport underneath it.
    pub async fn check_health(&self, timeout: Duration) {
        if self.state() != SubState::Ready {
            return;
        }
        let Some(conn) = self.client_connection() else {
            self.set_health(HealthStatus::Unknown);
            return;
        };

        let ctx = CallContext::with_timeout(timeout);
        let outcome = async {
            let unary = Unary::open(conn, health::descriptor(), Metadata::new(), &ctx).await?;
            let resp = unary.call(health::encode_request(""), &ctx).await?;
            let _ = unary.close().await;
            Ok::<_, RpcStatus>(resp)
        }
        .await;

        match outcome {
            Ok(bytes) => match health::decode_response(&bytes) {
                Some(resp) if resp.status == health::ServingStatus::Serving => self.set_health(HealthStatus::Serving),
                Some(_) => self.set_health(HealthStatus::NotServing),
                None => self.set_health(HealthStatus::NotServing),
            },
            Err(e) => {
                debug!("health check failed for {}: {e}", self.address.addr);
                self.set_health(HealthStatus::NotServing);
            },
        }
    }

    /// READY -> IDLE: drops the transport without a permanent shutdown
    /// (§4.8).
    pub fn disconnect(&self) {
        if self.state() == SubState::Shutdown {
            return;
        }
        *self.client_conn.lock().expect("subconnection client_conn lock poisoned") = None;
        self.set_health(HealthStatus::Unknown);
        self.set_state(SubState::Idle);
    }

    /// Waits for in-flight calls on the current `ClientConnection` to drain
    /// before marking this subconnection SHUTDOWN (§4.8, terminal).
    pub async fn graceful_shutdown(&self, ctx: &CallContext) -> Result<(), RpcStatus> {
        let conn = self.client_connection();
        self.set_state(SubState::Shutdown);
        self.close_event.cancel();
        match conn {
            Some(conn) => conn.graceful_close(ctx).await,
            None => Ok(()),
        }
    }

    /// Immediate, non-graceful teardown (§4.8, terminal).
    pub fn shutdown(&self) {
        self.set_state(SubState::Shutdown);
        self.close_event.cancel();
        if let Some(conn) = self.client_conn.lock().expect("subconnection client_conn lock poisoned").take() {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::{DuplexTransport, Transport};

    struct DuplexDialer {
        server: std::sync::Mutex<Option<DuplexTransport>>,
    }

    #[async_trait::async_trait]
    impl Dialer for DuplexDialer {
        async fn dial(&self) -> anyhow::Result<Box<dyn Transport>> {
            let (client, server) = DuplexTransport::pair(64 * 1024);
            *self.server.lock().expect("dialer lock poisoned") = Some(server);
            Ok(Box::new(client))
        }
    }

    struct FailingDialer;

    #[async_trait::async_trait]
    impl Dialer for FailingDialer {
        async fn dial(&self) -> anyhow::Result<Box<dyn Transport>> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn connect_reaches_ready() {
        let dialer = Arc::new(DuplexDialer { server: std::sync::Mutex::new(None) });
        let sc = Subconnection::new(Address::new("dummy:1"), dialer, ClientConfig::default());
        sc.connect();

        for _ in 0..200 {
            if sc.state() == SubState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sc.state(), SubState::Ready);
        assert_eq!(sc.health_status(), HealthStatus::Serving);
        assert!(sc.is_ready());
    }

    #[tokio::test]
    async fn failing_dial_moves_to_transient_failure() {
        let sc = Subconnection::new(Address::new("dummy:1"), Arc::new(FailingDialer), ClientConfig::default());
        sc.connect();

        for _ in 0..50 {
            if sc.state() == SubState::TransientFailure {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sc.state(), SubState::TransientFailure);
        assert!(sc.last_error().is_some());
        assert!(!sc.is_ready());
    }

    #[tokio::test]
    async fn handle_connection_failure_reconnects() {
        let dialer = Arc::new(DuplexDialer { server: std::sync::Mutex::new(None) });
        let sc = Subconnection::new(Address::new("dummy:1"), dialer, ClientConfig::default());
        sc.connect();
        for _ in 0..200 {
            if sc.state() == SubState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sc.state(), SubState::Ready);

        sc.handle_connection_failure(RpcStatus::unavailable("lost"));
        for _ in 0..200 {
            if sc.state() == SubState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sc.state(), SubState::Ready);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let dialer = Arc::new(DuplexDialer { server: std::sync::Mutex::new(None) });
        let sc = Subconnection::new(Address::new("dummy:1"), dialer, ClientConfig::default());
        sc.connect();
        for _ in 0..200 {
            if sc.state() == SubState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sc.shutdown();
        assert_eq!(sc.state(), SubState::Shutdown);
        sc.connect();
        assert_eq!(sc.state(), SubState::Shutdown);
    }
}
