// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One accepted transport; the server-side mirror of `client::connection`
//! (§4.2, §4.3). Owns the read loop, dispatches `Open` against the registry,
//! and drives each accepted session's handler to completion.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    io::{ReadHalf, WriteHalf, split},
    sync::{Mutex, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::ServerConfig,
    context::CallContext,
    server::{
        handler::{BiDirHandler, Handler, HandlerMeta, RecvHandler, SendHandler, SyncHandler},
        registry::Registry,
        stream::{ServerBiDirStream, ServerRecvStream, ServerSendStream},
    },
    session::ServerSession,
    transport::Transport,
    wire::{
        codec,
        compression,
        error::{ErrorCode, RpcStatus},
        message::{Cancel, Close, CompressionTag, GoAway, Message, Open, OpenAck, Payload, Ping, Pong},
    },
};

type BoxTransport = Box<dyn Transport>;

const SESSION_QUEUE_DEPTH: usize = 64;
/// Fallback cap for a payload arriving before its session is fully tracked,
/// or when the negotiated `Open.max_payload_size` was zero.
const DEFAULT_MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

/// One accepted transport, dispatching `Open`s against a shared `Registry`
/// and driving every session it accepts to a terminal `Close` (§4.2).
pub struct ServerConnection {
    reader: Mutex<ReadHalf<BoxTransport>>,
    writer: Mutex<WriteHalf<BoxTransport>>,
    registry: Arc<Registry>,
    cfg: ServerConfig,

    sessions: DashMap<u32, Arc<ServerSession>>,
    session_tx: DashMap<u32, tokio::sync::mpsc::Sender<Payload>>,
    /// Per in-flight `Synchronous` request, so a targeted `Cancel` can stop
    /// one call without tearing down the whole session (§4.1 "Cancel ...
    /// does not imply Close").
    request_cancel: DashMap<(u32, u32), CancellationToken>,
    next_session_id: AtomicU32,

    concurrency: Option<Arc<Semaphore>>,

    fatal: OnceLock<RpcStatus>,
    pub transport_closed: CancellationToken,
    draining: AtomicBool,
    packing_decided: OnceLock<bool>,
}

impl ServerConnection {
    /// Accepts `transport` as a server connection and starts its read loop.
    pub fn accept(transport: BoxTransport, registry: Arc<Registry>, cfg: ServerConfig) -> Arc<Self> {
        let (read, write) = split(transport);
        let concurrency =
            if cfg.max_concurrent_rpcs > 0 { Some(Arc::new(Semaphore::new(cfg.max_concurrent_rpcs as usize))) } else { None };

        let conn = Arc::new(Self {
            reader: Mutex::new(read),
            writer: Mutex::new(write),
            registry,
            cfg,
            sessions: DashMap::new(),
            session_tx: DashMap::new(),
            request_cancel: DashMap::new(),
            next_session_id: AtomicU32::new(1),
            concurrency,
            fatal: OnceLock::new(),
            transport_closed: CancellationToken::new(),
            draining: AtomicBool::new(false),
            packing_decided: OnceLock::new(),
        });

        let reader_task = Arc::clone(&conn);
        tokio::spawn(async move { reader_task.read_loop().await });

        conn
    }

    pub fn fatal_error(&self) -> Option<RpcStatus> {
        self.fatal.get().cloned()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn packing_active(&self) -> bool {
        self.packing_decided.get().copied().unwrap_or(false)
    }

    // ---- write path ----

    async fn write_raw(&self, msg: &Message) -> Result<(), RpcStatus> {
        if let Some(status) = self.fatal.get() {
            return Err(status.clone());
        }
        let pack_active = self.packing_active() && !msg.is_negotiation();
        let mut w = self.writer.lock().await;
        if let Some(status) = self.fatal.get() {
            return Err(status.clone());
        }
        if let Err(e) = codec::write_message(&mut *w, msg, pack_active).await {
            let status = RpcStatus::unavailable(format!("write failed: {e}"));
            drop(w);
            self.fail_all(status.clone());
            return Err(status);
        }
        Ok(())
    }

    pub async fn send_payload(&self, payload: Payload) -> Result<(), RpcStatus> {
        self.write_raw(&Message::Payload(payload)).await
    }

    pub async fn send_close(&self, close: Close) -> Result<(), RpcStatus> {
        self.write_raw(&Message::Close(close)).await
    }

    /// Sends `GoAway` and marks this connection draining: further `Open`s
    /// are rejected `Unavailable` (§4.10).
    pub async fn send_go_away(&self, last_session_id: u32, debug_data: impl Into<String>) -> Result<(), RpcStatus> {
        self.draining.store(true, Ordering::SeqCst);
        self.write_raw(&Message::GoAway(GoAway {
            last_session_id,
            err_code: ErrorCode::None,
            debug_data: debug_data.into(),
        }))
        .await
    }

    // ---- read loop ----

    async fn read_loop(self: Arc<Self>) {
        loop {
            let read_result = {
                let mut r = self.reader.lock().await;
                codec::read_message(&mut *r).await
            };

            match read_result {
                Ok(Some(msg)) => self.dispatch(msg).await,
                Ok(None) => {
                    self.fail_all(RpcStatus::unavailable("transport closed"));
                    return;
                },
                Err(e) => {
                    warn!("server read loop error: {e}");
                    self.fail_all(RpcStatus::unavailable(format!("read error: {e}")));
                    return;
                },
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Open(o) => self.handle_open(o).await,
            Message::Payload(p) => self.handle_payload(p).await,
            Message::Close(c) => self.handle_close(c).await,
            Message::Cancel(c) => self.handle_cancel(c),
            Message::Ping(p) => self.handle_ping(p).await,
            Message::OpenAck(_) | Message::Pong(_) | Message::GoAway(_) => {
                debug!("server connection ignoring client-bound message {}", msg.kind());
            },
        }
    }

    fn reject(open_id: u32, code: ErrorCode, message: impl Into<String>) -> OpenAck {
        OpenAck {
            open_id,
            session_id: 0,
            protocol_major: 1,
            protocol_minor: 0,
            err_code: code,
            err_message: message.into(),
            packing_agreed: false,
            metadata: Vec::new(),
        }
    }

    async fn handle_open(self: &Arc<Self>, open: Open) {
        if self.draining.load(Ordering::SeqCst) {
            let _ = self.write_raw(&Message::OpenAck(Self::reject(open.open_id, ErrorCode::Unavailable, "server draining"))).await;
            return;
        }

        let Some(handler) = self.registry.lookup(&open.descriptor) else {
            let _ = self
                .write_raw(&Message::OpenAck(Self::reject(
                    open.open_id,
                    ErrorCode::Unimplemented,
                    format!("no handler registered for {}", open.descriptor.uri()),
                )))
                .await;
            return;
        };
        if handler.rpc_type() != open.descriptor.rpc_type {
            let _ = self
                .write_raw(&Message::OpenAck(Self::reject(open.open_id, ErrorCode::InvalidArgument, "rpc_type mismatch")))
                .await;
            return;
        }

        let permit = match &self.concurrency {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => {
                    let _ = self
                        .write_raw(&Message::OpenAck(Self::reject(
                            open.open_id,
                            ErrorCode::ResourceExhausted,
                            "max_concurrent_rpcs reached",
                        )))
                        .await;
                    return;
                },
            },
            None => None,
        };

        if self.packing_decided.get().is_none() {
            let _ = self.packing_decided.set(self.cfg.allow_packing && open.packing_requested);
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = tokio::sync::mpsc::channel(SESSION_QUEUE_DEPTH);
        let max_payload_size = if open.max_payload_size > 0 { open.max_payload_size } else { DEFAULT_MAX_PAYLOAD };
        let session = Arc::new(ServerSession::new(
            session_id,
            open.descriptor.clone(),
            open.metadata.into_iter().collect(),
            max_payload_size,
            rx,
        ));
        self.session_tx.insert(session_id, tx);
        self.sessions.insert(session_id, Arc::clone(&session));

        let ack = OpenAck {
            open_id: open.open_id,
            session_id,
            protocol_major: 1,
            protocol_minor: 0,
            err_code: ErrorCode::None,
            err_message: String::new(),
            packing_agreed: self.packing_active(),
            metadata: Vec::new(),
        };
        if self.write_raw(&Message::OpenAck(ack)).await.is_err() {
            return;
        }

        let this = Arc::clone(self);
        match handler {
            Handler::Sync(SyncHandler(f)) => {
                tokio::spawn(async move { this.dispatch_sync(session, f, permit).await });
            },
            Handler::BiDir(BiDirHandler(f)) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    this.dispatch_bidir(session, f).await
                });
            },
            Handler::Send(SendHandler(f)) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    this.dispatch_send(session, f).await
                });
            },
            Handler::Recv(RecvHandler(f)) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    this.dispatch_recv(session, f).await
                });
            },
        }
    }

    /// Drives a `Synchronous` session: every incoming `Payload` is a
    /// separate call, dispatched to its own task so concurrent `req_id`s on
    /// one session run concurrently (mirroring the client's demux). A
    /// handler error ends the whole session — the wire has nowhere to carry
    /// a per-call error except `Close` (§9 "Synchronous handler errors").
    async fn dispatch_sync(
        self: Arc<Self>,
        session: Arc<ServerSession>,
        handler: crate::server::handler::SyncFn,
        _permit: Option<OwnedSemaphorePermit>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = session.cancel.cancelled() => break,
                maybe = session.recv() => {
                    let Some(p) = maybe else { break };
                    if p.end_stream {
                        break;
                    }
                    self.spawn_sync_call(&session, &handler, p);
                }
            }
        }
        self.finish_session(&session, Ok(())).await;
    }

    fn spawn_sync_call(self: &Arc<Self>, session: &Arc<ServerSession>, handler: &crate::server::handler::SyncFn, p: Payload) {
        let conn = Arc::clone(self);
        let handler = Arc::clone(handler);
        let metadata = session.request_metadata.clone();
        let session_id = session.session_id;
        let req_id = p.req_id;
        let cancel = CancellationToken::new();
        self.request_cancel.insert((session_id, req_id), cancel.clone());

        tokio::spawn(async move {
            let ctx = CallContext::new();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RpcStatus::canceled("request canceled")),
                r = handler(ctx, p.bytes, metadata) => r,
            };
            conn.request_cancel.remove(&(session_id, req_id));

            match result {
                Ok(resp) => {
                    let _ = conn
                        .send_payload(Payload {
                            session_id,
                            req_id,
                            bytes: resp,
                            end_stream: false,
                            compression: CompressionTag::None,
                        })
                        .await;
                },
                Err(status) => {
                    let _ = conn
                        .send_close(Close {
                            session_id,
                            err_code: status.code,
                            err_message: status.message,
                            metadata: Vec::new(),
                        })
                        .await;
                    conn.session_tx.remove(&session_id);
                    if let Some((_, s)) = conn.sessions.remove(&session_id) {
                        s.cancel.cancel();
                        s.closed.cancel();
                    }
                },
            }
        });
    }

    async fn dispatch_bidir(self: Arc<Self>, session: Arc<ServerSession>, handler: crate::server::handler::BiDirFn) {
        let metadata = session.request_metadata.clone();
        let stream = ServerBiDirStream::new(Arc::clone(&self), Arc::clone(&session));
        let ctx = CallContext::new();
        let result = handler(ctx, stream, metadata).await;
        if result.is_ok() {
            self.send_terminal_marker(session.session_id).await;
        }
        self.finish_session(&session, result).await;
    }

    async fn dispatch_send(self: Arc<Self>, session: Arc<ServerSession>, handler: crate::server::handler::SendFn) {
        let metadata = session.request_metadata.clone();
        let stream = ServerSendStream::new(Arc::clone(&session));
        let ctx = CallContext::new();
        match handler(ctx, stream, metadata).await {
            Ok(resp) => {
                let session_id = session.session_id;
                let _ = self
                    .send_payload(Payload {
                        session_id,
                        req_id: 0,
                        bytes: resp,
                        end_stream: false,
                        compression: CompressionTag::None,
                    })
                    .await;
                self.finish_session(&session, Ok(())).await;
            },
            Err(status) => self.finish_session(&session, Err(status)).await,
        }
    }

    async fn dispatch_recv(self: Arc<Self>, session: Arc<ServerSession>, handler: crate::server::handler::RecvFn) {
        let metadata = session.request_metadata.clone();
        let stream = ServerRecvStream::new(Arc::clone(&self), Arc::clone(&session));
        let ctx = CallContext::new();
        let result = handler(ctx, stream, metadata).await;
        if result.is_ok() {
            self.send_terminal_marker(session.session_id).await;
        }
        self.finish_session(&session, result).await;
    }

    /// Emits the empty `end_stream=true` `Payload` that precedes a
    /// successful `BiDirectional`/`Recv` session's terminal `Close` (§4.2,
    /// §4.10): the directions that stream from server to client need their
    /// own end-of-stream marker, distinct from the session-level `Close`.
    async fn send_terminal_marker(&self, session_id: u32) {
        let _ = self
            .send_payload(Payload {
                session_id,
                req_id: 0,
                bytes: Vec::new(),
                end_stream: true,
                compression: CompressionTag::None,
            })
            .await;
    }

    async fn finish_session(&self, session: &Arc<ServerSession>, result: Result<(), RpcStatus>) {
        let close = match result {
            Ok(()) => Close::ok(session.session_id),
            Err(status) => Close {
                session_id: session.session_id,
                err_code: status.code,
                err_message: status.message,
                metadata: Vec::new(),
            },
        };
        let _ = self.send_close(close).await;
        self.session_tx.remove(&session.session_id);
        self.sessions.remove(&session.session_id);
        session.closed.cancel();
    }

    async fn handle_payload(&self, p: Payload) {
        let bytes = match compression::lookup(p.compression) {
            Some(codec) if p.compression != CompressionTag::None => match codec.decompress(&p.bytes) {
                Ok(b) => b,
                Err(e) => {
                    debug!("dropping payload session_id={} (decompress error: {e})", p.session_id);
                    return;
                },
            },
            _ => p.bytes,
        };

        let session_id = p.session_id;
        let cap = self.sessions.get(&session_id).map(|e| e.value().max_payload_size).unwrap_or(DEFAULT_MAX_PAYLOAD);
        if bytes.len() as u32 > cap {
            debug!("dropping oversize payload session_id={session_id} ({} > {cap})", bytes.len());
            return;
        }

        let end_stream = p.end_stream;
        let delivered = Payload { bytes, ..p };

        let Some(tx) = self.session_tx.get(&session_id).map(|e| e.value().clone()) else {
            debug!("payload for unknown/closed session_id={session_id}");
            return;
        };

        if tx.send(delivered).await.is_err() {
            debug!("session_id={session_id} receiver dropped, discarding payload");
        }

        if end_stream {
            self.session_tx.remove(&session_id);
        }
    }

    /// A client-initiated `Close` never gets a reply on the wire from most
    /// protocols, but this one does: the client's own read loop is the only
    /// thing that ever clears its `accepted`/`accepted_tx` bookkeeping for a
    /// session, and it only does that in response to an *inbound* `Close`.
    /// Echoing one back here is what lets a client that initiates its own
    /// close ever see that session torn down on its own side.
    async fn handle_close(&self, c: Close) {
        self.session_tx.remove(&c.session_id);
        self.request_cancel.retain(|(sid, _), _| *sid != c.session_id);
        if let Some((_, session)) = self.sessions.remove(&c.session_id) {
            session.cancel.cancel();
            session.closed.cancel();
            let _ = self.send_close(Close::ok(c.session_id)).await;
        }
    }

    fn handle_cancel(&self, c: Cancel) {
        if let Some((_, token)) = self.request_cancel.remove(&(c.session_id, c.req_id)) {
            token.cancel();
        } else if let Some(session) = self.sessions.get(&c.session_id) {
            session.cancel.cancel();
        }
    }

    async fn handle_ping(&self, p: Ping) {
        let _ = self.write_raw(&Message::Pong(Pong { id: p.id })).await;
    }

    // ---- teardown ----

    fn fail_all(&self, status: RpcStatus) {
        if self.fatal.set(status.clone()).is_err() {
            return;
        }
        self.transport_closed.cancel();

        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
            entry.value().closed.cancel();
        }
        self.sessions.clear();
        self.session_tx.clear();
        self.request_cancel.clear();
    }

    /// Sends `GoAway`, then waits for every in-flight session to finish or
    /// for `ctx` to expire, at which point it forces the connection closed
    /// (§4.10).
    pub async fn graceful_close(&self, ctx: &CallContext) -> Result<(), RpcStatus> {
        let _ = self.send_go_away(self.next_session_id.load(Ordering::SeqCst).saturating_sub(1), "server shutting down").await;
        loop {
            if self.sessions.is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = ctx.done() => {
                    self.fail_all(RpcStatus::unavailable("graceful close deadline exceeded"));
                    return Err(RpcStatus::deadline_exceeded("graceful close timed out with sessions still in flight"));
                }
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
            }
        }
    }

    pub fn close(&self) {
        self.fail_all(RpcStatus::unavailable("connection closed"));
    }
}
