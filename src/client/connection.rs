// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    io::{ReadHalf, WriteHalf, split},
    sync::{Mutex, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::ClientConfig,
    context::CallContext,
    session::ClientSession,
    transport::Transport,
    wire::{
        codec,
        compression,
        error::{ErrorCode, RpcStatus},
        message::{Close, Descriptor, Message, Metadata, Open, OpenAck, Payload, Ping, Pong, RpcType},
    },
};

type BoxTransport = Box<dyn Transport>;

struct PendingOpen {
    rpc_type: RpcType,
    recv_tx: tokio::sync::mpsc::Sender<Payload>,
    recv_rx: Option<tokio::sync::mpsc::Receiver<Payload>>,
    ready_tx: Option<oneshot::Sender<Result<Arc<ClientSession>, RpcStatus>>>,
}

const SESSION_QUEUE_DEPTH: usize = 64;

/// One transport; multiplexes many sessions over it (§3, §4.3). Mirrors the
/// teacher's `ClientConnection`: a single reader half and a single writer
/// half, each behind their own mutex, a read loop that is the sole sender on
/// every session's queue, and a write path serialized by one mutex so no two
/// logical messages interleave on the wire.
pub struct ClientConnection {
    reader: Mutex<ReadHalf<BoxTransport>>,
    writer: Mutex<WriteHalf<BoxTransport>>,
    pub cfg: ClientConfig,

    accepted: DashMap<u32, Arc<ClientSession>>,
    accepted_tx: DashMap<u32, tokio::sync::mpsc::Sender<Payload>>,
    pending: DashMap<u32, PendingOpen>,
    next_open_id: AtomicU32,
    next_ping_id: AtomicU64,

    fatal: OnceLock<RpcStatus>,
    pub transport_closed: CancellationToken,
    draining: AtomicBool,
    remote_draining: AtomicBool,

    packing_decided: OnceLock<bool>,
    secure: bool,

    start: Instant,
    last_activity_nanos: AtomicU64,
    pong_waiter: Mutex<Option<(u64, oneshot::Sender<()>)>>,
}

impl ClientConnection {
    pub fn connect(transport: BoxTransport, cfg: ClientConfig) -> Arc<Self> {
        let secure = transport.is_secure();
        let (read, write) = split(transport);
        let conn = Arc::new(Self {
            reader: Mutex::new(read),
            writer: Mutex::new(write),
            cfg,
            accepted: DashMap::new(),
            accepted_tx: DashMap::new(),
            pending: DashMap::new(),
            next_open_id: AtomicU32::new(1),
            next_ping_id: AtomicU64::new(1),
            fatal: OnceLock::new(),
            transport_closed: CancellationToken::new(),
            draining: AtomicBool::new(false),
            remote_draining: AtomicBool::new(false),
            packing_decided: OnceLock::new(),
            secure,
            start: Instant::now(),
            last_activity_nanos: AtomicU64::new(0),
            pong_waiter: Mutex::new(None),
        });

        let reader_task = Arc::clone(&conn);
        tokio::spawn(async move { reader_task.read_loop().await });

        let ping_task = Arc::clone(&conn);
        tokio::spawn(async move { ping_task.ping_loop().await });

        conn
    }

    #[inline]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn fatal_error(&self) -> Option<RpcStatus> {
        self.fatal.get().cloned()
    }

    fn touch_activity(&self) {
        self.last_activity_nanos
            .store(self.start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity_nanos.load(Ordering::Relaxed);
        self.start.elapsed().saturating_sub(Duration::from_nanos(last))
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
        drop(w);
        self.touch_activity();
        Ok(())
    }

    // ---- session open (§4.2) ----

    pub async fn open_session(
        &self,
        descriptor: Descriptor,
        metadata: Metadata,
        ctx: &CallContext,
    ) -> Result<Arc<ClientSession>, RpcStatus> {
        if let Some(status) = self.fatal.get() {
            return Err(status.clone());
        }
        if self.draining.load(Ordering::SeqCst) || self.remote_draining.load(Ordering::SeqCst) {
            return Err(RpcStatus::unavailable("connection is draining"));
        }

        let open_id = self.next_open_id.fetch_add(1, Ordering::SeqCst);
        let (recv_tx, recv_rx) = tokio::sync::mpsc::channel(SESSION_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();

        self.pending.insert(
            open_id,
            PendingOpen {
                rpc_type: descriptor.rpc_type,
                recv_tx,
                recv_rx: Some(recv_rx),
                ready_tx: Some(ready_tx),
            },
        );

        let deadline_ms = ctx.deadline().map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64);

        let open_msg = Message::Open(Open {
            open_id,
            descriptor,
            protocol_major: 1,
            protocol_minor: 0,
            max_payload_size: self.cfg.max_recv_msg_size,
            packing_requested: self.cfg.request_packing,
            deadline_ms,
            metadata: metadata.into_iter().collect(),
        });

        if let Err(status) = self.write_raw(&open_msg).await {
            self.pending.remove(&open_id);
            return Err(status);
        }

        let open_timeout = self.cfg.open_timeout();
        tokio::select! {
            res = ready_rx => {
                match res {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.pending.remove(&open_id);
                        Err(self.fatal.get().cloned().unwrap_or_else(|| RpcStatus::unavailable("connection closed before OpenAck")))
                    }
                }
            }
            _ = tokio::time::sleep(open_timeout) => {
                self.pending.remove(&open_id);
                Err(RpcStatus::deadline_exceeded("timed out waiting for OpenAck"))
            }
            _ = ctx.cancel_token().cancelled() => {
                self.pending.remove(&open_id);
                Err(RpcStatus::canceled("call context canceled before OpenAck"))
            }
        }
    }

    // ---- sending a payload on an established session ----

    pub async fn send_payload(&self, payload: Payload) -> Result<(), RpcStatus> {
        self.write_raw(&Message::Payload(payload)).await
    }

    pub async fn send_close(&self, close: Close) -> Result<(), RpcStatus> {
        self.write_raw(&Message::Close(close)).await
    }

    pub async fn send_cancel(&self, session_id: u32, req_id: u32) -> Result<(), RpcStatus> {
        self.write_raw(&Message::Cancel(crate::wire::message::Cancel { session_id, req_id })).await
    }

    // ---- read loop (§4.3, §5) ----

    async fn read_loop(self: Arc<Self>) {
        loop {
            let read_result = {
                let mut r = self.reader.lock().await;
                codec::read_message(&mut *r).await
            };

            match read_result {
                Ok(Some(msg)) => {
                    self.touch_activity();
                    self.dispatch(msg).await;
                },
                Ok(None) => {
                    self.fail_all(RpcStatus::unavailable("transport closed"));
                    return;
                },
                Err(e) => {
                    warn!("client read loop error: {e}");
                    self.fail_all(RpcStatus::unavailable(format!("read error: {e}")));
                    return;
                },
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::OpenAck(ack) => self.handle_open_ack(ack),
            Message::Payload(p) => self.handle_payload(p).await,
            Message::Close(c) => self.handle_close(c),
            Message::Pong(p) => self.handle_pong(p).await,
            Message::Ping(p) => self.handle_ping(p).await,
            Message::GoAway(g) => self.handle_go_away(g),
            Message::Open(_) | Message::Cancel(_) => {
                debug!("client connection ignoring server-bound message {}", msg.kind());
            },
        }
    }

    fn handle_open_ack(&self, ack: OpenAck) {
        let Some((_, mut pending)) = self.pending.remove(&ack.open_id) else {
            debug!("OpenAck for unknown open_id={}", ack.open_id);
            return;
        };
        let Some(ready_tx) = pending.ready_tx.take() else { return };

        if self.packing_decided.get().is_none() {
            let _ = self.packing_decided.set(ack.packing_agreed);
        }

        if ack.is_rejected() {
            let _ = ready_tx.send(Err(RpcStatus::new(
                if ack.err_code.is_ok() { ErrorCode::Internal } else { ack.err_code },
                ack.err_message,
            )));
            return;
        }

        let recv_rx = pending.recv_rx.take().expect("pending open always carries its receiver");
        let session = Arc::new(ClientSession::new(
            ack.open_id,
            ack.session_id,
            pending.rpc_type,
            ack.metadata.into_iter().collect(),
            recv_rx,
        ));

        self.accepted_tx.insert(ack.session_id, pending.recv_tx);
        self.accepted.insert(ack.session_id, Arc::clone(&session));

        if session.rpc_type == RpcType::Synchronous {
            session.spawn_demux();
        }

        let _ = ready_tx.send(Ok(session));
    }

    async fn handle_payload(&self, p: Payload) {
        let bytes = match compression::lookup(p.compression) {
            Some(codec) if p.compression != crate::wire::message::CompressionTag::None => match codec.decompress(&p.bytes) {
                Ok(b) => b,
                Err(e) => {
                    debug!("dropping payload session_id={} (decompress error: {e})", p.session_id);
                    return;
                },
            },
            _ => p.bytes,
        };

        if bytes.len() as u32 > self.cfg.max_recv_msg_size {
            debug!(
                "dropping oversize payload session_id={} ({} > {})",
                p.session_id,
                bytes.len(),
                self.cfg.max_recv_msg_size
            );
            return;
        }

        let end_stream = p.end_stream;
        let session_id = p.session_id;
        let delivered = Payload {
            bytes,
            ..p
        };

        let Some(tx) = self.accepted_tx.get(&session_id).map(|e| e.value().clone()) else {
            debug!("payload for unknown/closed session_id={session_id}");
            return;
        };

        if tx.send(delivered).await.is_err() {
            debug!("session_id={session_id} receiver dropped, discarding payload");
        }

        if end_stream {
            self.accepted_tx.remove(&session_id);
            if let Some((_, session)) = self.accepted.remove(&session_id) {
                session.set_close_reason(RpcStatus::ok());
            }
        }
    }

    fn handle_close(&self, c: Close) {
        self.accepted_tx.remove(&c.session_id);
        if let Some((_, session)) = self.accepted.remove(&c.session_id) {
            session.set_close_reason(RpcStatus::new(c.err_code, c.err_message));
        }
    }

    async fn handle_pong(&self, p: Pong) {
        let mut waiter = self.pong_waiter.lock().await;
        if let Some((id, _)) = waiter.as_ref() {
            if *id == p.id {
                if let Some((_, tx)) = waiter.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    async fn handle_ping(&self, p: Ping) {
        let _ = self.write_raw(&Message::Pong(Pong { id: p.id })).await;
    }

    fn handle_go_away(&self, g: crate::wire::message::GoAway) {
        warn!("received GoAway (last_session_id={}): {}", g.last_session_id, g.debug_data);
        self.remote_draining.store(true, Ordering::SeqCst);
        self.fail_all(RpcStatus::unavailable(format!("server sent GoAway: {}", g.debug_data)));
    }

    // ---- keepalive (§4.3, §5) ----

    async fn ping_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.transport_closed.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.ping_interval()) => {}
            }
            if self.fatal.get().is_some() {
                return;
            }
            if self.idle_for() < self.cfg.ping_interval() {
                continue;
            }

            // Drain any stale pong waiter before sending a fresh ping.
            {
                let mut waiter = self.pong_waiter.lock().await;
                *waiter = None;
            }

            let id = self.next_ping_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            {
                let mut waiter = self.pong_waiter.lock().await;
                *waiter = Some((id, tx));
            }

            if self.write_raw(&Message::Ping(Ping { id })).await.is_err() {
                return;
            }

            match tokio::time::timeout(self.cfg.ping_timeout(), rx).await {
                Ok(Ok(())) => {},
                _ => {
                    self.fail_all(RpcStatus::deadline_exceeded("keepalive ping timed out"));
                    return;
                },
            }
        }
    }

    // ---- teardown (§4.3, §7) ----

    fn fail_all(&self, status: RpcStatus) {
        if self.fatal.set(status.clone()).is_err() {
            return;
        }
        self.transport_closed.cancel();

        for entry in self.accepted.iter() {
            entry.value().set_close_reason(status.clone());
        }
        self.accepted.clear();
        self.accepted_tx.clear();

        for mut entry in self.pending.iter_mut() {
            if let Some(tx) = entry.value_mut().ready_tx.take() {
                let _ = tx.send(Err(status.clone()));
            }
        }
        self.pending.clear();
    }

    /// Sets `draining=true` so new `open_session` calls fail `Unavailable`,
    /// then waits for every accepted/pending session to finish or for `ctx`
    /// to expire, at which point it forces the connection closed (§4.3).
    pub async fn graceful_close(&self, ctx: &CallContext) -> Result<(), RpcStatus> {
        self.draining.store(true, Ordering::SeqCst);
        loop {
            if self.accepted.is_empty() && self.pending.is_empty() {
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

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst) || self.remote_draining.load(Ordering::SeqCst)
    }

    /// Forces every accepted/pending session closed immediately, skipping
    /// the drain `graceful_close` performs. Used by a `Subconnection`'s
    /// non-graceful `shutdown` (§4.8).
    pub fn close(&self) {
        self.fail_all(RpcStatus::unavailable("connection closed"));
    }
}
