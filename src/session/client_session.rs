// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::wire::{
    error::RpcStatus,
    message::{Metadata, Payload, RpcType},
};

/// Client-side view of a session (§3). Created on call begin with `open_id`
/// set and `session_id = 0`; once the matching `OpenAck` lands, the
/// connection's read loop fills in `session_id` and `response_metadata` and
/// moves the entry from `pending` to `accepted`.
#[derive(Debug)]
pub struct ClientSession {
    pub open_id: u32,
    pub session_id: u32,
    pub rpc_type: RpcType,
    pub response_metadata: Metadata,

    recv_rx: Mutex<tokio::sync::mpsc::Receiver<Payload>>,

    /// Fires exactly once: when the receive queue closes, whether because a
    /// final `Payload`/`Close` arrived or the transport died. `close_reason`
    /// is populated before this fires (§3 invariant 2, §8 invariant 2).
    pub closed: CancellationToken,
    close_reason: std::sync::OnceLock<RpcStatus>,

    /// Fires when the caller asks to cancel (§4.2 "Cancellation").
    pub cancel: CancellationToken,

    /// Demultiplexes `Payload`s by `req_id` so multiple concurrent `Call`s
    /// can share one `Synchronous` session (§4.4 "A second concurrent Call
    /// is allowed"). Lazily started by `spawn_demux` the first time a
    /// session is used this way; `Bidirectional`/`Send`/`Recv` sessions
    /// never touch it and consume `recv()` directly instead.
    demux: std::sync::OnceLock<Arc<DashMap<u32, oneshot::Sender<Payload>>>>,
    demux_started: AtomicBool,
}

impl ClientSession {
    pub fn new(
        open_id: u32,
        session_id: u32,
        rpc_type: RpcType,
        response_metadata: Metadata,
        recv_rx: tokio::sync::mpsc::Receiver<Payload>,
    ) -> Self {
        Self {
            open_id,
            session_id,
            rpc_type,
            response_metadata,
            recv_rx: Mutex::new(recv_rx),
            closed: CancellationToken::new(),
            close_reason: std::sync::OnceLock::new(),
            cancel: CancellationToken::new(),
            demux: std::sync::OnceLock::new(),
            demux_started: AtomicBool::new(false),
        }
    }

    fn demux_map(&self) -> Arc<DashMap<u32, oneshot::Sender<Payload>>> {
        self.demux.get_or_init(|| Arc::new(DashMap::new())).clone()
    }

    /// Starts (once) the background task that drains `recv()` and routes
    /// each payload to whichever `Call` registered for its `req_id`. Safe to
    /// call repeatedly — only the first call spawns the task.
    pub fn spawn_demux(self: &Arc<Self>) {
        if self.demux_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(payload) = this.recv().await {
                let req_id = payload.req_id;
                if let Some((_, tx)) = this.demux_map().remove(&req_id) {
                    let _ = tx.send(payload);
                }
            }
        });
    }

    /// Registers interest in the next payload carrying `req_id`. Must be
    /// called after `spawn_demux`.
    pub fn register_waiter(&self, req_id: u32) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        self.demux_map().insert(req_id, tx);
        rx
    }

    pub fn remove_waiter(&self, req_id: u32) {
        self.demux_map().remove(&req_id);
    }

    /// Called by the connection's read loop only (sole producer/closer).
    pub fn set_close_reason(&self, status: RpcStatus) {
        let _ = self.close_reason.set(status);
        self.closed.cancel();
    }

    pub fn close_reason(&self) -> Option<&RpcStatus> {
        self.close_reason.get()
    }

    /// Pulls the next payload, or `None` once the queue has been drained and
    /// closed. Does not itself distinguish a clean end-of-stream from an
    /// error close — callers consult `close_reason()` after `None`.
    pub async fn recv(&self) -> Option<Payload> {
        let mut rx = self.recv_rx.lock().await;
        rx.recv().await
    }

    /// Non-blocking drain of whatever is already buffered, used by the
    /// bidirectional call shape so a context cancel does not discard
    /// in-flight server responses (§4.4).
    pub async fn try_drain(&self) -> Vec<Payload> {
        let mut rx = self.recv_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }
}
