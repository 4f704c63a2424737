// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Interleaved streaming both ways (§4.4). `Send` pushes a non-terminal
//! `Payload`; `Recv` is a lazy pull over the session's receive queue that
//! stops on `end_stream`/`Close`; `CloseSend` sends an empty `end_stream`
//! `Payload`. On context cancel, `Recv` drains anything already buffered in
//! the queue before yielding termination, so a deadline firing mid-exchange
//! does not discard an in-flight server response.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use tokio::sync::Mutex;

use crate::{
    client::connection::ClientConnection,
    context::CallContext,
    session::ClientSession,
    wire::{
        error::RpcStatus,
        message::{Close, CompressionTag, Descriptor, Metadata, Payload},
    },
};

pub struct BiDirectional {
    conn: Arc<ClientConnection>,
    session: Arc<ClientSession>,
    next_req_id: AtomicU32,
    buffered: Mutex<VecDeque<Payload>>,
}

impl BiDirectional {
    pub async fn open(
        conn: Arc<ClientConnection>,
        descriptor: Descriptor,
        metadata: Metadata,
        ctx: &CallContext,
    ) -> Result<Self, RpcStatus> {
        let session = conn.open_session(descriptor, metadata, ctx).await?;
        Ok(Self {
            conn,
            session,
            next_req_id: AtomicU32::new(1),
            buffered: Mutex::new(VecDeque::new()),
        })
    }

    pub fn response_metadata(&self) -> &Metadata {
        &self.session.response_metadata
    }

    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), RpcStatus> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        self.conn
            .send_payload(Payload {
                session_id: self.session.session_id,
                req_id,
                bytes,
                end_stream: false,
                compression: CompressionTag::None,
            })
            .await
    }

    pub async fn close_send(&self) -> Result<(), RpcStatus> {
        self.conn
            .send_payload(Payload {
                session_id: self.session.session_id,
                req_id: 0,
                bytes: Vec::new(),
                end_stream: true,
                compression: CompressionTag::None,
            })
            .await
    }

    /// Pulls the next message, or `None` at clean end-of-stream. Returns
    /// `Some(Err(..))` on a cancel/deadline or an error `Close`, but only
    /// after any already-buffered payloads have been yielded first.
    pub async fn recv(&self, ctx: &CallContext) -> Option<Result<Vec<u8>, RpcStatus>> {
        if let Some(p) = self.buffered.lock().await.pop_front() {
            return Self::yield_payload(p);
        }

        tokio::select! {
            biased;
            maybe = self.session.recv() => match maybe {
                Some(p) => Self::yield_payload(p),
                None => self.terminal(),
            },
            status = ctx.done() => {
                let drained = self.session.try_drain().await;
                let mut buf = self.buffered.lock().await;
                buf.extend(drained);
                match buf.pop_front() {
                    Some(p) => Self::yield_payload(p),
                    None => Some(Err(status)),
                }
            }
        }
    }

    fn terminal(&self) -> Option<Result<Vec<u8>, RpcStatus>> {
        match self.session.close_reason() {
            Some(status) if status.is_ok() => None,
            Some(status) => Some(Err(status.clone())),
            None => None,
        }
    }

    /// A `Payload` with `end_stream` set is the handler's own end-of-stream
    /// marker (§4.2, §4.10), not a message — it terminates the stream here
    /// rather than being handed to the caller as data.
    fn yield_payload(p: Payload) -> Option<Result<Vec<u8>, RpcStatus>> {
        if p.end_stream { None } else { Some(Ok(p.bytes)) }
    }

    pub async fn close(&self) -> Result<(), RpcStatus> {
        self.conn.send_close(Close::ok(self.session.session_id)).await
    }
}
