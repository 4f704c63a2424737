// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-to-server stream, single terminal response (§4.4, §4.1 RpcType
//! `Send`). The client iterates `send`; `finish` sends the empty
//! `end_stream` `Payload` the server is waiting for, then the session's
//! terminal `Close`, and returns the handler's final response bytes (the
//! last `Payload` the server emits before closing).

use std::sync::{Arc, atomic::{AtomicU32, Ordering}};

use crate::{
    client::connection::ClientConnection,
    context::CallContext,
    session::ClientSession,
    wire::{
        error::RpcStatus,
        message::{Close, CompressionTag, Descriptor, Metadata, Payload},
    },
};

pub struct SendOnly {
    conn: Arc<ClientConnection>,
    session: Arc<ClientSession>,
    next_req_id: AtomicU32,
}

impl SendOnly {
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

    /// Ends the send stream and waits for the handler's single terminal
    /// response, then closes the session.
    pub async fn finish(&self, ctx: &CallContext) -> Result<Vec<u8>, RpcStatus> {
        self.conn
            .send_payload(Payload {
                session_id: self.session.session_id,
                req_id: 0,
                bytes: Vec::new(),
                end_stream: true,
                compression: CompressionTag::None,
            })
            .await?;

        let result = tokio::select! {
            maybe = self.session.recv() => match maybe {
                Some(p) => Ok(p.bytes),
                None => Err(self.terminal_status()),
            },
            status = ctx.done() => Err(status),
        };

        let _ = self.conn.send_close(Close::ok(self.session.session_id)).await;
        result
    }

    fn terminal_status(&self) -> RpcStatus {
        self.session
            .close_reason()
            .cloned()
            .unwrap_or_else(|| RpcStatus::unavailable("session closed before terminal response"))
    }
}
