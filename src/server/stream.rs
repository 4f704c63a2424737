// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed stream handles handed to streaming handlers (§9), one shape per
//! streaming `RpcType`: `BiDirectional` gets send+recv, `Send` (client
//! streams in) gets recv-only, `Recv` (server streams out) gets send-only.
//! Each wraps the `ServerSession` plus the connection's serialized write
//! path.

use std::sync::Arc;

use crate::{
    server::connection::ServerConnection,
    session::ServerSession,
    wire::{
        error::RpcStatus,
        message::{CompressionTag, Payload},
    },
};

pub struct ServerBiDirStream {
    pub(crate) conn: Arc<ServerConnection>,
    pub(crate) session: Arc<ServerSession>,
}

impl ServerBiDirStream {
    pub fn new(conn: Arc<ServerConnection>, session: Arc<ServerSession>) -> Self {
        Self { conn, session }
    }

    pub fn request_metadata(&self) -> &crate::wire::message::Metadata {
        &self.session.request_metadata
    }

    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), RpcStatus> {
        self.conn
            .send_payload(Payload {
                session_id: self.session.session_id,
                req_id: 0,
                bytes,
                end_stream: false,
                compression: CompressionTag::None,
            })
            .await
    }

    /// `None` at clean end-of-stream (the client's `end_stream` marker, or
    /// the queue closing) or cancellation.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            maybe = self.session.recv() => match maybe {
                Some(p) if p.end_stream => None,
                Some(p) => Some(p.bytes),
                None => None,
            },
            _ = self.session.cancel.cancelled() => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.cancel.is_cancelled()
    }
}

pub struct ServerSendStream {
    pub(crate) session: Arc<ServerSession>,
}

impl ServerSendStream {
    pub fn new(session: Arc<ServerSession>) -> Self {
        Self { session }
    }

    pub fn request_metadata(&self) -> &crate::wire::message::Metadata {
        &self.session.request_metadata
    }

    /// `None` once the client's `end_stream` `Payload` has arrived, or on
    /// cancellation.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            maybe = self.session.recv() => match maybe {
                Some(p) if p.end_stream => None,
                Some(p) => Some(p.bytes),
                None => None,
            },
            _ = self.session.cancel.cancelled() => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.cancel.is_cancelled()
    }
}

pub struct ServerRecvStream {
    pub(crate) conn: Arc<ServerConnection>,
    pub(crate) session: Arc<ServerSession>,
}

impl ServerRecvStream {
    pub fn new(conn: Arc<ServerConnection>, session: Arc<ServerSession>) -> Self {
        Self { conn, session }
    }

    pub fn request_metadata(&self) -> &crate::wire::message::Metadata {
        &self.session.request_metadata
    }

    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), RpcStatus> {
        self.conn
            .send_payload(Payload {
                session_id: self.session.session_id,
                req_id: 0,
                bytes,
                end_stream: false,
                compression: CompressionTag::None,
            })
            .await
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.cancel.is_cancelled()
    }
}
