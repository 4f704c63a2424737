// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-to-client stream (§4.4, §4.1 RpcType `Recv`): like `BiDirectional`
//! without `Send`. Shares the same drain-before-terminate cancellation
//! contract.

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    client::connection::ClientConnection,
    context::CallContext,
    session::ClientSession,
    wire::{
        error::RpcStatus,
        message::{Close, Descriptor, Metadata, Payload},
    },
};

pub struct RecvOnly {
    conn: Arc<ClientConnection>,
    session: Arc<ClientSession>,
    buffered: Mutex<VecDeque<Payload>>,
}

impl RecvOnly {
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
            buffered: Mutex::new(VecDeque::new()),
        })
    }

    pub fn response_metadata(&self) -> &Metadata {
        &self.session.response_metadata
    }

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
