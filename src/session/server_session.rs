// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::wire::message::{Descriptor, Metadata, Payload};

/// Server-side view of a session (§3): adds the descriptor and the
/// triggering `Open`'s metadata on top of the client-side shape. The
/// registered handler itself is looked up once and driven by
/// `server::connection`, not stored here.
#[derive(Debug)]
pub struct ServerSession {
    pub session_id: u32,
    pub descriptor: Descriptor,
    pub request_metadata: Metadata,
    /// `Open.max_payload_size` as advertised by the client opening this
    /// session, reused as the server's own receive-side cap for it (§6).
    pub max_payload_size: u32,

    recv_rx: Mutex<tokio::sync::mpsc::Receiver<Payload>>,

    /// Fires when `Cancel` arrives or the transport dies — closes the
    /// receive queue and signals the handler loop to exit (§4.2
    /// "Cancellation").
    pub cancel: CancellationToken,
    /// Fires once this session's recv queue has been fully torn down.
    pub closed: CancellationToken,
}

impl ServerSession {
    pub fn new(
        session_id: u32,
        descriptor: Descriptor,
        request_metadata: Metadata,
        max_payload_size: u32,
        recv_rx: tokio::sync::mpsc::Receiver<Payload>,
    ) -> Self {
        Self {
            session_id,
            descriptor,
            request_metadata,
            max_payload_size,
            recv_rx: Mutex::new(recv_rx),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    pub async fn recv(&self) -> Option<Payload> {
        let mut rx = self.recv_rx.lock().await;
        rx.recv().await
    }
}
