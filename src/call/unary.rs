// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `Call(req) -> resp` (§4.4). Allocates a per-call `req_id` so multiple
//! concurrent `Call`s can share one session, demuxed by `ClientSession`'s
//! background router. Exit conditions: matching `req_id` payload; context
//! cancel (sends `Cancel`, returns the context error); transport closed;
//! session closed (`Close` carries error or `ErrorCode::None`).

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

pub struct Unary {
    conn: Arc<ClientConnection>,
    session: Arc<ClientSession>,
    next_req_id: AtomicU32,
}

impl Unary {
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

    pub async fn call(&self, req: Vec<u8>, ctx: &CallContext) -> Result<Vec<u8>, RpcStatus> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let waiter = self.session.register_waiter(req_id);

        self.conn
            .send_payload(Payload {
                session_id: self.session.session_id,
                req_id,
                bytes: req,
                end_stream: false,
                compression: CompressionTag::None,
            })
            .await?;

        tokio::select! {
            received = waiter => {
                match received {
                    Ok(payload) => Ok(payload.bytes),
                    Err(_) => Err(self.terminal_status()),
                }
            }
            status = ctx.done() => {
                self.session.remove_waiter(req_id);
                let _ = self.conn.send_cancel(self.session.session_id, req_id).await;
                Err(status)
            }
            () = self.session.closed.cancelled() => {
                self.session.remove_waiter(req_id);
                Err(self.terminal_status())
            }
        }
    }

    fn terminal_status(&self) -> RpcStatus {
        self.session
            .close_reason()
            .cloned()
            .unwrap_or_else(|| RpcStatus::unavailable("session closed before response"))
    }

    pub async fn close(&self) -> Result<(), RpcStatus> {
        self.conn.send_close(Close::ok(self.session.session_id)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        cfg::config::ClientConfig,
        transport::DuplexTransport,
        wire::message::RpcType,
    };

    #[tokio::test]
    async fn concurrent_calls_are_demuxed_by_req_id() {
        let (client_t, server_t) = DuplexTransport::pair(64 * 1024);
        let client = ClientConnection::connect(Box::new(client_t), ClientConfig::default());

        // Minimal echo "server": just enough wiring to answer Open + two
        // Payloads on the same session, exercising the req_id demux path.
        tokio::spawn(async move {
            use tokio::io::split;
            let (mut r, mut w) = split(server_t);
            let crate::wire::message::Message::Open(open) = crate::wire::codec::read_message(&mut r).await.unwrap().unwrap() else {
                panic!("expected Open");
            };
            crate::wire::codec::write_message(
                &mut w,
                &crate::wire::message::Message::OpenAck(crate::wire::message::OpenAck {
                    open_id: open.open_id,
                    session_id: 7,
                    protocol_major: 1,
                    protocol_minor: 0,
                    err_code: crate::wire::error::ErrorCode::None,
                    err_message: String::new(),
                    packing_agreed: false,
                    metadata: vec![],
                }),
                false,
            )
            .await
            .unwrap();

            for _ in 0..2 {
                let crate::wire::message::Message::Payload(p) = crate::wire::codec::read_message(&mut r).await.unwrap().unwrap() else {
                    panic!("expected Payload");
                };
                let mut echoed = p.bytes.clone();
                echoed.push(b'!');
                crate::wire::codec::write_message(
                    &mut w,
                    &crate::wire::message::Message::Payload(Payload {
                        session_id: 7,
                        req_id: p.req_id,
                        bytes: echoed,
                        end_stream: false,
                        compression: CompressionTag::None,
                    }),
                    false,
                )
                .await
                .unwrap();
            }
        });

        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let unary = Unary::open(
            client,
            Descriptor::new("test", "Echo", "Echo", RpcType::Synchronous),
            Metadata::new(),
            &ctx,
        )
        .await
        .expect("open");

        let (a, b) = tokio::join!(unary.call(b"a".to_vec(), &ctx), unary.call(b"b".to_vec(), &ctx));
        assert_eq!(a.expect("a"), b"a!".to_vec());
        assert_eq!(b.expect("b"), b"b!".to_vec());
    }
}
