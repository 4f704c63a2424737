// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use rpcmux::{
    call::{recv_only::RecvOnly, send_only::SendOnly},
    cfg::config::{ClientConfig, ServerConfig},
    context::CallContext,
    server::{Handler, Registry},
    wire::message::{Descriptor, Metadata, RpcType},
};

use crate::integration_tests::common::connect_pair;

#[tokio::test]
async fn send_stream_sums_then_returns_one_terminal_response() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Sum", "Upload", RpcType::Send),
        Handler::send_stream(|_ctx, stream, _meta| {
            Box::pin(async move {
                let mut total: u64 = 0;
                while let Some(bytes) = stream.recv().await {
                    total += bytes.first().copied().unwrap_or(0) as u64;
                }
                Ok(total.to_le_bytes().to_vec())
            })
        }),
    )?;

    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let upload = SendOnly::open(client, Descriptor::new("test", "Sum", "Upload", RpcType::Send), Metadata::new(), &ctx).await?;

    for n in [1u8, 2, 3, 4] {
        upload.send(vec![n]).await?;
    }
    let resp = upload.finish(&ctx).await?;
    let total = u64::from_le_bytes(resp.try_into().expect("8 bytes"));
    assert_eq!(total, 10);
    Ok(())
}

#[tokio::test]
async fn recv_stream_yields_every_pushed_message_then_ends() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Countdown", "Download", RpcType::Recv),
        Handler::recv_stream(|_ctx, stream, _meta| {
            Box::pin(async move {
                for n in (0..5u8).rev() {
                    stream.send(vec![n]).await?;
                }
                Ok(())
            })
        }),
    )?;

    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let download = RecvOnly::open(client, Descriptor::new("test", "Countdown", "Download", RpcType::Recv), Metadata::new(), &ctx).await?;

    let mut seen = Vec::new();
    while let Some(msg) = download.recv(&ctx).await {
        seen.push(msg?[0]);
    }
    assert_eq!(seen, vec![4, 3, 2, 1, 0]);
    download.close().await?;
    Ok(())
}
