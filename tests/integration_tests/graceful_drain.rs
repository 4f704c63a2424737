// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use rpcmux::{
    call::unary::Unary,
    cfg::config::{ClientConfig, ServerConfig},
    context::CallContext,
    server::{Handler, Registry},
    wire::{
        error::ErrorCode,
        message::{Descriptor, Metadata, RpcType},
    },
};

use crate::integration_tests::common::connect_pair;

#[tokio::test]
async fn graceful_close_waits_for_in_flight_call_then_drains() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Slow", "Method", RpcType::Synchronous),
        Handler::synchronous(|_ctx, bytes, _meta| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(bytes)
            })
        }),
    )?;
    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let unary = Unary::open(Arc::clone(&client), Descriptor::new("test", "Slow", "Method", RpcType::Synchronous), Metadata::new(), &ctx).await?;

    // Close the session once its call finishes, the way a well-behaved
    // caller would — `graceful_close` only waits on sessions, it never
    // closes them on the caller's behalf.
    let call_task = tokio::spawn({
        let ctx = ctx.clone();
        async move {
            let resp = unary.call(b"inflight".to_vec(), &ctx).await;
            let _ = unary.close().await;
            resp
        }
    });

    // Give the call a moment to land on the server before draining starts.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let drain_ctx = CallContext::with_timeout(Duration::from_secs(5));
    client.graceful_close(&drain_ctx).await?;

    let resp = call_task.await.expect("call task")?;
    assert_eq!(resp, b"inflight".to_vec());

    // Draining rejects any further attempt to open a new session.
    let err = Unary::open(client, Descriptor::new("test", "Slow", "Method", RpcType::Synchronous), Metadata::new(), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unavailable);
    Ok(())
}

#[tokio::test]
async fn graceful_close_times_out_with_a_stuck_call() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Stuck", "Method", RpcType::Synchronous),
        Handler::synchronous(|_ctx, bytes, _meta| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(bytes)
            })
        }),
    )?;
    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let ctx = CallContext::with_timeout(Duration::from_secs(60));
    let unary = Unary::open(Arc::clone(&client), Descriptor::new("test", "Stuck", "Method", RpcType::Synchronous), Metadata::new(), &ctx).await?;

    let call_task = tokio::spawn({
        let ctx = ctx.clone();
        async move { unary.call(b"stuck".to_vec(), &ctx).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let drain_ctx = CallContext::with_timeout(Duration::from_millis(50));
    let err = client.graceful_close(&drain_ctx).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DeadlineExceeded);

    // The forced close should also unblock the in-flight call.
    let result = call_task.await.expect("call task");
    assert!(result.is_err());
    Ok(())
}
