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
async fn unary_echo_round_trips() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Echo", "Echo", RpcType::Synchronous),
        Handler::synchronous(|_ctx, bytes, _meta| Box::pin(async move { Ok(bytes) })),
    )?;

    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let unary = Unary::open(client, Descriptor::new("test", "Echo", "Echo", RpcType::Synchronous), Metadata::new(), &ctx).await?;

    let resp = unary.call(b"hello".to_vec(), &ctx).await?;
    assert_eq!(resp, b"hello".to_vec());

    // Synchronous sessions are repeatable: a second call on the same
    // session should route back through the same dispatch loop.
    let resp2 = unary.call(b"again".to_vec(), &ctx).await?;
    assert_eq!(resp2, b"again".to_vec());

    unary.close().await?;
    Ok(())
}

#[tokio::test]
async fn unary_unregistered_method_is_unimplemented() -> Result<()> {
    let registry = Registry::new();
    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let err = Unary::open(client, Descriptor::new("test", "Missing", "Method", RpcType::Synchronous), Metadata::new(), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unimplemented);
    Ok(())
}

#[tokio::test]
async fn unary_handler_error_surfaces_and_closes_session() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Failing", "Method", RpcType::Synchronous),
        Handler::synchronous(|_ctx, _bytes, _meta| Box::pin(async move { Err(rpcmux::wire::error::RpcStatus::invalid_argument("bad input")) })),
    )?;
    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let unary = Unary::open(client, Descriptor::new("test", "Failing", "Method", RpcType::Synchronous), Metadata::new(), &ctx).await?;

    let err = unary.call(b"x".to_vec(), &ctx).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    Ok(())
}
