// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use rpcmux::{
    call::unary::Unary,
    cfg::config::{ClientConfig, MethodConfig, ServerConfig},
    context::CallContext,
    server::{Handler, Registry},
    service_config::ServiceConfig,
    wire::{
        error::ErrorCode,
        message::{Descriptor, Metadata, RpcType},
    },
};

use crate::integration_tests::common::connect_pair;

fn table() -> HashMap<String, MethodConfig> {
    let mut m = HashMap::new();
    m.insert(
        "test/Slow/Method".to_string(),
        MethodConfig {
            timeout_ms: Some(30),
            wait_for_ready: false,
        },
    );
    m
}

#[tokio::test]
async fn service_config_timeout_applies_only_without_a_caller_deadline() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Slow", "Method", RpcType::Synchronous),
        Handler::synchronous(|_ctx, bytes, _meta| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(bytes)
            })
        }),
    )?;
    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let service_config_table = table();
    let descriptor = Descriptor::new("test", "Slow", "Method", RpcType::Synchronous);
    let policy = ServiceConfig::new(&service_config_table).lookup(&descriptor).expect("configured method");

    // No caller deadline: the per-method timeout (30ms) applies and the
    // 200ms handler trips it.
    let bare_ctx = CallContext::new();
    let ctx = bare_ctx.with_fallback_timeout(policy.timeout().expect("timeout configured"));
    let unary = Unary::open(Arc::clone(&client), descriptor.clone(), Metadata::new(), &ctx).await?;
    let err = unary.call(b"x".to_vec(), &ctx).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DeadlineExceeded);

    // Caller already set its own generous deadline: the per-method timeout
    // must not override it, so the 200ms handler completes successfully.
    let generous_ctx = CallContext::with_timeout(Duration::from_secs(5));
    let ctx = generous_ctx.with_fallback_timeout(policy.timeout().expect("timeout configured"));
    let unary = Unary::open(client, descriptor, Metadata::new(), &ctx).await?;
    let resp = unary.call(b"hello".to_vec(), &ctx).await?;
    assert_eq!(resp, b"hello".to_vec());
    Ok(())
}
