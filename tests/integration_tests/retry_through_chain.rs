// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use rpcmux::{
    address::{Address, Target},
    cfg::config::{ClientConfig, PoolConfig},
    context::CallContext,
    interceptor::{
        chain::Chain,
        retry::{RetryInterceptor, RetryPolicy},
    },
    pool::Pool,
    server::{Handler, Registry},
    wire::{
        error::{ErrorCode, RpcStatus},
        message::{Descriptor, RpcType},
    },
};

use crate::integration_tests::common::loopback_dialer_factory;

/// Fails the first `fail_times` calls with `Unavailable`, then echoes.
fn flaky_registry(fail_times: u32) -> Registry {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = Registry::new();
    registry
        .register(
            &Descriptor::new("test", "Flaky", "Echo", RpcType::Synchronous),
            Handler::synchronous(move |_ctx, bytes, _meta| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < fail_times {
                        Err(RpcStatus::unavailable("backend not ready yet"))
                    } else {
                        Ok(bytes)
                    }
                })
            }),
        )
        .expect("register");
    registry
}

#[tokio::test]
async fn retry_interceptor_recovers_from_transient_pool_errors() -> Result<()> {
    let target = Target::parse("pooltest:///ignored")?;
    let pool = Pool::from_addresses(
        target,
        vec![Address::new("only")],
        loopback_dialer_factory(Arc::new(flaky_registry(2))),
        ClientConfig::default(),
        PoolConfig {
            health_check_interval_ms: 0,
            ..PoolConfig::default()
        },
    );

    for _ in 0..200 {
        if pool.ready_len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.ready_len(), 1);

    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
        retryable: None,
    };
    let interceptors: Vec<Arc<dyn rpcmux::interceptor::chain::UnaryInterceptor>> = vec![Arc::new(RetryInterceptor::new(policy))];
    let chain = Chain::new(&interceptors, pool);

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let resp = chain.call(&ctx, "test/Flaky/Echo", b"hi".to_vec()).await?;
    assert_eq!(resp, b"hi".to_vec());
    Ok(())
}

#[tokio::test]
async fn retry_interceptor_gives_up_on_a_non_retryable_error() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Bad", "Input", RpcType::Synchronous),
        Handler::synchronous(|_ctx, _bytes, _meta| Box::pin(async move { Err(RpcStatus::invalid_argument("nope")) })),
    )?;
    let target = Target::parse("pooltest:///ignored")?;
    let pool = Pool::from_addresses(
        target,
        vec![Address::new("only")],
        loopback_dialer_factory(Arc::new(registry)),
        ClientConfig::default(),
        PoolConfig {
            health_check_interval_ms: 0,
            ..PoolConfig::default()
        },
    );

    for _ in 0..200 {
        if pool.ready_len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
        retryable: None,
    };
    let interceptors: Vec<Arc<dyn rpcmux::interceptor::chain::UnaryInterceptor>> = vec![Arc::new(RetryInterceptor::new(policy))];
    let chain = Chain::new(&interceptors, pool);

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let err = chain.call(&ctx, "test/Bad/Input", b"x".to_vec()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    Ok(())
}
