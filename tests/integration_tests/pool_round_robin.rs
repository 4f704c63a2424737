// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use rpcmux::{
    address::{Address, Target},
    call::unary::Unary,
    cfg::config::{ClientConfig, PoolConfig},
    context::CallContext,
    pool::Pool,
    server::{Handler, Registry},
    wire::message::{Descriptor, Metadata, RpcType},
};

use crate::integration_tests::common::loopback_dialer_factory;

#[tokio::test]
async fn pool_distributes_calls_evenly_across_subconnections() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Echo", "Echo", RpcType::Synchronous),
        Handler::synchronous(|_ctx, bytes, _meta| Box::pin(async move { Ok(bytes) })),
    )?;

    let target = Target::parse("pooltest:///ignored")?;
    let addresses = vec![Address::new("a"), Address::new("b"), Address::new("c")];
    let pool = Pool::from_addresses(
        target,
        addresses,
        loopback_dialer_factory(Arc::new(registry)),
        ClientConfig::default(),
        PoolConfig {
            health_check_interval_ms: 0,
            ..PoolConfig::default()
        },
    );

    for _ in 0..200 {
        if pool.ready_len() == pool.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.ready_len(), 3);

    let descriptor = Descriptor::new("test", "Echo", "Echo", RpcType::Synchronous);
    let mut hits: HashMap<String, u32> = HashMap::new();
    for _ in 0..60 {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let sc = pool.pick(&ctx, false).await.expect("ready subconnection");
        *hits.entry(sc.address.addr.clone()).or_insert(0) += 1;

        let conn = sc.client_connection().expect("subconnection should be ready");
        let unary = Unary::open(conn, descriptor.clone(), Metadata::new(), &ctx).await?;
        let resp = unary.call(b"ping".to_vec(), &ctx).await?;
        assert_eq!(resp, b"ping");
        unary.close().await?;
    }

    assert_eq!(hits.len(), 3);
    for (addr, count) in &hits {
        assert_eq!(*count, 20, "address {addr} should have been visited exactly 20 times");
    }

    pool.graceful_close(&CallContext::with_timeout(Duration::from_secs(5))).await?;
    Ok(())
}
