// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use rpcmux::{
    address::{Address, Target},
    cfg::config::{BalancerKind, ClientConfig, PoolConfig},
    context::CallContext,
    pool::Pool,
    server::{Handler, Registry},
    wire::message::{Descriptor, RpcType},
};

use crate::integration_tests::common::loopback_dialer_factory;

#[tokio::test]
async fn weighted_balancer_picks_in_proportion_to_weight() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Echo", "Echo", RpcType::Synchronous),
        Handler::synchronous(|_ctx, bytes, _meta| Box::pin(async move { Ok(bytes) })),
    )?;

    let target = Target::parse("pooltest:///ignored")?;
    let addresses = vec![Address::new("a").with_weight(1), Address::new("b").with_weight(2), Address::new("c").with_weight(3)];
    let pool = Pool::from_addresses(
        target,
        addresses,
        loopback_dialer_factory(Arc::new(registry)),
        ClientConfig::default(),
        PoolConfig {
            health_check_interval_ms: 0,
            balancer: BalancerKind::Weighted,
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

    let mut hits: HashMap<String, u32> = HashMap::new();
    for _ in 0..600 {
        let sc = pool.pick(&CallContext::new(), false).await.expect("ready subconnection");
        *hits.entry(sc.address.addr.clone()).or_insert(0) += 1;
    }

    assert_eq!(*hits.get("a").expect("a picked"), 100);
    assert_eq!(*hits.get("b").expect("b picked"), 200);
    assert_eq!(*hits.get("c").expect("c picked"), 300);
    Ok(())
}
