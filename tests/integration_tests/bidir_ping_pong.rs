// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use rpcmux::{
    call::bidir::BiDirectional,
    cfg::config::{ClientConfig, ServerConfig},
    context::CallContext,
    server::{Handler, Registry},
    wire::message::{Descriptor, Metadata, RpcType},
};

use crate::integration_tests::common::connect_pair;

#[tokio::test]
async fn bidir_echoes_each_message_with_a_suffix() -> Result<()> {
    let registry = Registry::new();
    registry.register(
        &Descriptor::new("test", "Ping", "Stream", RpcType::BiDirectional),
        Handler::bidirectional(|_ctx, stream, _meta| {
            Box::pin(async move {
                while let Some(bytes) = stream.recv().await {
                    let mut out = bytes;
                    out.extend_from_slice(b"-pong");
                    stream.send(out).await?;
                }
                Ok(())
            })
        }),
    )?;

    let (client, _server) = connect_pair(Arc::new(registry), ClientConfig::default(), ServerConfig::default());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let bidir = BiDirectional::open(client, Descriptor::new("test", "Ping", "Stream", RpcType::BiDirectional), Metadata::new(), &ctx).await?;

    for i in 0..5u8 {
        bidir.send(vec![i]).await?;
        let resp = bidir.recv(&ctx).await.expect("message")?;
        let mut expected = vec![i];
        expected.extend_from_slice(b"-pong");
        assert_eq!(resp, expected);
    }

    bidir.close_send().await?;
    // The handler's recv loop ends once end_stream arrives, so its future
    // returns Ok(()) and the session terminates cleanly.
    assert!(bidir.recv(&ctx).await.is_none());
    bidir.close().await?;
    Ok(())
}
