// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Hedge policy as a unary client interceptor (§4.5): sends the original
//! immediately, then one speculative retry every `hedge_delay`, up to
//! `max_hedged` extra attempts. First success wins and cancels the rest; a
//! fatal error aborts the remaining hedges immediately; if every attempt
//! fails, the last error observed is returned. Only enabled when
//! `max_hedged > 0` — recommended only for idempotent methods.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    context::CallContext,
    interceptor::chain::{UnaryInterceptor, UnaryInvoker},
    wire::error::RpcStatus,
};

#[derive(Clone)]
pub struct HedgePolicy {
    pub max_hedged: u32,
    pub hedge_delay: Duration,
}

impl Default for HedgePolicy {
    fn default() -> Self {
        Self {
            max_hedged: 0,
            hedge_delay: Duration::from_millis(500),
        }
    }
}

impl HedgePolicy {
    pub fn from_config(cfg: &crate::cfg::config::HedgeConfig) -> Self {
        Self {
            max_hedged: cfg.max_hedged,
            hedge_delay: Duration::from_millis(cfg.hedge_delay_ms),
        }
    }
}

pub struct HedgeInterceptor {
    policy: HedgePolicy,
}

impl HedgeInterceptor {
    pub fn new(policy: HedgePolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl UnaryInterceptor for HedgeInterceptor {
    async fn intercept(
        &self,
        ctx: &CallContext,
        method: &str,
        req: Vec<u8>,
        next: Arc<dyn UnaryInvoker>,
    ) -> Result<Vec<u8>, RpcStatus> {
        if self.policy.max_hedged == 0 {
            return next.invoke(ctx, method, req).await;
        }

        let total = 1 + self.policy.max_hedged as usize;
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, RpcStatus>>(total);
        let abort = CancellationToken::new();

        for i in 0..total {
            let next = next.clone();
            let child_ctx = ctx.child();
            let method = method.to_string();
            let req = req.clone();
            let tx = tx.clone();
            let delay = self.policy.hedge_delay * i as u32;
            let abort_token = abort.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = abort_token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let result = next.invoke(&child_ctx, &method, req).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut last_err: Option<RpcStatus> = None;
        let mut received = 0usize;
        while let Some(result) = rx.recv().await {
            received += 1;
            match result {
                Ok(resp) => {
                    abort.cancel();
                    return Ok(resp);
                },
                Err(status) => {
                    if status.code.is_hedge_fatal() {
                        abort.cancel();
                        return Err(status);
                    }
                    last_err = Some(status);
                    if received == total {
                        break;
                    }
                },
            }
        }
        abort.cancel();
        Err(last_err.unwrap_or_else(|| RpcStatus::internal("hedge: no attempts completed")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::wire::error::ErrorCode;

    struct InstantOk {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl UnaryInvoker for InstantOk {
        async fn invoke(&self, _ctx: &CallContext, _method: &str, req: Vec<u8>) -> Result<Vec<u8>, RpcStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(req)
        }
    }

    #[tokio::test]
    async fn fast_success_observes_single_invocation() {
        let calls = Arc::new(AtomicU32::new(0));
        let invoker: Arc<dyn UnaryInvoker> = Arc::new(InstantOk { calls: calls.clone() });
        let interceptor = HedgeInterceptor::new(HedgePolicy {
            max_hedged: 2,
            hedge_delay: Duration::from_millis(200),
        });
        let ctx = CallContext::new();
        let resp = interceptor.intercept(&ctx, "m", b"x".to_vec(), invoker).await.expect("ok");
        assert_eq!(resp, b"x".to_vec());
        // Give any stray hedge tasks a moment: none should have fired since the
        // original resolved well within hedge_delay.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct AlwaysFatal;

    #[async_trait]
    impl UnaryInvoker for AlwaysFatal {
        async fn invoke(&self, _ctx: &CallContext, _method: &str, _req: Vec<u8>) -> Result<Vec<u8>, RpcStatus> {
            Err(RpcStatus::invalid_argument("bad request"))
        }
    }

    #[tokio::test]
    async fn fatal_error_aborts_without_waiting_for_hedges() {
        let interceptor = HedgeInterceptor::new(HedgePolicy {
            max_hedged: 3,
            hedge_delay: Duration::from_secs(30),
        });
        let ctx = CallContext::new();
        let err = interceptor.intercept(&ctx, "m", b"x".to_vec(), Arc::new(AlwaysFatal)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn disabled_when_max_hedged_zero() {
        let calls = Arc::new(AtomicU32::new(0));
        let invoker: Arc<dyn UnaryInvoker> = Arc::new(InstantOk { calls: calls.clone() });
        let interceptor = HedgeInterceptor::new(HedgePolicy::default());
        let ctx = CallContext::new();
        interceptor.intercept(&ctx, "m", b"x".to_vec(), invoker).await.expect("ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
