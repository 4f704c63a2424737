// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Retry policy as a unary client interceptor (§4.5). Classified-error-based
//! backoff retries: a permanently-retryable error is retried up to
//! `max_attempts` times (total invocations `max_attempts + 1`, §8 invariant
//! 9); a non-retryable error or `max_attempts <= 0` means exactly one
//! invocation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    context::CallContext,
    interceptor::chain::{UnaryInterceptor, UnaryInvoker},
    utils::geometric_backoff,
    wire::error::{ErrorCode, RpcStatus},
};

pub type RetryableFn = Arc<dyn Fn(ErrorCode) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub retryable: Option<RetryableFn>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            retryable: None,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &crate::cfg::config::RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            multiplier: cfg.multiplier,
            retryable: None,
        }
    }

    fn is_retryable(&self, code: ErrorCode) -> bool {
        match &self.retryable {
            Some(f) => f(code),
            None => code.default_retryable(),
        }
    }
}

pub struct RetryInterceptor {
    policy: RetryPolicy,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl UnaryInterceptor for RetryInterceptor {
    async fn intercept(
        &self,
        ctx: &CallContext,
        method: &str,
        req: Vec<u8>,
        next: Arc<dyn UnaryInvoker>,
    ) -> Result<Vec<u8>, RpcStatus> {
        if self.policy.max_attempts == 0 {
            return next.invoke(ctx, method, req).await;
        }

        let mut attempt: u32 = 0;
        loop {
            match next.invoke(ctx, method, req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(status) => {
                    attempt += 1;
                    if attempt > self.policy.max_attempts || !self.is_retryable(status.code) {
                        return Err(status);
                    }
                    let backoff = geometric_backoff(attempt - 1, self.policy.initial_backoff, self.policy.max_backoff, self.policy.multiplier);
                    tokio::select! {
                        reason = ctx.done() => return Err(reason),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                },
            }
        }
    }
}
