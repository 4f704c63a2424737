// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Unary and stream interceptor chains (§4.5). Unary interceptor signature:
//! `(ctx, method, reqBytes, invoker) -> (respBytes, err)` where `invoker`
//! calls the next link, the innermost being the actual RPC. Stream
//! interceptors wrap a `ClientStream` capability set `{ Send, Recv,
//! CloseSend, Err }` rather than a single request/response pair.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{context::CallContext, wire::error::RpcStatus};

/// The next link in a unary chain, or the actual call at the bottom.
#[async_trait]
pub trait UnaryInvoker: Send + Sync {
    async fn invoke(&self, ctx: &CallContext, method: &str, req: Vec<u8>) -> Result<Vec<u8>, RpcStatus>;
}

/// A unary wrapper that can inspect/rewrite the request and response, or
/// decide not to call `next` at all (e.g. a cache hit).
#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: &CallContext,
        method: &str,
        req: Vec<u8>,
        next: Arc<dyn UnaryInvoker>,
    ) -> Result<Vec<u8>, RpcStatus>;
}

struct Link {
    interceptor: Arc<dyn UnaryInterceptor>,
    next: Arc<dyn UnaryInvoker>,
}

#[async_trait]
impl UnaryInvoker for Link {
    async fn invoke(&self, ctx: &CallContext, method: &str, req: Vec<u8>) -> Result<Vec<u8>, RpcStatus> {
        self.interceptor.intercept(ctx, method, req, self.next.clone()).await
    }
}

/// A built unary chain: interceptors compose in declared order, the
/// innermost invoker being the actual call (§4.5).
pub struct Chain {
    head: Arc<dyn UnaryInvoker>,
}

impl Chain {
    pub fn new(interceptors: &[Arc<dyn UnaryInterceptor>], terminal: Arc<dyn UnaryInvoker>) -> Self {
        let mut head = terminal;
        for interceptor in interceptors.iter().rev() {
            head = Arc::new(Link {
                interceptor: interceptor.clone(),
                next: head,
            });
        }
        Self { head }
    }

    pub async fn call(&self, ctx: &CallContext, method: &str, req: Vec<u8>) -> Result<Vec<u8>, RpcStatus> {
        self.head.invoke(ctx, method, req).await
    }
}

/// The capability set a stream call shape exposes to stream interceptors
/// and callers alike (§4.4, §4.5).
#[async_trait]
pub trait ClientStream: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), RpcStatus>;
    async fn recv(&self) -> Option<Result<Vec<u8>, RpcStatus>>;
    async fn close_send(&self) -> Result<(), RpcStatus>;
    fn err(&self) -> Option<RpcStatus>;
}

/// Wraps a just-opened `ClientStream`, e.g. to log every send/recv or
/// enforce a per-message size cap.
pub trait StreamInterceptor: Send + Sync {
    fn wrap(&self, method: &str, inner: Arc<dyn ClientStream>) -> Arc<dyn ClientStream>;
}

/// Applies a list of stream interceptors in declared order, the first
/// declared ending up outermost (mirrors `Chain`'s unary composition).
pub struct StreamChain {
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
}

impl StreamChain {
    pub fn new(interceptors: Vec<Arc<dyn StreamInterceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn wrap(&self, method: &str, inner: Arc<dyn ClientStream>) -> Arc<dyn ClientStream> {
        let mut stream = inner;
        for interceptor in self.interceptors.iter().rev() {
            stream = interceptor.wrap(method, stream);
        }
        stream
    }
}
