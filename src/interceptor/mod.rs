// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Interceptor chains (§4.5): ordered wrappers around unary/stream calls,
//! used on both the client (retry, hedge, user interceptors) and the server
//! (handler-side logging/auth/etc). The same `Chain` type serves both sides
//! since both reduce to "wrap a `(method, bytes) -> bytes` invocation".

pub mod chain;
pub mod hedge;
pub mod retry;

pub use chain::{Chain, ClientStream, StreamChain, StreamInterceptor, UnaryInterceptor, UnaryInvoker};
