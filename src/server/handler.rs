// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Handlers modeled as a tagged variant over the four RPC types (§9 "Dynamic
//! dispatch on handlers"), each wrapping a typed callback that takes a
//! typed stream handle. `enum_dispatch` generates the `HandlerMeta`
//! forwarding across variants so the registry can hold one `Handler` value
//! per registration without a trait-object-per-callback-shape split.

use std::{future::Future, pin::Pin, sync::Arc};

use enum_dispatch::enum_dispatch;

use crate::{
    context::CallContext,
    server::stream::{ServerBiDirStream, ServerRecvStream, ServerSendStream},
    wire::{
        error::RpcStatus,
        message::{Metadata, RpcType},
    },
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type SyncFn = Arc<dyn Fn(CallContext, Vec<u8>, Metadata) -> BoxFuture<Result<Vec<u8>, RpcStatus>> + Send + Sync>;
pub type BiDirFn = Arc<dyn Fn(CallContext, ServerBiDirStream, Metadata) -> BoxFuture<Result<(), RpcStatus>> + Send + Sync>;
pub type SendFn = Arc<dyn Fn(CallContext, ServerSendStream, Metadata) -> BoxFuture<Result<Vec<u8>, RpcStatus>> + Send + Sync>;
pub type RecvFn = Arc<dyn Fn(CallContext, ServerRecvStream, Metadata) -> BoxFuture<Result<(), RpcStatus>> + Send + Sync>;

#[enum_dispatch]
pub trait HandlerMeta {
    fn rpc_type(&self) -> RpcType;
}

#[derive(Clone)]
pub struct SyncHandler(pub SyncFn);

impl HandlerMeta for SyncHandler {
    fn rpc_type(&self) -> RpcType {
        RpcType::Synchronous
    }
}

#[derive(Clone)]
pub struct BiDirHandler(pub BiDirFn);

impl HandlerMeta for BiDirHandler {
    fn rpc_type(&self) -> RpcType {
        RpcType::BiDirectional
    }
}

#[derive(Clone)]
pub struct SendHandler(pub SendFn);

impl HandlerMeta for SendHandler {
    fn rpc_type(&self) -> RpcType {
        RpcType::Send
    }
}

#[derive(Clone)]
pub struct RecvHandler(pub RecvFn);

impl HandlerMeta for RecvHandler {
    fn rpc_type(&self) -> RpcType {
        RpcType::Recv
    }
}

#[enum_dispatch(HandlerMeta)]
#[derive(Clone)]
pub enum Handler {
    Sync(SyncHandler),
    BiDir(BiDirHandler),
    Send(SendHandler),
    Recv(RecvHandler),
}

impl Handler {
    pub fn synchronous<F>(f: F) -> Self
    where F: Fn(CallContext, Vec<u8>, Metadata) -> BoxFuture<Result<Vec<u8>, RpcStatus>> + Send + Sync + 'static {
        Handler::Sync(SyncHandler(Arc::new(f)))
    }

    pub fn bidirectional<F>(f: F) -> Self
    where F: Fn(CallContext, ServerBiDirStream, Metadata) -> BoxFuture<Result<(), RpcStatus>> + Send + Sync + 'static {
        Handler::BiDir(BiDirHandler(Arc::new(f)))
    }

    pub fn send_stream<F>(f: F) -> Self
    where F: Fn(CallContext, ServerSendStream, Metadata) -> BoxFuture<Result<Vec<u8>, RpcStatus>> + Send + Sync + 'static {
        Handler::Send(SendHandler(Arc::new(f)))
    }

    pub fn recv_stream<F>(f: F) -> Self
    where F: Fn(CallContext, ServerRecvStream, Metadata) -> BoxFuture<Result<(), RpcStatus>> + Send + Sync + 'static {
        Handler::Recv(RecvHandler(Arc::new(f)))
    }
}
