// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Standard `health/Health/Check` binding (§4.8, §9 "Auxiliary services
//! built on top are specified only as standard method bindings"). The pool's
//! health-check loop calls this RPC against every `READY` subconnection;
//! registering a handler for it on a `Server` is left to the embedder, with
//! `always_serving_handler` provided for tests and simple deployments that
//! have nothing finer-grained to report.

use serde::{Deserialize, Serialize};

use crate::{
    context::CallContext,
    server::handler::Handler,
    wire::message::{Descriptor, Metadata, RpcType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    ServiceUnknown = 3,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthCheckRequest {
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

pub fn descriptor() -> Descriptor {
    Descriptor::new("health", "Health", "Check", RpcType::Synchronous)
}

pub fn encode_request(service: &str) -> Vec<u8> {
    bincode::serialize(&HealthCheckRequest { service: service.to_string() }).unwrap_or_default()
}

pub fn decode_response(bytes: &[u8]) -> Option<HealthCheckResponse> {
    bincode::deserialize(bytes).ok()
}

fn encode_response(status: ServingStatus) -> Vec<u8> {
    bincode::serialize(&HealthCheckResponse { status }).unwrap_or_default()
}

/// A handler that always reports `Serving`.
pub fn always_serving_handler() -> Handler {
    Handler::synchronous(|_ctx: CallContext, _bytes: Vec<u8>, _meta: Metadata| {
        Box::pin(async move { Ok(encode_response(ServingStatus::Serving)) })
    })
}
