// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The handler registry: `pkg/service/method` → `Handler` (§4.2, §9). One
//! registry is shared by every `ServerConnection` a `Server` accepts.

use dashmap::DashMap;

use crate::{server::handler::Handler, wire::message::Descriptor};

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("handler already registered for {0}")]
    AlreadyExists(String),
    #[error("descriptor rpc_type does not match handler shape for {0}")]
    ShapeMismatch(String),
}

/// Read side of a descriptor, without the callback payload — what a
/// reflection/introspection caller would want to list (§9).
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub pkg: String,
    pub service: String,
    pub method: String,
    pub rpc_type: crate::wire::message::RpcType,
}

#[derive(Default)]
pub struct Registry {
    handlers: DashMap<String, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self { handlers: DashMap::new() }
    }

    pub fn register(&self, descriptor: &Descriptor, handler: Handler) -> Result<(), RegisterError> {
        use crate::server::handler::HandlerMeta;
        if handler.rpc_type() != descriptor.rpc_type {
            return Err(RegisterError::ShapeMismatch(descriptor.uri()));
        }
        let key = descriptor.uri();
        match self.handlers.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RegisterError::AlreadyExists(key)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            },
        }
    }

    pub fn lookup(&self, descriptor: &Descriptor) -> Option<Handler> {
        self.handlers.get(&descriptor.uri()).map(|h| h.value().clone())
    }

    /// Lists every registered method, for reflection-style introspection.
    pub fn methods(&self) -> Vec<MethodInfo> {
        use crate::server::handler::HandlerMeta;
        self.handlers
            .iter()
            .map(|entry| {
                let parts: Vec<&str> = entry.key().splitn(3, '/').collect();
                MethodInfo {
                    pkg: parts.first().copied().unwrap_or_default().to_string(),
                    service: parts.get(1).copied().unwrap_or_default().to_string(),
                    method: parts.get(2).copied().unwrap_or_default().to_string(),
                    rpc_type: entry.value().rpc_type(),
                }
            })
            .collect()
    }
}
