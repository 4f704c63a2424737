// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `Address` and `Target` (§3, §4.7, §6): the data the resolver produces and
//! the grammar it parses targets from.

use std::collections::HashMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// One resolved endpoint. `weight == 0` is treated as `1` everywhere it is
/// consumed (§3); `priority == 0` is highest (lowest numeric value wins).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    pub addr: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            weight: 0,
            priority: 0,
            attrs: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// `weight == 0` is normalized to `1` (§3).
    #[inline]
    pub fn effective_weight(&self) -> u32 {
        if self.weight == 0 { 1 } else { self.weight }
    }
}

/// Anything a balancer can select between: subconnections (§4.9) and plain
/// resolved addresses (§4.7) both implement this so `balancer` can stay
/// generic over either.
pub trait Balanced: Send + Sync {
    fn address(&self) -> &Address;
}

impl Balanced for Address {
    fn address(&self) -> &Address {
        self
    }
}

impl<T: Balanced + ?Sized> Balanced for std::sync::Arc<T> {
    fn address(&self) -> &Address {
        (**self).address()
    }
}

/// `scheme://authority/endpoint` (§3, §6). A bare string with no `://` is
/// `scheme=passthrough`, the whole string becomes `endpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    /// Parses the target string grammar (§4.7, §6). Two shortcuts apply
    /// before the general `scheme://authority/endpoint` form is tried:
    /// a bare string (no `://`) becomes `passthrough:///<whole string>`, and
    /// `scheme:///endpoint` (empty authority) is accepted directly. Empty
    /// target, empty scheme, or empty endpoint are errors.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            bail!("empty target string");
        }

        let Some(scheme_split) = raw.find("://") else {
            return Ok(Self {
                scheme: "passthrough".to_string(),
                authority: String::new(),
                endpoint: raw.to_string(),
            });
        };

        let scheme = raw[..scheme_split].to_lowercase();
        if scheme.is_empty() {
            bail!("empty scheme in target {raw:?}");
        }

        let rest = &raw[scheme_split + 3..];
        let (authority, endpoint) = match rest.find('/') {
            Some(slash) => (rest[..slash].to_string(), rest[slash + 1..].to_string()),
            None => (rest.to_string(), String::new()),
        };

        if endpoint.is_empty() {
            bail!("empty endpoint in target {raw:?}");
        }

        Ok(Self {
            scheme,
            authority,
            endpoint,
        })
    }
}
