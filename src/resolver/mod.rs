// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Target string -> address list (§4.7). A process-wide scheme -> builder
//! registry, guarded by a read-write lock the same way `wire::compression`
//! guards the codec registry (see DESIGN.md, "Global registries"):
//! registration only ever mutates the map and lookup is pure, so init order
//! never matters.

pub mod dns;
pub mod passthrough;

use std::{collections::HashMap, sync::RwLock};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::address::{Address, Target};

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, target: &Target) -> Result<Vec<Address>>;
}

pub trait ResolverBuilder: Send + Sync {
    fn build(&self) -> Box<dyn Resolver>;
}

struct FnBuilder<F>(F);

impl<F> ResolverBuilder for FnBuilder<F>
where F: Fn() -> Box<dyn Resolver> + Send + Sync
{
    fn build(&self) -> Box<dyn Resolver> {
        (self.0)()
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Box<dyn ResolverBuilder>>>> = Lazy::new(|| {
    let mut m: HashMap<String, Box<dyn ResolverBuilder>> = HashMap::new();
    m.insert(
        "passthrough".to_string(),
        Box::new(FnBuilder(|| Box::new(passthrough::PassthroughResolver) as Box<dyn Resolver>)),
    );
    m.insert(
        "dns".to_string(),
        Box::new(FnBuilder(|| Box::new(dns::DnsResolver::default()) as Box<dyn Resolver>)),
    );
    RwLock::new(m)
});

/// Registers (or replaces) the builder for a scheme. Schemes are lowercased
/// (§4.7).
pub fn register_scheme(scheme: &str, builder: Box<dyn ResolverBuilder>) {
    REGISTRY
        .write()
        .expect("resolver registry lock poisoned")
        .insert(scheme.to_lowercase(), builder);
}

pub fn build_for_scheme(scheme: &str) -> Result<Box<dyn Resolver>> {
    let registry = REGISTRY.read().expect("resolver registry lock poisoned");
    let builder = registry
        .get(&scheme.to_lowercase())
        .with_context(|| format!("no resolver registered for scheme {scheme:?}"))?;
    Ok(builder.build())
}

/// Parses `target` and resolves it through the registry entry for its
/// scheme.
pub async fn resolve(raw_target: &str) -> Result<Vec<Address>> {
    let target = Target::parse(raw_target)?;
    let resolver = build_for_scheme(&target.scheme)?;
    let addrs = resolver.resolve(&target).await?;
    if addrs.is_empty() {
        bail!("resolver for scheme {:?} returned no addresses for {raw_target:?}", target.scheme);
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[tokio::test]
    #[serial]
    async fn unknown_scheme_errors() {
        let err = build_for_scheme("no-such-scheme");
        assert!(err.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn passthrough_scheme_is_registered() {
        let r = build_for_scheme("passthrough").expect("passthrough must be registered");
        let t = Target::parse("host:1234").expect("parse");
        let addrs = r.resolve(&t).await.expect("resolve");
        assert_eq!(addrs, vec![Address::new("host:1234")]);
    }
}
