// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DNS resolver (§4.7): resolves `host[:port]` to A/AAAA records, or, when
//! configured for SRV, looks up `_service._proto.host` first and falls back
//! to A/AAAA on error.

use std::net::IpAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::{TokioAsyncResolver, config::ResolverConfig};

use crate::{
    address::{Address, Target},
    resolver::Resolver,
};

const DEFAULT_PORT: &str = "443";

/// SRV lookup parameters (`_service._proto.endpoint`), disabled by default —
/// most targets resolve straight to A/AAAA.
#[derive(Debug, Clone, Default)]
pub struct SrvQuery {
    pub service: String,
    pub proto: String,
}

#[derive(Clone)]
pub struct DnsResolver {
    srv: Option<SrvQuery>,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self { srv: None }
    }
}

impl DnsResolver {
    pub fn with_srv(service: impl Into<String>, proto: impl Into<String>) -> Self {
        Self {
            srv: Some(SrvQuery {
                service: service.into(),
                proto: proto.into(),
            }),
        }
    }

    fn split_host_port(endpoint: &str) -> (String, String) {
        match endpoint.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
                (host.to_string(), port.to_string())
            },
            _ => (endpoint.to_string(), DEFAULT_PORT.to_string()),
        }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, target: &Target) -> Result<Vec<Address>> {
        let (host, port) = Self::split_host_port(&target.endpoint);

        // Already a literal IP: return it verbatim, no lookup needed (§4.7).
        if host.parse::<IpAddr>().is_ok() {
            return Ok(vec![Address::new(format!("{host}:{port}"))]);
        }

        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .or_else(|_| TokioAsyncResolver::tokio(ResolverConfig::default(), Default::default()))
            .context("constructing DNS resolver")?;

        if let Some(srv) = &self.srv {
            let name = format!("_{}._{}.{}", srv.service, srv.proto, host);
            match resolver.srv_lookup(name.clone()).await {
                Ok(lookup) => {
                    let mut out = Vec::new();
                    for record in lookup.iter() {
                        out.push(
                            Address::new(format!("{}:{}", record.target().to_string().trim_end_matches('.'), record.port()))
                                .with_priority(record.priority() as u32)
                                .with_weight(record.weight() as u32),
                        );
                    }
                    if !out.is_empty() {
                        return Ok(out);
                    }
                },
                Err(e) => {
                    tracing::debug!("SRV lookup for {name:?} failed, falling back to A/AAAA: {e}");
                },
            }
        }

        let lookup = resolver.lookup_ip(host.clone()).await.with_context(|| format!("A/AAAA lookup for {host:?}"))?;
        let out: Vec<Address> = lookup.iter().map(|ip| Address::new(format!("{ip}:{port}"))).collect();
        if out.is_empty() {
            anyhow::bail!("DNS lookup for {host:?} returned no records");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(
            DnsResolver::split_host_port("example.com:8080"),
            ("example.com".to_string(), "8080".to_string())
        );
    }

    #[test]
    fn missing_port_uses_default() {
        assert_eq!(DnsResolver::split_host_port("example.com"), ("example.com".to_string(), DEFAULT_PORT.to_string()));
    }

    #[tokio::test]
    async fn literal_ip_returned_verbatim() {
        let r = DnsResolver::default();
        let t = Target::parse("dns:///127.0.0.1:9000").expect("parse");
        let addrs = r.resolve(&t).await.expect("resolve");
        assert_eq!(addrs, vec![Address::new("127.0.0.1:9000")]);
    }
}
