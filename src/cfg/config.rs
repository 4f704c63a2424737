// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::wire::message::CompressionTag;

/// Top-level runtime configuration. Unlike the wire messages, nothing here
/// is negotiated on the wire — it is purely local policy, the way the
/// teacher's `RuntimeConfig` sits beside the wire-visible `LoginConfig`.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub hedge: HedgeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// `pkg/service/method` pattern -> policy (§4.6). Patterns may use `*`
    /// for the service and/or method segment.
    #[serde(default)]
    pub service_config: HashMap<String, MethodConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_max_msg_size")]
    pub max_recv_msg_size: u32,
    #[serde(default = "default_max_msg_size")]
    pub max_send_msg_size: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default)]
    pub default_compression: CompressionTag,
    #[serde(default)]
    pub request_packing: bool,
    /// Whether this client considers its own transport secure. Concrete
    /// transports report this themselves at runtime (`Transport::is_secure`)
    /// — this flag is only a fallback for credentials evaluated before a
    /// transport exists.
    #[serde(default)]
    pub assume_secure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_recv_msg_size: default_max_msg_size(),
            max_send_msg_size: default_max_msg_size(),
            open_timeout_ms: default_open_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            default_compression: CompressionTag::None,
            request_packing: false,
            assume_secure: false,
        }
    }
}

impl ClientConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

const fn default_max_msg_size() -> u32 {
    4 * 1024 * 1024
}

const fn default_open_timeout_ms() -> u64 {
    30_000
}

const fn default_ping_interval_ms() -> u64 {
    30_000
}

const fn default_ping_timeout_ms() -> u64 {
    10_000
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    RoundRobin,
    First,
    Priority,
    Weighted,
    Random,
}

impl Default for BalancerKind {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_connections: u32,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    #[serde(default)]
    pub balancer: BalancerKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            balancer: BalancerKind::default(),
        }
    }
}

impl PoolConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

const fn default_health_check_interval_ms() -> u64 {
    30_000
}

const fn default_health_check_timeout_ms() -> u64 {
    5_000
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

const fn default_initial_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

const fn default_multiplier() -> f64 {
    2.0
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct HedgeConfig {
    #[serde(default)]
    pub max_hedged: u32,
    #[serde(default = "default_hedge_delay_ms")]
    pub hedge_delay_ms: u64,
}

const fn default_hedge_delay_ms() -> u64 {
    500
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub max_concurrent_rpcs: u32,
    #[serde(default)]
    pub allow_packing: bool,
    #[serde(default)]
    pub default_compression: CompressionTag,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_rpcs: 0,
            allow_packing: false,
            default_compression: CompressionTag::None,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

const fn default_drain_timeout_ms() -> u64 {
    5_000
}

/// Per-method policy (§4.6): timeout applied only if the caller's context
/// carries no deadline of its own, and a wait-for-ready override.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default)]
pub struct MethodConfig {
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub wait_for_ready: bool,
}

impl MethodConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl RuntimeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {:?}", path.as_ref()))
    }
}
