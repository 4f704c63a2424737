// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-(pkg, service, method) policy lookup (§4.6): timeout and
//! wait-for-ready with wildcard fallback. Patterns are matched in order of
//! specificity; the first match wins. A miss means "not found", and
//! `lookup` never invents a default timeout for it.

use crate::{cfg::config::MethodConfig, wire::message::Descriptor};

/// A method-pattern -> policy table, keyed the way `RuntimeConfig::service_config`
/// stores it: `"pkg/service/method"`, with `*` allowed in the service and/or
/// method segment.
pub struct ServiceConfig<'a> {
    table: &'a std::collections::HashMap<String, MethodConfig>,
}

impl<'a> ServiceConfig<'a> {
    pub fn new(table: &'a std::collections::HashMap<String, MethodConfig>) -> Self {
        Self { table }
    }

    /// Looks up the most specific matching pattern for `descriptor`, trying
    /// exact -> service wildcard -> package wildcard -> global, in that
    /// order (§4.6, §8 invariant 8).
    pub fn lookup(&self, descriptor: &Descriptor) -> Option<MethodConfig> {
        let candidates = [
            format!("{}/{}/{}", descriptor.pkg, descriptor.service, descriptor.method),
            format!("{}/{}/*", descriptor.pkg, descriptor.service),
            format!("{}/*/*", descriptor.pkg),
            "*/*/*".to_string(),
        ];
        candidates.iter().find_map(|pattern| self.table.get(pattern).copied())
    }
}

/// Resolves whether `wait_for_ready` should be honored for this call:
/// a truthy config-level value overrides a falsey per-call value (§4.6).
pub fn effective_wait_for_ready(config: Option<&MethodConfig>, per_call: bool) -> bool {
    match config {
        Some(c) if c.wait_for_ready => true,
        _ => per_call,
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use super::*;
    use crate::wire::message::RpcType;

    fn table() -> HashMap<String, MethodConfig> {
        let mut m = HashMap::new();
        m.insert(
            "test/Svc/Slow".to_string(),
            MethodConfig {
                timeout_ms: Some(50),
                wait_for_ready: false,
            },
        );
        m.insert(
            "test/Svc/*".to_string(),
            MethodConfig {
                timeout_ms: Some(200),
                wait_for_ready: false,
            },
        );
        m.insert(
            "test/*/*".to_string(),
            MethodConfig {
                timeout_ms: Some(1000),
                wait_for_ready: false,
            },
        );
        m.insert(
            "*/*/*".to_string(),
            MethodConfig {
                timeout_ms: Some(5000),
                wait_for_ready: true,
            },
        );
        m
    }

    fn descriptor(pkg: &str, service: &str, method: &str) -> Descriptor {
        Descriptor::new(pkg, service, method, RpcType::Synchronous)
    }

    #[test]
    fn exact_match_wins() {
        let t = table();
        let sc = ServiceConfig::new(&t);
        let cfg = sc.lookup(&descriptor("test", "Svc", "Slow")).expect("match");
        assert_eq!(cfg.timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn falls_back_to_service_wildcard() {
        let t = table();
        let sc = ServiceConfig::new(&t);
        let cfg = sc.lookup(&descriptor("test", "Svc", "Other")).expect("match");
        assert_eq!(cfg.timeout(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn falls_back_to_package_wildcard() {
        let t = table();
        let sc = ServiceConfig::new(&t);
        let cfg = sc.lookup(&descriptor("test", "OtherSvc", "M")).expect("match");
        assert_eq!(cfg.timeout(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn falls_back_to_global() {
        let t = table();
        let sc = ServiceConfig::new(&t);
        let cfg = sc.lookup(&descriptor("other", "X", "Y")).expect("match");
        assert_eq!(cfg.timeout(), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn no_match_is_none() {
        let empty = HashMap::new();
        let sc = ServiceConfig::new(&empty);
        assert!(sc.lookup(&descriptor("a", "b", "c")).is_none());
    }

    #[test]
    fn config_wait_for_ready_overrides_falsey_per_call() {
        let mut m = HashMap::new();
        m.insert(
            "*/*/*".to_string(),
            MethodConfig {
                timeout_ms: None,
                wait_for_ready: true,
            },
        );
        let cfg = m.get("*/*/*").copied();
        assert!(effective_wait_for_ready(cfg.as_ref(), false));
        assert!(!effective_wait_for_ready(None, false));
        assert!(effective_wait_for_ready(None, true));
    }
}
