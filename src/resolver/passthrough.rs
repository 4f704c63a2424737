// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The passthrough resolver (§4.7): returns `[{ addr: endpoint }]` verbatim,
//! no actual lookup performed.

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    address::{Address, Target},
    resolver::Resolver,
};

pub struct PassthroughResolver;

#[async_trait]
impl Resolver for PassthroughResolver {
    async fn resolve(&self, target: &Target) -> Result<Vec<Address>> {
        Ok(vec![Address::new(target.endpoint.clone())])
    }
}
