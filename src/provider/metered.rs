//! Metered TURN credentials API.
//!
//! The API returns many URIs, several per transport on special ports. Only
//! the first URI per (scheme, protocol) is kept.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use super::{
    check_status, IceServerEntry, IceServerProvider, ProviderError, ProviderServers, RunContext,
};
use crate::candidate::{CandidateDescriptor, Protocol, Scheme};
use crate::config::ProviderConfig;

pub struct MeteredProvider {
    name: String,
    config: ProviderConfig,
}

impl MeteredProvider {
    pub fn new(name: &str, config: ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

#[async_trait]
impl IceServerProvider for MeteredProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ice_servers(&self, ctx: &RunContext) -> Result<ProviderServers, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::Config("api_key is required".into()));
        }
        let response = ctx
            .http
            .get(&self.config.request_url)
            .query(&[("apiKey", self.config.api_key.as_str())])
            .send()
            .await?;
        let entries: Vec<IceServerEntry> = check_status(response)?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(provider = %self.name, returned = entries.len(), "metered response");

        Ok(ProviderServers {
            servers: select(&self.config, entries)?,
            do_throughput: self.config.do_throughput,
        })
    }
}

/// Keep the first entry per (scheme, protocol), honoring the STUN/TURN
/// switches. An unparseable URI fails the whole provider.
pub fn select(
    config: &ProviderConfig,
    entries: Vec<IceServerEntry>,
) -> Result<Vec<IceServerEntry>, ProviderError> {
    let mut seen: HashSet<(Scheme, Protocol)> = HashSet::new();
    let mut selected = Vec::new();

    for entry in entries {
        let Some(uri) = entry.urls.first() else {
            continue;
        };
        let descriptor = CandidateDescriptor::parse(uri)?;
        let enabled = if descriptor.scheme.is_relay() {
            config.turn_enabled
        } else {
            config.stun_enabled
        };
        if !enabled || !seen.insert((descriptor.scheme, descriptor.protocol)) {
            continue;
        }
        selected.push(entry);
    }
    Ok(selected)
}
