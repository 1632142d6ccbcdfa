//! Cloudflare Calls TURN credentials.
//!
//! With a `request_url` the provider mints short-lived credentials over the
//! API; without one it falls back to the configured static hosts.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::generic::build_entries;
use super::{
    check_status, IceServerEntry, IceServerProvider, ProviderError, ProviderServers, RunContext,
};
use crate::candidate::CandidateDescriptor;
use crate::config::ProviderConfig;

/// Credential lifetime requested from the API.
const CREDENTIAL_TTL_SECS: u64 = 86_400;

pub struct CloudflareProvider {
    name: String,
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IceServers {
    One(IceServerEntry),
    Many(Vec<IceServerEntry>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsResponse {
    ice_servers: IceServers,
}

impl CloudflareProvider {
    pub fn new(name: &str, config: ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }

    async fn request(&self, ctx: &RunContext) -> Result<Vec<IceServerEntry>, ProviderError> {
        let response = ctx
            .http
            .post(&self.config.request_url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "ttl": CREDENTIAL_TTL_SECS }))
            .send()
            .await?;
        let body: CredentialsResponse = check_status(response)?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        expand(&self.config, body)
    }
}

#[async_trait]
impl IceServerProvider for CloudflareProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ice_servers(&self, ctx: &RunContext) -> Result<ProviderServers, ProviderError> {
        let servers = if self.config.request_url.is_empty() {
            build_entries(&self.config)
        } else {
            self.request(ctx).await?
        };
        Ok(ProviderServers {
            servers,
            do_throughput: self.config.do_throughput,
        })
    }
}

/// Split multi-URI entries into one entry per URI so each is tested on its
/// own, dropping kinds switched off in config.
fn expand(
    config: &ProviderConfig,
    response: CredentialsResponse,
) -> Result<Vec<IceServerEntry>, ProviderError> {
    let groups = match response.ice_servers {
        IceServers::One(entry) => vec![entry],
        IceServers::Many(entries) => entries,
    };

    let mut servers = Vec::new();
    for group in groups {
        for url in &group.urls {
            let descriptor = CandidateDescriptor::parse(url)?;
            let enabled = if descriptor.scheme.is_relay() {
                config.turn_enabled
            } else {
                config.stun_enabled
            };
            if !enabled {
                continue;
            }
            servers.push(IceServerEntry {
                urls: vec![url.clone()],
                username: group.username.clone().filter(|u| !u.is_empty()),
                credential: group.credential.clone().filter(|c| !c.is_empty()),
            });
        }
    }
    Ok(servers)
}
