//! Central API mode: one request returns the servers for every provider and
//! the node label for this agent.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::json;

use super::{check_status, IceServerEntry, ProviderError, ProviderServers, RunContext};
use crate::config::ProviderConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiProviderEntry {
    #[serde(default)]
    ice_servers: Vec<IceServerEntry>,
    #[serde(default)]
    do_throughput: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ApiBody {
    #[serde(default)]
    providers: BTreeMap<String, ApiProviderEntry>,
    #[serde(default)]
    node: String,
}

/// Decoded central API response.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub node: String,
    /// Keyed and ordered by provider name.
    pub providers: BTreeMap<String, ProviderServers>,
}

impl From<ApiBody> for ApiResponse {
    fn from(body: ApiBody) -> Self {
        let providers = body
            .providers
            .into_iter()
            .map(|(name, entry)| {
                let servers = entry
                    .ice_servers
                    .into_iter()
                    .map(|server| IceServerEntry {
                        urls: server.urls,
                        username: server.username.filter(|u| !u.is_empty()),
                        credential: server.credential.filter(|c| !c.is_empty()),
                    })
                    .collect();
                (
                    name,
                    ProviderServers {
                        servers,
                        do_throughput: entry.do_throughput,
                    },
                )
            })
            .collect();
        Self {
            node: body.node,
            providers,
        }
    }
}

pub struct ApiProvider {
    name: String,
    config: ProviderConfig,
}

impl ApiProvider {
    pub fn new(name: &str, config: ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn fetch(&self, ctx: &RunContext) -> Result<ApiResponse, ProviderError> {
        let response = ctx
            .http
            .post(&self.config.request_url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "testRunID": ctx.test_run_id }))
            .send()
            .await?;
        let body: ApiBody = check_status(response)?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body.into())
    }
}
