//! Xirsys `_turn` channel API.
//!
//! `request_url` is the channel path (`https://global.xirsys.net/_turn/<channel>`);
//! `username` and `password` are the ident and secret. One credential pair
//! covers every returned URI.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::metered::select;
use super::{
    check_status, IceServerEntry, IceServerProvider, ProviderError, ProviderServers, RunContext,
};
use crate::config::ProviderConfig;

/// Credential lifetime requested from the API, in seconds.
const EXPIRE_SECS: &str = "1800";

/// Xirsys reports errors in-band: `{"s": "error", "v": "reason"}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    s: String,
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(rename = "iceServers")]
    ice_servers: IceServers,
}

#[derive(Debug, Deserialize)]
struct IceServers {
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    username: String,
    #[serde(default)]
    credential: String,
}

pub struct XirsysProvider {
    name: String,
    config: ProviderConfig,
}

impl XirsysProvider {
    pub fn new(name: &str, config: ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

#[async_trait]
impl IceServerProvider for XirsysProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ice_servers(&self, ctx: &RunContext) -> Result<ProviderServers, ProviderError> {
        if self.config.username.is_empty() || self.config.password.is_empty() {
            return Err(ProviderError::Config(
                "username (ident) and password (secret) are required".into(),
            ));
        }
        let response = ctx
            .http
            .put(&self.config.request_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&json!({ "format": "urls", "expire": EXPIRE_SECS }))
            .send()
            .await?;
        let envelope: Envelope = check_status(response)?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        let servers = decode(envelope)?;
        debug!(provider = %self.name, returned = servers.urls.len(), "xirsys response");

        let entries = servers
            .urls
            .iter()
            .map(|url| IceServerEntry::new(url).with_credentials(&servers.username, &servers.credential))
            .collect();
        Ok(ProviderServers {
            servers: select(&self.config, entries)?,
            do_throughput: self.config.do_throughput,
        })
    }
}

fn decode(envelope: Envelope) -> Result<IceServers, ProviderError> {
    if envelope.s != "ok" {
        return Err(ProviderError::Decode(format!(
            "xirsys returned {}: {}",
            envelope.s, envelope.v
        )));
    }
    let payload: Payload =
        serde_json::from_value(envelope.v).map_err(|e| ProviderError::Decode(e.to_string()))?;
    Ok(payload.ice_servers)
}
