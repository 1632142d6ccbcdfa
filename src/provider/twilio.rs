//! Twilio Network Traversal Service (Tokens API).
//!
//! `request_url` is the account's `Tokens.json` endpoint; `username` and
//! `password` are the account SID and auth token. Twilio lists no TURNS
//! server, but its relays accept TLS on 5349, so one is synthesized from
//! the first TURN host with the token's credentials.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::metered::select;
use super::{
    check_status, IceServerEntry, IceServerProvider, ProviderError, ProviderServers, RunContext,
};
use crate::candidate::{CandidateDescriptor, Protocol, Scheme};
use crate::config::ProviderConfig;

const TURNS_PORT: u16 = 5349;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    ice_servers: Vec<TokenIceServer>,
}

#[derive(Debug, Deserialize)]
struct TokenIceServer {
    #[serde(default)]
    url: String,
    #[serde(default)]
    urls: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    credential: String,
}

impl TokenIceServer {
    fn into_entry(self) -> IceServerEntry {
        let url = if self.url.is_empty() { self.urls } else { self.url };
        IceServerEntry::new(url).with_credentials(&self.username, &self.credential)
    }
}

pub struct TwilioProvider {
    name: String,
    config: ProviderConfig,
}

impl TwilioProvider {
    pub fn new(name: &str, config: ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

#[async_trait]
impl IceServerProvider for TwilioProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ice_servers(&self, ctx: &RunContext) -> Result<ProviderServers, ProviderError> {
        if self.config.username.is_empty() || self.config.password.is_empty() {
            return Err(ProviderError::Config(
                "username (account SID) and password (auth token) are required".into(),
            ));
        }
        let response = ctx
            .http
            .post(&self.config.request_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        let token: TokenResponse = check_status(response)?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(provider = %self.name, returned = token.ice_servers.len(), "twilio token");

        Ok(ProviderServers {
            servers: expand(&self.config, token)?,
            do_throughput: self.config.do_throughput,
        })
    }
}

fn expand(config: &ProviderConfig, token: TokenResponse) -> Result<Vec<IceServerEntry>, ProviderError> {
    let entries = token
        .ice_servers
        .into_iter()
        .map(TokenIceServer::into_entry)
        .collect();
    let mut servers = select(config, entries)?;
    if !config.turn_enabled {
        return Ok(servers);
    }

    let mut turn = None;
    let mut has_turns = false;
    for entry in &servers {
        let descriptor = entry.descriptor()?;
        match descriptor.scheme {
            Scheme::Turn if turn.is_none() => turn = Some(descriptor),
            Scheme::Turns if descriptor.protocol == Protocol::Tls => has_turns = true,
            _ => {}
        }
    }
    if let (Some(turn), false) = (turn, has_turns) {
        let turns = CandidateDescriptor {
            scheme: Scheme::Turns,
            protocol: Protocol::Tls,
            port: TURNS_PORT,
            ..turn
        };
        servers.push(IceServerEntry::new(turns.uri()).with_credentials(&token.username, &token.password));
    }
    Ok(servers)
}
