//! ICE server providers.
//!
//! Every vendor integration sits behind [`IceServerProvider`] and returns the
//! same [`ProviderServers`] shape, so the run loop never branches on which
//! vendor it is talking to.

pub mod api;
pub mod cloudflare;
pub mod generic;
pub mod metered;
pub mod static_list;
pub mod twilio;
pub mod xirsys;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::candidate::{CandidateDescriptor, ParseError};
use crate::config::{Config, ProviderConfig, ProviderKind};

/// Timeout applied to every provider HTTP request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("provider misconfigured: {0}")]
    Config(String),

    #[error("invalid server uri: {0}")]
    Uri(#[from] ParseError),
}

/// One ICE server as handed out by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerEntry {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Attach credentials, treating empty strings as absent.
    pub fn with_credentials(mut self, username: &str, credential: &str) -> Self {
        self.username = non_empty(username);
        self.credential = non_empty(credential);
        self
    }

    /// Parse the first URI into the descriptor a test run uses.
    pub fn descriptor(&self) -> Result<CandidateDescriptor, ParseError> {
        let uri = self.urls.first().map(String::as_str).unwrap_or_default();
        Ok(CandidateDescriptor::parse(uri)?
            .with_credentials(self.username.clone(), self.credential.clone()))
    }
}

/// Servers resolved for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderServers {
    pub servers: Vec<IceServerEntry>,
    pub do_throughput: bool,
}

/// Per-sweep context shared by every provider.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub test_run_id: String,
    pub http: reqwest::Client,
}

impl RunContext {
    pub fn new(test_run_id: impl Into<String>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("iceperf/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            test_run_id: test_run_id.into(),
            http,
        })
    }
}

#[async_trait]
pub trait IceServerProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn ice_servers(&self, ctx: &RunContext) -> Result<ProviderServers, ProviderError>;
}

/// Build the adapter for a single provider entry. The central API is not a
/// single provider and is handled by [`collect`].
pub fn build(name: &str, config: &ProviderConfig) -> Option<Box<dyn IceServerProvider>> {
    let provider: Box<dyn IceServerProvider> = match config.kind {
        ProviderKind::Generic => Box::new(generic::GenericProvider::new(name, config.clone())),
        ProviderKind::Static => Box::new(static_list::StaticProvider::new(name, config.clone())),
        ProviderKind::Metered => Box::new(metered::MeteredProvider::new(name, config.clone())),
        ProviderKind::Cloudflare => {
            Box::new(cloudflare::CloudflareProvider::new(name, config.clone()))
        }
        ProviderKind::Twilio => Box::new(twilio::TwilioProvider::new(name, config.clone())),
        ProviderKind::Xirsys => Box::new(xirsys::XirsysProvider::new(name, config.clone())),
        ProviderKind::Api => return None,
    };
    Some(provider)
}

/// Providers resolved for one sweep.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    /// Location assigned by the central API, if it was used.
    pub node: Option<String>,
    /// Sorted by provider name.
    pub providers: Vec<(String, ProviderServers)>,
}

/// Resolve every enabled provider. When a central API provider is enabled
/// it replaces all others. A failing provider is logged and skipped.
pub async fn collect(config: &Config, ctx: &RunContext) -> Resolved {
    if let Some((name, api_config)) = config
        .enabled_providers()
        .find(|(_, p)| p.kind == ProviderKind::Api)
    {
        let client = api::ApiProvider::new(name, api_config.clone());
        return match client.fetch(ctx).await {
            Ok(response) => {
                info!(
                    provider = %name,
                    node = %response.node,
                    providers = response.providers.len(),
                    "resolved servers from central api"
                );
                Resolved {
                    node: non_empty(&response.node),
                    providers: response.providers.into_iter().collect(),
                }
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "central api request failed");
                Resolved::default()
            }
        };
    }

    let mut providers = Vec::new();
    for (name, provider_config) in config.enabled_providers() {
        let Some(provider) = build(name, provider_config) else {
            continue;
        };
        match provider.ice_servers(ctx).await {
            Ok(servers) => {
                info!(provider = %name, servers = servers.servers.len(), "resolved servers");
                providers.push((name.clone(), servers));
            }
            Err(e) => warn!(provider = %name, error = %e, "failed to resolve servers, skipping"),
        }
    }
    providers.sort_by(|a, b| a.0.cmp(&b.0));
    Resolved {
        node: None,
        providers,
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Accept `urls` as either a single string or a list.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Fail with [`ProviderError::Status`] unless the response is 2xx.
fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Protocol, Scheme};

    #[test]
    fn test_entry_accepts_string_or_list() {
        let single: IceServerEntry =
            serde_json::from_str(r#"{"urls":"stun:stun.example.com:3478"}"#).unwrap();
        assert_eq!(single.urls, vec!["stun:stun.example.com:3478"]);

        let many: IceServerEntry = serde_json::from_str(
            r#"{"urls":["turn:a.example.com:3478","turn:b.example.com:3478"],"username":"u","credential":"p"}"#,
        )
        .unwrap();
        assert_eq!(many.urls.len(), 2);
        assert_eq!(many.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_entry_descriptor_carries_credentials() {
        let entry = IceServerEntry::new("turns:relay.example.com:443?transport=tcp")
            .with_credentials("user", "");
        let d = entry.descriptor().unwrap();
        assert_eq!(d.scheme, Scheme::Turns);
        assert_eq!(d.protocol, Protocol::Tls);
        assert_eq!(d.username.as_deref(), Some("user"));
        assert_eq!(d.credential, None);
    }

    #[test]
    fn test_entry_without_urls_is_rejected() {
        let entry = IceServerEntry {
            urls: vec![],
            username: None,
            credential: None,
        };
        assert!(entry.descriptor().is_err());
    }

    #[test]
    fn test_build_skips_api_kind() {
        let config = ProviderConfig {
            kind: ProviderKind::Api,
            ..Default::default()
        };
        assert!(build("central", &config).is_none());

        let config = ProviderConfig {
            kind: ProviderKind::Static,
            ..Default::default()
        };
        assert_eq!(build("list", &config).unwrap().name(), "list");
    }

    #[tokio::test]
    async fn test_collect_sorts_and_skips_disabled() {
        let mut config = Config::default();
        for (name, url) in [("zeta", "stun:z.example.com"), ("alpha", "stun:a.example.com")] {
            config.providers.insert(
                name.to_string(),
                ProviderConfig {
                    enabled: true,
                    kind: ProviderKind::Static,
                    urls: vec![url.to_string()],
                    ..Default::default()
                },
            );
        }
        config.providers.insert(
            "off".to_string(),
            ProviderConfig {
                kind: ProviderKind::Static,
                urls: vec!["stun:off.example.com".to_string()],
                ..Default::default()
            },
        );

        let ctx = RunContext::new("run").unwrap();
        let resolved = collect(&config, &ctx).await;
        let names: Vec<&str> = resolved.providers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(resolved.node.is_none());
    }
}
