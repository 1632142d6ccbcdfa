//! Providers with fixed endpoints, described by host names and
//! per-transport port lists.

use async_trait::async_trait;
use tracing::warn;

use super::{IceServerEntry, IceServerProvider, ProviderError, ProviderServers, RunContext};
use crate::config::ProviderConfig;

pub struct GenericProvider {
    name: String,
    config: ProviderConfig,
}

impl GenericProvider {
    pub fn new(name: &str, config: ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

#[async_trait]
impl IceServerProvider for GenericProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ice_servers(&self, _ctx: &RunContext) -> Result<ProviderServers, ProviderError> {
        Ok(ProviderServers {
            servers: build_entries(&self.config),
            do_throughput: self.config.do_throughput,
        })
    }
}

/// Expand the configured hosts and ports into server entries, STUN first.
///
/// Transports map to schemes as: `udp`/`tcp` plain, `tls` secure over TCP,
/// `dtls` secure over UDP.
pub fn build_entries(config: &ProviderConfig) -> Vec<IceServerEntry> {
    let mut entries = Vec::new();

    if config.stun_enabled && !config.stun_host.is_empty() {
        for (transport, ports) in &config.stun_ports {
            let Some((secure, param)) = transport_mapping(transport) else {
                warn!(transport = %transport, "ignoring unknown stun transport");
                continue;
            };
            let scheme = if secure { "stuns" } else { "stun" };
            for port in ports {
                let mut uri = format!("{scheme}:{}:{port}", bracket(&config.stun_host));
                if !config.stun_use_rfc7094_uri {
                    uri.push_str(&format!("?transport={param}"));
                }
                entries.push(IceServerEntry::new(uri));
            }
        }
    }

    if config.turn_enabled && !config.turn_host.is_empty() {
        for (transport, ports) in &config.turn_ports {
            let Some((secure, param)) = transport_mapping(transport) else {
                warn!(transport = %transport, "ignoring unknown turn transport");
                continue;
            };
            let scheme = if secure { "turns" } else { "turn" };
            for port in ports {
                let uri = format!(
                    "{scheme}:{}:{port}?transport={param}",
                    bracket(&config.turn_host)
                );
                entries.push(
                    IceServerEntry::new(uri).with_credentials(&config.username, &config.password),
                );
            }
        }
    }

    entries
}

fn transport_mapping(transport: &str) -> Option<(bool, &'static str)> {
    match transport.to_ascii_lowercase().as_str() {
        "udp" => Some((false, "udp")),
        "tcp" => Some((false, "tcp")),
        "tls" => Some((true, "tcp")),
        "dtls" => Some((true, "udp")),
        _ => None,
    }
}

fn bracket(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}
