//! Provider backed by an explicit URI list sharing one set of credentials.

use async_trait::async_trait;

use super::{IceServerEntry, IceServerProvider, ProviderError, ProviderServers, RunContext};
use crate::config::ProviderConfig;

pub struct StaticProvider {
    name: String,
    config: ProviderConfig,
}

impl StaticProvider {
    pub fn new(name: &str, config: ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

#[async_trait]
impl IceServerProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ice_servers(&self, _ctx: &RunContext) -> Result<ProviderServers, ProviderError> {
        let servers = self
            .config
            .urls
            .iter()
            .map(|url| {
                IceServerEntry::new(url.clone())
                    .with_credentials(&self.config.username, &self.config.password)
            })
            .collect();
        Ok(ProviderServers {
            servers,
            do_throughput: self.config.do_throughput,
        })
    }
}
