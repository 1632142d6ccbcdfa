//! Sweep loop: resolve providers, run every candidate, collect results.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::client::{ClientOptions, TestClient};
use crate::config::Config;
use crate::engine::Engine;
use crate::provider::{self, ProviderServers, RunContext};
use crate::report::ReportSink;
use crate::stats::Stats;

/// Identity shared by every candidate tested in one sweep.
#[derive(Debug, Clone)]
pub struct Sweep {
    pub test_run_id: String,
    pub started_at: DateTime<Utc>,
    pub node: String,
}

impl Sweep {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            test_run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            node: node.into(),
        }
    }

    fn client_options(&self, config: &Config, provider: &str, do_throughput: bool) -> ClientOptions {
        ClientOptions {
            provider: provider.to_string(),
            node: self.node.clone(),
            test_run_id: self.test_run_id.clone(),
            test_run_started_at: self.started_at,
            do_throughput,
            answerer_stun_url: config.test.answerer_stun_url.clone(),
            stun_duration: config.test.stun_duration(),
            turn_duration: config.test.turn_duration(),
            drain_grace: config.test.drain_grace(),
        }
    }
}

/// Run one full sweep over every enabled provider.
pub async fn run_all(
    config: &Config,
    engine: Arc<dyn Engine>,
    sink: Option<Arc<dyn ReportSink>>,
) -> Result<Vec<Stats>> {
    let mut sweep = Sweep::new(config.node_id.clone());
    let ctx = RunContext::new(sweep.test_run_id.clone())
        .context("failed to build provider http client")?;

    let resolved = provider::collect(config, &ctx).await;
    if let Some(node) = resolved.node {
        sweep.node = node;
    }

    let span = info_span!("sweep", test_run_id = %sweep.test_run_id, node = %sweep.node);
    Ok(run_providers(config, engine, sink, &sweep, resolved.providers)
        .instrument(span)
        .await)
}

/// Test every server of every provider in order. Runs are sequential so
/// throughput numbers do not compete for the same uplink.
pub async fn run_providers(
    config: &Config,
    engine: Arc<dyn Engine>,
    sink: Option<Arc<dyn ReportSink>>,
    sweep: &Sweep,
    providers: Vec<(String, ProviderServers)>,
) -> Vec<Stats> {
    let mut results = Vec::new();

    for (name, servers) in providers {
        info!(provider = %name, candidates = servers.servers.len(), "testing provider");
        for entry in &servers.servers {
            let descriptor = match entry.descriptor() {
                Ok(d) => d,
                Err(e) => {
                    warn!(provider = %name, urls = ?entry.urls, error = %e, "skipping unparseable server");
                    continue;
                }
            };

            let options = sweep.client_options(config, &name, servers.do_throughput);
            let mut client = TestClient::new(engine.clone(), descriptor, options);
            if let Some(sink) = &sink {
                client = client.with_sink(sink.clone());
            }

            let outcome = client.run().await;
            if let Some(e) = &outcome.error {
                warn!(provider = %name, error = %e, "candidate run reported an error");
            }
            results.push(outcome.stats);
        }
    }

    info!(results = results.len(), "sweep complete");
    results
}

/// Repeat [`run_all`] on the configured interval until Ctrl-C. `on_sweep`
/// receives each sweep's results.
pub async fn run_forever<F>(
    config: &Config,
    engine: Arc<dyn Engine>,
    sink: Option<Arc<dyn ReportSink>>,
    mut on_sweep: F,
) -> Result<()>
where
    F: FnMut(&[Stats]),
{
    let period = config.timer.interval();
    let mut ticker = tokio::time::interval(period);
    info!(interval_secs = period.as_secs(), "timer mode enabled");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_all(config, engine.clone(), sink.clone()).await {
                    Ok(results) => on_sweep(&results),
                    Err(e) => warn!(error = %e, "sweep failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                return Ok(());
            }
        }
    }
}
