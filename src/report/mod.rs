//! Delivery of finished results.

pub mod table;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ReportConfig;
use crate::stats::Stats;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("failed to encode stats: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for finalized stats. Delivery failures never fail a run.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, stats: &Stats) -> Result<(), ReportError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ReportSink for NullSink {
    async fn deliver(&self, _stats: &Stats) -> Result<(), ReportError> {
        Ok(())
    }
}

/// POSTs each result as JSON with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    client: reqwest::Client,
    uri: String,
    api_key: String,
}

impl HttpReporter {
    pub fn new(uri: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .user_agent(concat!("iceperf/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            uri: uri.into(),
            api_key: api_key.into(),
        })
    }

    /// Build the reporter the config asks for, or `None` if reporting is off.
    pub fn from_config(config: &ReportConfig) -> Result<Option<Self>, ReportError> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(config.uri.clone(), config.api_key.clone()).map(Some)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl ReportSink for HttpReporter {
    async fn deliver(&self, stats: &Stats) -> Result<(), ReportError> {
        let body = serde_json::to_vec(stats)?;
        let mut request = self
            .client
            .post(&self.uri)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Status(status.as_u16()));
        }
        debug!(status = status.as_u16(), "stats delivered");
        info!(uri = %self.uri, run_id = %stats.run_id, "reported result");
        Ok(())
    }
}
