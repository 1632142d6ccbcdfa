//! iceperf -- connectivity and throughput benchmarking for STUN/TURN relays.
//!
//! For every ICE server a provider hands out, the crate wires an offerer and
//! an answerer peer together in-process, measures candidate gathering,
//! time to connected, first-packet latency and relay throughput, and
//! reports one [`stats::Stats`] record per candidate.

pub mod candidate;
pub mod client;
pub mod config;
pub mod engine;
pub mod provider;
pub mod report;
pub mod runner;
pub mod selftest;
pub mod stats;

use std::sync::Arc;

use anyhow::Result;

use crate::engine::Engine;

/// The engine used for real runs.
#[cfg(feature = "webrtc-engine")]
pub fn default_engine() -> Result<Arc<dyn Engine>> {
    let engine = engine::rtc::RtcEngine::new()?;
    Ok(Arc::new(engine))
}

/// Without the `webrtc-engine` feature only the loopback engine exists.
#[cfg(not(feature = "webrtc-engine"))]
pub fn default_engine() -> Result<Arc<dyn Engine>> {
    anyhow::bail!("built without the webrtc-engine feature; only `self-test` is available")
}
