//! Harness self-test over the loopback engine.
//!
//! Runs three scripted candidates end to end without touching the network
//! and checks that each produced the stats its test mode promises.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::candidate::CandidateDescriptor;
use crate::client::{ClientOptions, RunEnd, RunOutcome, TestClient};
use crate::engine::loopback::{LinkOutcome, LoopbackConfig, LoopbackEngine};
use crate::stats::Stats;

const PROVIDER: &str = "loopback";

/// Run the harness self-test suite.
pub async fn run() -> Result<SelfTestReport> {
    info!("Self-test: driving harness over loopback engine...");

    let mut checks = Vec::new();
    let mut results = Vec::new();

    // 1. STUN connectivity, no data driven
    let outcome = run_case(
        "stun:stun.loopback.test:3478",
        false,
        LoopbackConfig::default(),
    )
    .await?;
    checks.push(check_connectivity(&outcome));
    results.push(outcome.stats);

    // 2. TURN throughput over the simulated relay
    let outcome = run_case(
        "turn:turn.loopback.test:3478?transport=udp",
        true,
        LoopbackConfig::default(),
    )
    .await?;
    checks.push(check_throughput(&outcome));
    results.push(outcome.stats);

    // 3. TURN candidate whose link fails
    let failing = LoopbackConfig {
        outcome: LinkOutcome::Fail {
            after: Duration::from_millis(100),
        },
        ..Default::default()
    };
    let outcome = run_case("turn:turn.loopback.test:3478?transport=tcp", false, failing).await?;
    checks.push(check_failure(&outcome));
    results.push(outcome.stats);

    info!("Self-test complete. {} check(s) run.", checks.len());
    Ok(SelfTestReport { checks, results })
}

#[derive(Debug, Serialize)]
pub struct SelfTestReport {
    pub checks: Vec<CheckResult>,
    pub results: Vec<Stats>,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status == TestStatus::Pass)
    }
}

/// Outcome of a single scenario.
#[derive(Debug, Serialize, Clone)]
pub struct CheckResult {
    pub scenario: String,
    pub status: TestStatus,
    pub details: String,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Pass,
    Fail,
}

async fn run_case(uri: &str, do_throughput: bool, engine: LoopbackConfig) -> Result<RunOutcome> {
    let descriptor = CandidateDescriptor::parse(uri)?.with_credentials(
        Some("selftest".to_string()),
        Some("selftest".to_string()),
    );
    let options = ClientOptions {
        provider: PROVIDER.to_string(),
        node: PROVIDER.to_string(),
        do_throughput,
        answerer_stun_url: "stun:stun.loopback.test:3478".to_string(),
        stun_duration: Duration::from_secs(2),
        turn_duration: Duration::from_secs(3),
        drain_grace: Duration::from_millis(200),
        ..Default::default()
    };
    let client = TestClient::new(Arc::new(LoopbackEngine::new(engine)), descriptor, options);
    Ok(client.run().await)
}

fn check_connectivity(outcome: &RunOutcome) -> CheckResult {
    let stats = &outcome.stats;
    let ok = stats.connected && outcome.end == RunEnd::Completed && stats.throughput.is_empty();
    CheckResult {
        scenario: "STUN connectivity".to_string(),
        status: status(ok),
        details: format!(
            "connected={} in {:.0} ms, end={:?}",
            stats.connected, stats.time_to_connected_state, outcome.end
        ),
    }
}

fn check_throughput(outcome: &RunOutcome) -> CheckResult {
    let stats = &outcome.stats;
    let ok = stats.connected
        && !stats.throughput.is_empty()
        && stats.throughput_max > 0.0
        && stats.answerer_dc_bytes_received_total <= stats.offerer_dc_bytes_sent_total;
    CheckResult {
        scenario: "TURN throughput".to_string(),
        status: status(ok),
        details: format!(
            "{} sample(s), max {:.1} Mbps, {} of {} bytes delivered",
            stats.throughput.len(),
            stats.throughput_max,
            stats.answerer_dc_bytes_received_total,
            stats.offerer_dc_bytes_sent_total
        ),
    }
}

fn check_failure(outcome: &RunOutcome) -> CheckResult {
    let ok = !outcome.stats.connected && outcome.end == RunEnd::Aborted;
    CheckResult {
        scenario: "Failing candidate".to_string(),
        status: status(ok),
        details: format!(
            "connected={}, end={:?} after {} ms",
            outcome.stats.connected,
            outcome.end,
            outcome.elapsed.as_millis()
        ),
    }
}

fn status(ok: bool) -> TestStatus {
    if ok {
        TestStatus::Pass
    } else {
        TestStatus::Fail
    }
}
