//! Per-run measurement accumulator.
//!
//! One [`Stats`] value exists per candidate run. It is mutated by the
//! connection pair and throughput driver while the run is live, finalized
//! once by the test client, and handed to reporting by value afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::candidate::{CandidateDescriptor, CandidateType};

/// Stats shared between the event handlers of one run.
pub type SharedStats = Arc<Mutex<Stats>>;

/// Which side of the connection pair an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Offerer,
    Answerer,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Offerer => "offerer",
            PeerRole::Answerer => "answerer",
        }
    }

    pub fn other(&self) -> PeerRole {
        match self {
            PeerRole::Offerer => PeerRole::Answerer,
            PeerRole::Answerer => PeerRole::Offerer,
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timed candidate arrival.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTiming {
    pub candidate_type: CandidateType,
    pub elapsed_ms: f64,
}

/// One tick of the receive-side sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputSample {
    /// Milliseconds since the data channel opened.
    pub elapsed_ms: u64,
    /// Average throughput since the channel opened.
    pub cumulative_mbps: f64,
    /// Throughput since the previous tick.
    pub instant_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    #[serde(rename = "testRunID")]
    pub test_run_id: String,
    pub run_id: String,
    pub test_run_started_at: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,

    pub provider: String,
    pub scheme: String,
    pub protocol: String,
    pub port: String,
    pub node: String,

    pub offerer_time_to_receive_candidate: f64,
    pub answerer_time_to_receive_candidate: f64,
    pub offerer_candidate_timings: Vec<CandidateTiming>,
    pub answerer_candidate_timings: Vec<CandidateTiming>,
    pub time_to_connected_state: f64,
    pub connected: bool,

    pub offerer_dc_bytes_sent_total: u64,
    pub offerer_ice_transport_bytes_sent_total: u64,
    pub offerer_ice_transport_bytes_received_total: u64,
    pub answerer_dc_bytes_received_total: u64,
    pub answerer_ice_transport_bytes_sent_total: u64,
    pub answerer_ice_transport_bytes_received_total: u64,

    pub latency_first_packet: f64,
    pub throughput: BTreeMap<u64, f64>,
    pub throughput_instant: BTreeMap<u64, f64>,
    pub throughput_max: f64,

    #[serde(skip)]
    failed: bool,
    #[serde(skip)]
    finalized: bool,
}

impl Stats {
    pub fn new(test_run_id: impl Into<String>, test_run_started_at: DateTime<Utc>) -> Self {
        Self {
            test_run_id: test_run_id.into(),
            run_id: String::new(),
            test_run_started_at,
            labels: BTreeMap::new(),
            provider: String::new(),
            scheme: String::new(),
            protocol: String::new(),
            port: String::new(),
            node: String::new(),
            offerer_time_to_receive_candidate: 0.0,
            answerer_time_to_receive_candidate: 0.0,
            offerer_candidate_timings: Vec::new(),
            answerer_candidate_timings: Vec::new(),
            time_to_connected_state: 0.0,
            connected: false,
            offerer_dc_bytes_sent_total: 0,
            offerer_ice_transport_bytes_sent_total: 0,
            offerer_ice_transport_bytes_received_total: 0,
            answerer_dc_bytes_received_total: 0,
            answerer_ice_transport_bytes_sent_total: 0,
            answerer_ice_transport_bytes_received_total: 0,
            latency_first_packet: 0.0,
            throughput: BTreeMap::new(),
            throughput_instant: BTreeMap::new(),
            throughput_max: 0.0,
            failed: false,
            finalized: false,
        }
    }

    pub fn shared(self) -> SharedStats {
        Arc::new(Mutex::new(self))
    }

    pub fn set_run_id(&mut self, run_id: impl Into<String>) {
        self.run_id = run_id.into();
    }

    pub fn set_provider(&mut self, provider: impl Into<String>) {
        self.provider = provider.into();
    }

    pub fn set_node(&mut self, node: impl Into<String>) {
        self.node = node.into();
    }

    /// Flatten the candidate's scheme, protocol and port into the record.
    pub fn set_descriptor(&mut self, descriptor: &CandidateDescriptor) {
        self.scheme = descriptor.scheme.to_string();
        self.protocol = descriptor.protocol.to_string();
        self.port = descriptor.port.to_string();
    }

    /// Record a gathered candidate. Returns `true` if the candidate type is
    /// timed and the metric was updated.
    ///
    /// The scalar time-to-candidate keeps the first timed arrival; every
    /// timed arrival is appended to the per-peer timing list.
    pub fn record_candidate(&mut self, role: PeerRole, kind: CandidateType, elapsed_ms: f64) -> bool {
        if !kind.is_timed() {
            return false;
        }
        let (scalar, timings) = match role {
            PeerRole::Offerer => (
                &mut self.offerer_time_to_receive_candidate,
                &mut self.offerer_candidate_timings,
            ),
            PeerRole::Answerer => (
                &mut self.answerer_time_to_receive_candidate,
                &mut self.answerer_candidate_timings,
            ),
        };
        if timings.is_empty() {
            *scalar = elapsed_ms;
        }
        timings.push(CandidateTiming {
            candidate_type: kind,
            elapsed_ms,
        });
        true
    }

    /// Record time-to-connected. Only the first call takes effect.
    pub fn set_time_to_connected(&mut self, elapsed_ms: f64) -> bool {
        if self.connected || self.failed {
            return false;
        }
        self.time_to_connected_state = elapsed_ms.max(0.0);
        self.connected = true;
        true
    }

    /// A peer reached Failed. The run no longer counts as connected, but a
    /// recorded time-to-connected is kept and never set again.
    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.connected = false;
    }

    pub fn set_latency_first_packet(&mut self, ms: f64) {
        self.latency_first_packet = ms.max(0.0);
    }

    /// Commit offerer byte counters. Counters only grow, so a second commit
    /// never lowers a value recorded earlier.
    pub fn set_offerer_bytes(&mut self, dc_sent: u64, transport_sent: u64, transport_received: u64) {
        raise(&mut self.offerer_dc_bytes_sent_total, dc_sent);
        raise(&mut self.offerer_ice_transport_bytes_sent_total, transport_sent);
        raise(&mut self.offerer_ice_transport_bytes_received_total, transport_received);
    }

    pub fn set_answerer_bytes(&mut self, dc_received: u64, transport_sent: u64, transport_received: u64) {
        raise(&mut self.answerer_dc_bytes_received_total, dc_received);
        raise(&mut self.answerer_ice_transport_bytes_sent_total, transport_sent);
        raise(&mut self.answerer_ice_transport_bytes_received_total, transport_received);
    }

    /// Append a sampler tick. Samples landing in an existing bucket are
    /// summed into it.
    pub fn add_throughput(&mut self, sample: ThroughputSample) {
        self.update_throughput_max(sample.instant_mbps);
        *self.throughput.entry(sample.elapsed_ms).or_insert(0.0) += sample.cumulative_mbps;
        *self
            .throughput_instant
            .entry(sample.elapsed_ms)
            .or_insert(0.0) += sample.instant_mbps;
    }

    /// The maximum only moves up; lower samples are discarded.
    fn update_throughput_max(&mut self, mbps: f64) {
        if mbps.is_nan() || mbps < self.throughput_max {
            return;
        }
        self.throughput_max = mbps;
    }

    /// Attach labels and freeze the record. Returns `false` if the record was
    /// already finalized.
    pub fn finalize(&mut self) -> bool {
        if self.finalized {
            return false;
        }
        self.labels = BTreeMap::from([
            ("provider".to_string(), self.provider.clone()),
            ("scheme".to_string(), self.scheme.clone()),
            ("protocol".to_string(), self.protocol.clone()),
            ("port".to_string(), self.port.clone()),
            ("location".to_string(), self.node.clone()),
        ]);
        self.finalized = true;
        true
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn raise(slot: &mut u64, value: u64) {
    *slot = (*slot).max(value);
}
