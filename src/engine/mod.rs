//! Peer-connection engine seam.
//!
//! The harness never speaks ICE, DTLS or SCTP itself. It drives an
//! [`Engine`] that creates [`Peer`]s, and each peer reports what happens to
//! it as a stream of [`PeerEvent`]s. Data channels are driven through
//! [`DataChannel`].
//!
//! Two engines ship with the crate: [`rtc::RtcEngine`] (behind the
//! `webrtc-engine` feature) for real servers, and [`loopback::LoopbackEngine`]
//! which simulates a link in-process for the self-test and for tests.

pub mod loopback;
#[cfg(feature = "webrtc-engine")]
pub mod rtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::candidate::{CandidateType, TransportPolicy};

/// Depth of each peer's event queue. Producers wait when it is full.
pub const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create peer connection: {0}")]
    PeerConstruction(String),

    #[error("failed to create data channel: {0}")]
    DataChannel(String),

    #[error("session description error: {0}")]
    Description(String),

    #[error("failed to add ICE candidate: {0}")]
    Candidate(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("data channel closed")]
    ChannelClosed,

    #[error("failed to close: {0}")]
    Close(String),
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// One ICE server entry handed to a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub transport_policy: TransportPolicy,
}

/// Data channel reliability options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInit {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl ChannelInit {
    /// Unordered with zero retransmits, the mode the throughput run uses.
    pub fn unreliable() -> Self {
        Self {
            ordered: false,
            max_retransmits: Some(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Signaling types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in its standard JSON shape
/// (`{"type": "offer", "sdp": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::Description(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Description(e.to_string()))
    }
}

/// A locally gathered candidate, ready to be trickled to the other peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate_type: CandidateType,
    /// SDP `candidate:` attribute line.
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub address: String,
    pub port: u16,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
}

// ---------------------------------------------------------------------------
// State and events
// ---------------------------------------------------------------------------

/// Aggregate connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Everything a peer reports back to the harness.
pub enum PeerEvent {
    /// A local candidate was gathered.
    Candidate(IceCandidate),
    StateChanged(PeerState),
    /// The peer's data channel is open and ready to send.
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage { len: usize },
    ChannelClosed,
    /// Buffered bytes dropped below the low threshold.
    BufferedAmountLow,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Candidate(c) => f.debug_tuple("Candidate").field(&c.candidate_type).finish(),
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            PeerEvent::ChannelOpen(dc) => f.debug_tuple("ChannelOpen").field(&dc.label()).finish(),
            PeerEvent::ChannelMessage { len } => f.debug_struct("ChannelMessage").field("len", len).finish(),
            PeerEvent::ChannelClosed => f.write_str("ChannelClosed"),
            PeerEvent::BufferedAmountLow => f.write_str("BufferedAmountLow"),
        }
    }
}

pub type PeerEvents = mpsc::Receiver<PeerEvent>;

/// Byte counters of a peer's selected ICE transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Application-level byte counters of a data channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Engine: Send + Sync {
    /// Create a peer and the receiving end of its event stream.
    async fn new_peer(&self, config: PeerConfig) -> Result<(Arc<dyn Peer>, PeerEvents), EngineError>;
}

#[async_trait]
pub trait Peer: Send + Sync {
    async fn create_data_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn DataChannel>, EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    fn connection_state(&self) -> PeerState;

    async fn transport_counters(&self) -> TransportCounters;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Queue `data` for sending. Fails once the channel is closed.
    async fn send(&self, data: &Bytes) -> Result<usize, EngineError>;

    /// Bytes queued locally but not yet handed to the transport.
    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    async fn counters(&self) -> ChannelCounters;

    async fn close(&self) -> Result<(), EngineError>;
}
