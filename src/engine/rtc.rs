//! Engine backed by the `webrtc` crate.
//!
//! Callbacks registered on the peer connection and data channel forward
//! into the peer's event queue. The queue's sender lives in an
//! [`EventSink`] that `close` empties, so the harness sees the event stream
//! end even though the connection keeps its handlers alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use super::{
    ChannelCounters, ChannelInit, DataChannel, Engine, EngineError, IceCandidate, Peer, PeerConfig,
    PeerEvent, PeerEvents, PeerState, SdpKind, SessionDescription, TransportCounters,
    EVENT_QUEUE_DEPTH,
};
use crate::candidate::{CandidateType, TransportPolicy};

pub struct RtcEngine {
    api: API,
}

impl RtcEngine {
    pub fn new() -> Result<Self, EngineError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| EngineError::PeerConstruction(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| EngineError::PeerConstruction(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl Engine for RtcEngine {
    async fn new_peer(&self, config: PeerConfig) -> Result<(Arc<dyn Peer>, PeerEvents), EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .into_iter()
                .map(|server| RTCIceServer {
                    urls: server.urls,
                    username: server.username.unwrap_or_default(),
                    credential: server.credential.unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_transport_policy: match config.transport_policy {
                TransportPolicy::All => RTCIceTransportPolicy::All,
                TransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| EngineError::PeerConstruction(e.to_string()))?,
        );

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let sink = EventSink::new(tx);
        wire_peer(&pc, &sink);

        Ok((Arc::new(RtcPeer { pc, sink }), rx))
    }
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct EventSink {
    tx: Arc<Mutex<Option<mpsc::Sender<PeerEvent>>>>,
}

impl EventSink {
    fn new(tx: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    async fn emit(&self, event: PeerEvent) {
        let tx = self.tx.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    async fn close(&self) {
        self.tx.lock().await.take();
    }
}

fn wire_peer(pc: &Arc<RTCPeerConnection>, sink: &EventSink) {
    let candidate_sink = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidate_sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match convert_candidate(&candidate) {
                Some(converted) => sink.emit(PeerEvent::Candidate(converted)).await,
                None => trace!(candidate_type = ?candidate.typ, "dropping unconvertible candidate"),
            }
        })
    }));

    let state_sink = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = state_sink.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::StateChanged(convert_state(state))).await;
        })
    }));

    let channel_sink = sink.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = channel_sink.clone();
        Box::pin(async move {
            debug!(label = dc.label(), "remote data channel announced");
            let channel = RtcChannel::new(dc);
            wire_channel(&channel, &sink).await;
        })
    }));
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
}

#[async_trait]
impl Peer for RtcPeer {
    async fn create_data_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn DataChannel>, EngineError> {
        let options = RTCDataChannelInit {
            ordered: Some(init.ordered),
            max_retransmits: init.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(options))
            .await
            .map_err(|e| EngineError::DataChannel(e.to_string()))?;
        let channel = RtcChannel::new(dc);
        wire_channel(&channel, &self.sink).await;
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::Candidate(e.to_string()))
    }

    fn connection_state(&self) -> PeerState {
        convert_state(self.pc.connection_state())
    }

    async fn transport_counters(&self) -> TransportCounters {
        let report = self.pc.get_stats().await;
        report
            .reports
            .values()
            .fold(TransportCounters::default(), |mut acc, entry| {
                if let StatsReportType::Transport(transport) = entry {
                    acc.bytes_sent += transport.bytes_sent as u64;
                    acc.bytes_received += transport.bytes_received as u64;
                }
                acc
            })
    }

    async fn close(&self) -> Result<(), EngineError> {
        let result = self
            .pc
            .close()
            .await
            .map_err(|e| EngineError::Close(e.to_string()));
        // The closed state may be reported after `close` returns; forward it
        // before the stream ends.
        self.sink
            .emit(PeerEvent::StateChanged(PeerState::Closed))
            .await;
        self.sink.close().await;
        result
    }
}

// ---------------------------------------------------------------------------
// Data channel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChannelTally {
    sent: AtomicU64,
    received: AtomicU64,
}

pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    tally: Arc<ChannelTally>,
}

impl RtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        Arc::new(Self {
            label: dc.label().to_string(),
            dc,
            tally: Arc::default(),
        })
    }
}

async fn wire_channel(channel: &Arc<RtcChannel>, sink: &EventSink) {
    let weak: Weak<RtcChannel> = Arc::downgrade(channel);
    let open_sink = sink.clone();
    channel.dc.on_open(Box::new(move || {
        Box::pin(async move {
            if let Some(channel) = weak.upgrade() {
                open_sink.emit(PeerEvent::ChannelOpen(channel)).await;
            }
        })
    }));

    let message_sink = sink.clone();
    let tally = channel.tally.clone();
    channel.dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        let len = msg.data.len();
        tally.received.fetch_add(len as u64, Ordering::Relaxed);
        Box::pin(async move {
            sink.emit(PeerEvent::ChannelMessage { len }).await;
        })
    }));

    let close_sink = sink.clone();
    channel.dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::ChannelClosed).await;
        })
    }));

    let low_sink = sink.clone();
    channel
        .dc
        .on_buffered_amount_low(Box::new(move || {
            let sink = low_sink.clone();
            Box::pin(async move {
                sink.emit(PeerEvent::BufferedAmountLow).await;
            })
        }))
        .await;
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: &Bytes) -> Result<usize, EngineError> {
        let n = self
            .dc
            .send(data)
            .await
            .map_err(|e| EngineError::Send(e.to_string()))?;
        self.tally.sent.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn counters(&self) -> ChannelCounters {
        ChannelCounters {
            bytes_sent: self.tally.sent.load(Ordering::Relaxed),
            bytes_received: self.tally.received.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.dc
            .close()
            .await
            .map_err(|e| EngineError::Close(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn convert_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

fn convert_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    let candidate_type = match candidate.typ {
        RTCIceCandidateType::Host => CandidateType::Host,
        RTCIceCandidateType::Srflx => CandidateType::Srflx,
        RTCIceCandidateType::Prflx => CandidateType::Prflx,
        RTCIceCandidateType::Relay => CandidateType::Relay,
        RTCIceCandidateType::Unspecified => return None,
    };
    let init = candidate.to_json().ok()?;
    Some(IceCandidate {
        candidate_type,
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        address: candidate.address.clone(),
        port: candidate.port,
        related_address: (!candidate.related_address.is_empty())
            .then(|| candidate.related_address.clone()),
        related_port: (candidate.related_port != 0).then_some(candidate.related_port),
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| EngineError::Description(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(EngineError::Description(format!(
                "unexpected description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_conversion() {
        assert_eq!(convert_state(RTCPeerConnectionState::Unspecified), PeerState::New);
        assert_eq!(convert_state(RTCPeerConnectionState::Connected), PeerState::Connected);
        assert_eq!(convert_state(RTCPeerConnectionState::Failed), PeerState::Failed);
    }

    #[test]
    fn test_description_round_trip_kinds() {
        let desc = SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0\r\n".to_string(),
        };
        let rtc: RTCSessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(from_rtc(rtc).unwrap(), desc);

        let pranswer: RTCSessionDescription =
            serde_json::from_str(r#"{"type":"pranswer","sdp":""}"#).unwrap();
        assert!(matches!(from_rtc(pranswer), Err(EngineError::Description(_))));
    }

    #[tokio::test]
    async fn test_peer_construction_and_offer() {
        let engine = RtcEngine::new().unwrap();
        let (peer, _events) = engine
            .new_peer(PeerConfig {
                ice_servers: vec![],
                transport_policy: TransportPolicy::All,
            })
            .await
            .unwrap();
        peer.create_data_channel("test", ChannelInit::unreliable())
            .await
            .unwrap();
        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));
        peer.close().await.unwrap();
        assert_eq!(peer.connection_state(), PeerState::Closed);
    }
}
