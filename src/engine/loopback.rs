//! In-process loopback engine.
//!
//! Simulates just enough of a peer connection to drive the harness without
//! a network: scripted candidate gathering, a configurable connect outcome,
//! and a data channel whose send buffer drains at a fixed link rate and
//! raises buffered-amount-low when it falls below the threshold.
//!
//! Peers find each other through a token carried in the SDP, so the offer
//! and answer still have to be exchanged for the link to come up.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{
    ChannelCounters, ChannelInit, DataChannel, Engine, EngineError, IceCandidate, Peer, PeerConfig,
    PeerEvent, PeerEvents, PeerState, SdpKind, SessionDescription, TransportCounters,
    EVENT_QUEUE_DEPTH,
};
use crate::candidate::{CandidateType, TransportPolicy};
use crate::stats::PeerRole;

const SDP_PEER_ATTR: &str = "a=loopback-peer:";

/// Per-message framing overhead counted on the simulated transport.
const PACKET_OVERHEAD: u64 = 48;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the simulated link behaves once both descriptions are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Connect { after: Duration },
    /// The offerer reports Failed.
    Fail { after: Duration },
    /// Both peers connect and open the channel, then the offerer fails.
    ConnectThenFail {
        connect_after: Duration,
        fail_after: Duration,
    },
    /// The answerer reports Failed while the offerer is still connecting.
    AnswererFail { after: Duration },
    /// Stays in Connecting forever.
    Never,
}

/// Step at which the engine reports an error instead of succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    NewPeer,
    CreateOffer,
    CreateAnswer,
    Close,
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub offerer_candidates: Vec<CandidateType>,
    pub answerer_candidates: Vec<CandidateType>,
    /// Gap before each gathered candidate.
    pub candidate_delay: Duration,
    pub outcome: LinkOutcome,
    pub link_rate_bytes_per_sec: u64,
    pub drain_tick: Duration,
    pub fail_at: Option<FailurePoint>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            offerer_candidates: vec![CandidateType::Host, CandidateType::Srflx, CandidateType::Relay],
            answerer_candidates: vec![CandidateType::Host, CandidateType::Srflx],
            candidate_delay: Duration::from_millis(20),
            outcome: LinkOutcome::Connect {
                after: Duration::from_millis(50),
            },
            link_rate_bytes_per_sec: 4 * 1024 * 1024,
            drain_tick: Duration::from_millis(10),
            fail_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineShared {
    next_id: AtomicU64,
    registry: Mutex<HashMap<u64, Arc<PeerInner>>>,
    /// Remote candidates accepted, keyed by the receiving peer's role.
    delivered: Mutex<Vec<(PeerRole, CandidateType)>>,
}

#[derive(Clone, Default)]
pub struct LoopbackEngine {
    config: Arc<LoopbackConfig>,
    shared: Arc<EngineShared>,
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::default(),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Candidates trickled into peers so far, in the order they were added.
    pub async fn delivered_candidates(&self) -> Vec<(PeerRole, CandidateType)> {
        self.shared.delivered.lock().await.clone()
    }
}

#[async_trait]
impl Engine for LoopbackEngine {
    async fn new_peer(&self, config: PeerConfig) -> Result<(Arc<dyn Peer>, PeerEvents), EngineError> {
        if self.config.fail_at == Some(FailurePoint::NewPeer) {
            return Err(EngineError::PeerConstruction("simulated failure".into()));
        }
        if config.ice_servers.iter().all(|s| s.urls.is_empty()) {
            return Err(EngineError::PeerConstruction("no ICE servers configured".into()));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let inner = Arc::new(PeerInner {
            id,
            config: self.config.clone(),
            engine: self.shared.clone(),
            policy: config.transport_policy,
            role: OnceLock::new(),
            state: AtomicU8::new(encode_state(PeerState::New)),
            events: Mutex::new(Some(tx)),
            remote_set: AtomicBool::new(false),
            remote: Mutex::new(None),
            link: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });
        self.shared.registry.lock().await.insert(id, inner.clone());
        trace!(peer_id = id, "loopback peer created");
        Ok((Arc::new(LoopbackPeer { inner }), rx))
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

struct PeerInner {
    id: u64,
    config: Arc<LoopbackConfig>,
    engine: Arc<EngineShared>,
    policy: TransportPolicy,
    role: OnceLock<PeerRole>,
    state: AtomicU8,
    events: Mutex<Option<mpsc::Sender<PeerEvent>>>,
    remote_set: AtomicBool,
    remote: Mutex<Option<Arc<PeerInner>>>,
    link: Mutex<Option<Arc<Link>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerInner {
    fn state(&self) -> PeerState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    async fn emit(&self, event: PeerEvent) {
        let tx = self.events.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    async fn transition(&self, next: PeerState) {
        if self.state() == PeerState::Closed {
            return;
        }
        self.state.store(encode_state(next), Ordering::SeqCst);
        self.emit(PeerEvent::StateChanged(next)).await;
    }

    async fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    fn sdp(&self) -> String {
        format!(
            "v=0\r\no=- {id} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n{SDP_PEER_ATTR}{id}\r\n",
            id = self.id
        )
    }
}

pub struct LoopbackPeer {
    inner: Arc<PeerInner>,
}

#[async_trait]
impl Peer for LoopbackPeer {
    async fn create_data_channel(
        &self,
        label: &str,
        _init: ChannelInit,
    ) -> Result<Arc<dyn DataChannel>, EngineError> {
        if self.inner.state() == PeerState::Closed {
            return Err(EngineError::DataChannel("peer is closed".into()));
        }
        let link = Arc::new(Link::new(label, Arc::downgrade(&self.inner)));
        *self.inner.link.lock().await = Some(link.clone());
        Ok(Arc::new(LoopbackChannel {
            role: PeerRole::Offerer,
            link,
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        if self.inner.config.fail_at == Some(FailurePoint::CreateOffer) {
            return Err(EngineError::Description("simulated offer failure".into()));
        }
        let _ = self.inner.role.set(PeerRole::Offerer);
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: self.inner.sdp(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if self.inner.config.fail_at == Some(FailurePoint::CreateAnswer) {
            return Err(EngineError::Description("simulated answer failure".into()));
        }
        if self.inner.role.get() != Some(&PeerRole::Answerer) {
            return Err(EngineError::Description("no remote offer applied".into()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: self.inner.sdp(),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let role = match desc.kind {
            SdpKind::Offer => PeerRole::Offerer,
            SdpKind::Answer => PeerRole::Answerer,
        };
        let _ = self.inner.role.set(role);

        let scripted = match role {
            PeerRole::Offerer => &self.inner.config.offerer_candidates,
            PeerRole::Answerer => &self.inner.config.answerer_candidates,
        };
        let kinds: Vec<CandidateType> = scripted
            .iter()
            .copied()
            .filter(|kind| self.inner.policy == TransportPolicy::All || *kind == CandidateType::Relay)
            .collect();

        let handle = tokio::spawn(gather(self.inner.clone(), kinds));
        self.inner.track(handle).await;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let remote_id = peer_token(&desc.sdp)
            .ok_or_else(|| EngineError::Description("missing loopback peer token".into()))?;
        let remote = self
            .inner
            .engine
            .registry
            .lock()
            .await
            .get(&remote_id)
            .cloned()
            .ok_or_else(|| EngineError::Description(format!("unknown loopback peer {remote_id}")))?;

        *self.inner.remote.lock().await = Some(remote.clone());
        self.inner.remote_set.store(true, Ordering::SeqCst);

        match desc.kind {
            SdpKind::Offer => {
                let _ = self.inner.role.set(PeerRole::Answerer);
            }
            SdpKind::Answer => {
                let _ = self.inner.role.set(PeerRole::Offerer);
                let handle = tokio::spawn(establish(self.inner.clone(), remote));
                self.inner.track(handle).await;
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        if !self.inner.remote_set.load(Ordering::SeqCst) {
            return Err(EngineError::Candidate("remote description not set".into()));
        }
        let role = self.inner.role.get().copied().unwrap_or(PeerRole::Answerer);
        self.inner
            .engine
            .delivered
            .lock()
            .await
            .push((role, candidate.candidate_type));
        Ok(())
    }

    fn connection_state(&self) -> PeerState {
        self.inner.state()
    }

    async fn transport_counters(&self) -> TransportCounters {
        TransportCounters {
            bytes_sent: self.inner.bytes_sent.load(Ordering::SeqCst),
            bytes_received: self.inner.bytes_received.load(Ordering::SeqCst),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let link = inner.link.lock().await.clone();
        if let Some(link) = link {
            link.close().await;
        }
        for handle in inner.tasks.lock().await.drain(..) {
            handle.abort();
        }
        inner.transition(PeerState::Closed).await;
        inner.events.lock().await.take();
        inner.remote.lock().await.take();
        inner.engine.registry.lock().await.remove(&inner.id);
        debug!(peer_id = inner.id, "loopback peer closed");

        if inner.config.fail_at == Some(FailurePoint::Close) {
            return Err(EngineError::Close("simulated close failure".into()));
        }
        Ok(())
    }
}

async fn gather(peer: Arc<PeerInner>, kinds: Vec<CandidateType>) {
    for (index, kind) in kinds.into_iter().enumerate() {
        tokio::time::sleep(peer.config.candidate_delay).await;
        if peer.state() == PeerState::Closed {
            return;
        }
        peer.emit(PeerEvent::Candidate(synth_candidate(peer.id, index, kind)))
            .await;
    }
}

async fn establish(offerer: Arc<PeerInner>, answerer: Arc<PeerInner>) {
    offerer.transition(PeerState::Connecting).await;
    answerer.transition(PeerState::Connecting).await;

    match offerer.config.outcome {
        LinkOutcome::Connect { after } => {
            tokio::time::sleep(after).await;
            connect(&offerer, &answerer).await;
        }
        LinkOutcome::Fail { after } => {
            tokio::time::sleep(after).await;
            offerer.transition(PeerState::Failed).await;
        }
        LinkOutcome::ConnectThenFail {
            connect_after,
            fail_after,
        } => {
            tokio::time::sleep(connect_after).await;
            if !connect(&offerer, &answerer).await {
                return;
            }
            tokio::time::sleep(fail_after).await;
            offerer.transition(PeerState::Failed).await;
        }
        LinkOutcome::AnswererFail { after } => {
            tokio::time::sleep(after).await;
            answerer.transition(PeerState::Failed).await;
        }
        LinkOutcome::Never => {}
    }
}

/// Moves both peers to Connected and opens the channel on both ends.
/// Returns false when either peer closed first.
async fn connect(offerer: &Arc<PeerInner>, answerer: &Arc<PeerInner>) -> bool {
    if offerer.state() == PeerState::Closed || answerer.state() == PeerState::Closed {
        return false;
    }
    offerer.transition(PeerState::Connected).await;
    answerer.transition(PeerState::Connected).await;

    let link = offerer.link.lock().await.clone();
    let Some(link) = link else {
        return true;
    };
    let _ = link.answerer.set(Arc::downgrade(answerer));
    link.open.store(true, Ordering::SeqCst);
    *answerer.link.lock().await = Some(link.clone());

    offerer
        .emit(PeerEvent::ChannelOpen(Arc::new(LoopbackChannel {
            role: PeerRole::Offerer,
            link: link.clone(),
        })))
        .await;
    answerer
        .emit(PeerEvent::ChannelOpen(Arc::new(LoopbackChannel {
            role: PeerRole::Answerer,
            link: link.clone(),
        })))
        .await;

    tokio::spawn(drain(link, offerer.config.clone()));
    true
}

// ---------------------------------------------------------------------------
// Data channel
// ---------------------------------------------------------------------------

/// Both channel ends share one link. Only the offerer end sends.
struct Link {
    label: String,
    offerer: Weak<PeerInner>,
    answerer: OnceLock<Weak<PeerInner>>,
    queue: Mutex<VecDeque<usize>>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    sent: AtomicU64,
    delivered: AtomicU64,
    open: AtomicBool,
    closed: AtomicBool,
}

impl Link {
    fn new(label: &str, offerer: Weak<PeerInner>) -> Self {
        Self {
            label: label.to_string(),
            offerer,
            answerer: OnceLock::new(),
            queue: Mutex::new(VecDeque::new()),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn peers(&self) -> (Option<Arc<PeerInner>>, Option<Arc<PeerInner>>) {
        (
            self.offerer.upgrade(),
            self.answerer.get().and_then(Weak::upgrade),
        )
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (offerer, answerer) = self.peers();
        for peer in [offerer, answerer].into_iter().flatten() {
            peer.emit(PeerEvent::ChannelClosed).await;
        }
    }
}

async fn drain(link: Arc<Link>, config: Arc<LoopbackConfig>) {
    let per_tick =
        ((config.link_rate_bytes_per_sec as f64 * config.drain_tick.as_secs_f64()) as usize).max(1);
    let mut credit = 0usize;
    let mut ticker = tokio::time::interval(config.drain_tick);

    loop {
        ticker.tick().await;
        if link.closed.load(Ordering::SeqCst) {
            break;
        }
        let (Some(offerer), Some(answerer)) = link.peers() else {
            break;
        };
        if offerer.state() != PeerState::Connected || answerer.state() != PeerState::Connected {
            break;
        }

        credit = (credit + per_tick).min(per_tick * 4);
        let before = link.buffered.load(Ordering::SeqCst);

        let mut delivered = Vec::new();
        {
            let mut queue = link.queue.lock().await;
            while let Some(&len) = queue.front() {
                if len > credit {
                    break;
                }
                queue.pop_front();
                credit -= len;
                delivered.push(len);
            }
        }

        for len in delivered {
            link.buffered.fetch_sub(len, Ordering::SeqCst);
            link.delivered.fetch_add(len as u64, Ordering::SeqCst);
            offerer
                .bytes_sent
                .fetch_add(len as u64 + PACKET_OVERHEAD, Ordering::SeqCst);
            answerer
                .bytes_received
                .fetch_add(len as u64 + PACKET_OVERHEAD, Ordering::SeqCst);
            answerer.emit(PeerEvent::ChannelMessage { len }).await;
        }

        let after = link.buffered.load(Ordering::SeqCst);
        let low = link.low_threshold.load(Ordering::SeqCst);
        if before > low && after <= low {
            offerer.emit(PeerEvent::BufferedAmountLow).await;
        }
    }
    trace!(label = %link.label, "loopback link drain stopped");
}

pub struct LoopbackChannel {
    role: PeerRole,
    link: Arc<Link>,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.link.label
    }

    async fn send(&self, data: &Bytes) -> Result<usize, EngineError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ChannelClosed);
        }
        if self.role != PeerRole::Offerer {
            return Err(EngineError::Send("receive-only channel end".into()));
        }
        if !self.link.open.load(Ordering::SeqCst) {
            return Err(EngineError::Send("channel not open".into()));
        }
        let len = data.len();
        self.link.queue.lock().await.push_back(len);
        self.link.buffered.fetch_add(len, Ordering::SeqCst);
        self.link.sent.fetch_add(len as u64, Ordering::SeqCst);
        Ok(len)
    }

    async fn buffered_amount(&self) -> usize {
        self.link.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.link.low_threshold.store(threshold, Ordering::SeqCst);
    }

    async fn counters(&self) -> ChannelCounters {
        match self.role {
            PeerRole::Offerer => ChannelCounters {
                bytes_sent: self.link.sent.load(Ordering::SeqCst),
                bytes_received: 0,
            },
            PeerRole::Answerer => ChannelCounters {
                bytes_sent: 0,
                bytes_received: self.link.delivered.load(Ordering::SeqCst),
            },
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.link.close().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn encode_state(state: PeerState) -> u8 {
    match state {
        PeerState::New => 0,
        PeerState::Connecting => 1,
        PeerState::Connected => 2,
        PeerState::Disconnected => 3,
        PeerState::Failed => 4,
        PeerState::Closed => 5,
    }
}

fn decode_state(raw: u8) -> PeerState {
    match raw {
        0 => PeerState::New,
        1 => PeerState::Connecting,
        2 => PeerState::Connected,
        3 => PeerState::Disconnected,
        4 => PeerState::Failed,
        _ => PeerState::Closed,
    }
}

fn peer_token(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(SDP_PEER_ATTR))
        .and_then(|id| id.trim().parse().ok())
}

fn synth_candidate(peer_id: u64, index: usize, kind: CandidateType) -> IceCandidate {
    let octet = (peer_id % 250) as u8 + 1;
    let port = 50_000 + (peer_id as u16 % 1000) * 10 + index as u16;
    let (address, related) = match kind {
        CandidateType::Host => (format!("192.0.2.{octet}"), None),
        CandidateType::Srflx | CandidateType::Prflx => {
            (format!("203.0.113.{octet}"), Some(format!("192.0.2.{octet}")))
        }
        CandidateType::Relay => (format!("198.51.100.{octet}"), Some(format!("203.0.113.{octet}"))),
    };
    let priority = match kind {
        CandidateType::Host => 2_130_706_431u32,
        CandidateType::Prflx => 1_862_270_975,
        CandidateType::Srflx => 1_694_498_815,
        CandidateType::Relay => 16_777_215,
    };

    let mut line = format!("candidate:{index} 1 udp {priority} {address} {port} typ {kind}");
    if let Some(raddr) = &related {
        line.push_str(&format!(" raddr {raddr} rport {port}"));
    }

    IceCandidate {
        candidate_type: kind,
        candidate: line,
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        address,
        port,
        related_port: related.as_ref().map(|_| port),
        related_address: related,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::IceServer;

    fn peer_config(policy: TransportPolicy) -> PeerConfig {
        PeerConfig {
            ice_servers: vec![IceServer::new("stun:stun.example.com:3478")],
            transport_policy: policy,
        }
    }

    async fn next_state(events: &mut PeerEvents) -> PeerState {
        loop {
            match events.recv().await {
                Some(PeerEvent::StateChanged(state)) => return state,
                Some(_) => continue,
                None => return PeerState::Closed,
            }
        }
    }

    #[test]
    fn test_peer_token() {
        assert_eq!(peer_token("v=0\r\na=loopback-peer:42\r\n"), Some(42));
        assert_eq!(peer_token("v=0\r\n"), None);
    }

    #[test]
    fn test_state_encoding() {
        for state in [
            PeerState::New,
            PeerState::Connecting,
            PeerState::Connected,
            PeerState::Disconnected,
            PeerState::Failed,
            PeerState::Closed,
        ] {
            assert_eq!(decode_state(encode_state(state)), state);
        }
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_rejected() {
        let engine = LoopbackEngine::default();
        let (peer, _events) = engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();
        let candidate = synth_candidate(1, 0, CandidateType::Srflx);
        assert!(matches!(
            peer.add_ice_candidate(candidate).await,
            Err(EngineError::Candidate(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer_token_rejected() {
        let engine = LoopbackEngine::default();
        let (peer, _events) = engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();
        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0\r\n{SDP_PEER_ATTR}999\r\n"),
        };
        assert!(matches!(
            peer.set_remote_description(desc).await,
            Err(EngineError::Description(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_policy_gathers_relay_only() {
        let engine = LoopbackEngine::default();
        let (peer, mut events) = engine
            .new_peer(peer_config(TransportPolicy::Relay))
            .await
            .unwrap();
        let offer = peer.create_offer().await.unwrap();
        peer.set_local_description(offer).await.unwrap();

        let mut kinds = Vec::new();
        let deadline = tokio::time::sleep(Duration::from_millis(500));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                Some(PeerEvent::Candidate(c)) = events.recv() => kinds.push(c.candidate_type),
                _ = &mut deadline => break,
            }
        }
        assert_eq!(kinds, vec![CandidateType::Relay]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_connects_and_drains() {
        let engine = LoopbackEngine::default();
        let (offerer, mut offerer_events) =
            engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();
        let (answerer, mut answerer_events) =
            engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();
        let channel = offerer
            .create_data_channel("test", ChannelInit::unreliable())
            .await
            .unwrap();
        channel.set_buffered_amount_low_threshold(0).await;

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        assert_eq!(next_state(&mut offerer_events).await, PeerState::Connecting);
        assert_eq!(next_state(&mut offerer_events).await, PeerState::Connected);
        assert_eq!(next_state(&mut answerer_events).await, PeerState::Connecting);
        assert_eq!(next_state(&mut answerer_events).await, PeerState::Connected);

        for _ in 0..4 {
            channel.send(&Bytes::from_static(&[0u8; 1024])).await.unwrap();
        }
        assert_eq!(channel.buffered_amount().await, 4096);

        let mut low_seen = false;
        while !low_seen {
            match offerer_events.recv().await {
                Some(PeerEvent::BufferedAmountLow) => low_seen = true,
                Some(_) => {}
                None => break,
            }
        }
        assert!(low_seen);
        assert_eq!(channel.buffered_amount().await, 0);
        assert_eq!(channel.counters().await.bytes_sent, 4096);
        assert!(offerer.transport_counters().await.bytes_sent >= 4096);

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
        assert_eq!(offerer.connection_state(), PeerState::Closed);
        assert!(matches!(
            channel.send(&Bytes::from_static(b"x")).await,
            Err(EngineError::ChannelClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_outcome_reports_failed_on_offerer() {
        let engine = LoopbackEngine::new(LoopbackConfig {
            outcome: LinkOutcome::Fail {
                after: Duration::from_millis(30),
            },
            ..Default::default()
        });
        let (offerer, mut events) = engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();
        let (answerer, _answerer_events) =
            engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        assert_eq!(next_state(&mut events).await, PeerState::Connecting);
        assert_eq!(next_state(&mut events).await, PeerState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_fail_reports_failed_after_connected() {
        let engine = LoopbackEngine::new(LoopbackConfig {
            outcome: LinkOutcome::ConnectThenFail {
                connect_after: Duration::from_millis(30),
                fail_after: Duration::from_millis(50),
            },
            ..Default::default()
        });
        let (offerer, mut events) = engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();
        let (answerer, _answerer_events) =
            engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        assert_eq!(next_state(&mut events).await, PeerState::Connecting);
        assert_eq!(next_state(&mut events).await, PeerState::Connected);
        assert_eq!(next_state(&mut events).await, PeerState::Failed);
        assert_eq!(answerer.connection_state(), PeerState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answerer_fail_leaves_offerer_connecting() {
        let engine = LoopbackEngine::new(LoopbackConfig {
            outcome: LinkOutcome::AnswererFail {
                after: Duration::from_millis(30),
            },
            ..Default::default()
        });
        let (offerer, _offerer_events) =
            engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();
        let (answerer, mut events) =
            engine.new_peer(peer_config(TransportPolicy::All)).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        assert_eq!(next_state(&mut events).await, PeerState::Connecting);
        assert_eq!(next_state(&mut events).await, PeerState::Failed);
        assert_eq!(offerer.connection_state(), PeerState::Connecting);
    }
}
