//! Offerer/answerer pair wired together in-process.
//!
//! Both peers live in the same process, so signaling is a direct hand-off
//! of serialized session descriptions and trickled candidates. Each peer's
//! event stream is drained by its own task, which owns that peer's
//! [`PeerMachine`] and feeds the shared [`Stats`](crate::stats::Stats).

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use super::peer::{PeerMachine, Transition};
use super::throughput::{
    self, low_water_channel, LowWaterNotifier, LowWaterSignal, SamplerContext, SenderContext,
    Watermarks,
};
use super::RunSignal;
use crate::candidate::{CandidateDescriptor, TransportPolicy};
use crate::engine::{
    ChannelInit, DataChannel, Engine, EngineError, IceCandidate, IceServer, Peer, PeerConfig,
    PeerEvent, PeerEvents, PeerState, SessionDescription,
};
use crate::stats::{PeerRole, SharedStats};

/// Label of the single data channel the offerer opens.
pub const DATA_CHANNEL_LABEL: &str = "iceperf";

/// What the pair does once the data channel opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// STUN/STUNS: connectivity only, the run completes on Connected.
    Connectivity,
    /// TURN/TURNS without throughput: the first delivered message completes
    /// the run and yields first-packet latency.
    Latency,
    /// TURN/TURNS with throughput: saturate the relay until the deadline.
    Throughput,
}

impl TestMode {
    pub fn select(descriptor: &CandidateDescriptor, do_throughput: bool) -> Self {
        if !descriptor.supports_throughput() {
            TestMode::Connectivity
        } else if do_throughput {
            TestMode::Throughput
        } else {
            TestMode::Latency
        }
    }

    /// Send-loop watermarks, or `None` when no data is driven.
    pub fn watermarks(&self) -> Option<Watermarks> {
        match self {
            TestMode::Connectivity => None,
            TestMode::Latency => Some(Watermarks::LATENCY),
            TestMode::Throughput => Some(Watermarks::THROUGHPUT),
        }
    }

    pub fn drives_data(&self) -> bool {
        self.watermarks().is_some()
    }
}

pub type CandidateHook = Arc<dyn Fn(PeerRole, &IceCandidate) + Send + Sync>;
pub type StateHook = Arc<dyn Fn(PeerRole, PeerState) + Send + Sync>;

/// Externally supplied handlers. A supplied hook replaces the built-in
/// handler for that event on both peers.
#[derive(Clone, Default)]
pub struct EventOverrides {
    pub on_candidate: Option<CandidateHook>,
    pub on_state_change: Option<StateHook>,
}

pub struct PairOptions {
    pub descriptor: CandidateDescriptor,
    /// Non-relay STUN server for the answerer.
    pub answerer_stun_url: String,
    pub mode: TestMode,
    pub overrides: EventOverrides,
}

// ---------------------------------------------------------------------------
// Candidate gate
// ---------------------------------------------------------------------------

/// Holds trickled candidates until the target peer has a remote
/// description, then passes them through in arrival order.
struct CandidateGate {
    target: Arc<dyn Peer>,
    role: PeerRole,
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    open: bool,
    pending: Vec<IceCandidate>,
}

impl CandidateGate {
    fn new(target: Arc<dyn Peer>, role: PeerRole) -> Self {
        Self {
            target,
            role,
            state: Mutex::new(GateState::default()),
        }
    }

    async fn forward(&self, candidate: IceCandidate) {
        let mut state = self.state.lock().await;
        if !state.open {
            state.pending.push(candidate);
            return;
        }
        self.add(candidate).await;
    }

    async fn open(&self) {
        let mut state = self.state.lock().await;
        state.open = true;
        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            debug!(peer = %self.role, count = pending.len(), "flushing buffered candidates");
        }
        for candidate in pending {
            self.add(candidate).await;
        }
    }

    async fn add(&self, candidate: IceCandidate) {
        if let Err(e) = self.target.add_ice_candidate(candidate).await {
            warn!(peer = %self.role, error = %e, "failed to add remote candidate");
        }
    }
}

// ---------------------------------------------------------------------------
// Shared run state
// ---------------------------------------------------------------------------

struct PairShared {
    mode: TestMode,
    stats: SharedStats,
    signals: mpsc::Sender<RunSignal>,
    started: Instant,
    overrides: EventOverrides,
    first_send: Arc<OnceLock<Instant>>,
    /// Flips to `true` once the channel or either peer closes.
    channel_closed: watch::Sender<bool>,
    low_water: LowWaterNotifier,
    low_water_signal: Mutex<Option<LowWaterSignal>>,
    offerer_channel: Mutex<Option<Arc<dyn DataChannel>>>,
    answerer_channel: Mutex<Option<Arc<dyn DataChannel>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PairShared {
    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn signal(&self, signal: RunSignal) {
        // A full queue already carries a signal that ends the run.
        let _ = self.signals.try_send(signal);
    }

    fn channel_slot(&self, role: PeerRole) -> &Mutex<Option<Arc<dyn DataChannel>>> {
        match role {
            PeerRole::Offerer => &self.offerer_channel,
            PeerRole::Answerer => &self.answerer_channel,
        }
    }
}

/// Everything a peer's event task needs.
struct PeerTask {
    role: PeerRole,
    peer: Arc<dyn Peer>,
    events: PeerEvents,
    shared: Arc<PairShared>,
    /// Gate into the other peer.
    outbound: Arc<CandidateGate>,
    connected: watch::Sender<Option<bool>>,
    machine: PeerMachine,
    first_message_seen: bool,
}

impl PeerTask {
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                PeerEvent::Candidate(candidate) => self.on_candidate(candidate).await,
                PeerEvent::StateChanged(state) => self.on_state(state).await,
                PeerEvent::ChannelOpen(channel) => self.on_channel_open(channel).await,
                PeerEvent::ChannelMessage { len } => self.on_message(len).await,
                PeerEvent::ChannelClosed => self.on_channel_closed().await,
                PeerEvent::BufferedAmountLow => {
                    if self.role == PeerRole::Offerer {
                        self.shared.low_water.notify();
                    }
                }
            }
        }
        debug!(peer = %self.role, "event stream ended");
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if self.machine.is_closed() {
            return;
        }
        if let Some(hook) = &self.shared.overrides.on_candidate {
            hook(self.role, &candidate);
            return;
        }

        let kind = candidate.candidate_type;
        if !kind.is_timed() {
            debug!(peer = %self.role, candidate_type = %kind, "ignoring candidate");
            return;
        }

        let elapsed_ms = self.shared.elapsed_ms();
        self.shared
            .stats
            .lock()
            .await
            .record_candidate(self.role, kind, elapsed_ms);
        info!(
            peer = %self.role,
            candidate_type = %kind,
            address = %candidate.address,
            port = candidate.port,
            elapsed_ms,
            "candidate gathered"
        );
        self.outbound.forward(candidate).await;
    }

    async fn on_state(&mut self, state: PeerState) {
        if let Some(hook) = &self.shared.overrides.on_state_change {
            hook(self.role, state);
            return;
        }

        match self.machine.apply(state) {
            Transition::Ignored => {}
            Transition::Connecting => {
                debug!(peer = %self.role, "connecting");
            }
            Transition::Connected => {
                let elapsed_ms = self.shared.elapsed_ms();
                info!(peer = %self.role, elapsed_ms, "connected");
                if self.role == PeerRole::Offerer {
                    self.shared.stats.lock().await.set_time_to_connected(elapsed_ms);
                    if self.shared.mode == TestMode::Connectivity {
                        self.shared.signal(RunSignal::Completed);
                    }
                }
                self.connected.send_replace(Some(true));
            }
            Transition::Disconnected => {
                info!(peer = %self.role, "disconnected");
            }
            Transition::Failed => {
                warn!(peer = %self.role, elapsed_ms = self.shared.elapsed_ms(), "connection failed");
                self.shared.stats.lock().await.mark_failed();
                self.connected.send_replace(Some(false));
                self.shared.channel_closed.send_replace(true);
                self.shared.signal(RunSignal::Aborted(self.role));
            }
            Transition::Closed => {
                debug!(peer = %self.role, "closed");
                self.connected.send_replace(Some(false));
                self.shared.channel_closed.send_replace(true);
            }
        }
    }

    async fn on_channel_open(&mut self, channel: Arc<dyn DataChannel>) {
        info!(peer = %self.role, label = channel.label(), "data channel open");
        *self.shared.channel_slot(self.role).lock().await = Some(channel.clone());

        let handle = match (self.role, self.shared.mode.watermarks()) {
            (PeerRole::Offerer, Some(watermarks)) => {
                let Some(low_water) = self.shared.low_water_signal.lock().await.take() else {
                    return;
                };
                let ctx = SenderContext {
                    channel,
                    watermarks,
                    low_water,
                    closed: self.shared.channel_closed.subscribe(),
                    first_send: self.shared.first_send.clone(),
                };
                tokio::spawn(
                    async move {
                        throughput::run_sender(ctx).await;
                    }
                    .in_current_span(),
                )
            }
            (PeerRole::Answerer, _) if self.shared.mode == TestMode::Throughput => {
                let ctx = SamplerContext {
                    peer: self.peer.clone(),
                    channel,
                    stats: self.shared.stats.clone(),
                    interval: throughput::SAMPLE_INTERVAL,
                };
                tokio::spawn(
                    async move {
                        throughput::run_sampler(ctx).await;
                    }
                    .in_current_span(),
                )
            }
            _ => return,
        };
        self.shared.workers.lock().await.push(handle);
    }

    async fn on_message(&mut self, len: usize) {
        if self.role != PeerRole::Answerer || self.first_message_seen {
            return;
        }
        self.first_message_seen = true;

        if let Some(sent_at) = self.shared.first_send.get() {
            let latency_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
            self.shared
                .stats
                .lock()
                .await
                .set_latency_first_packet(latency_ms);
            info!(peer = %self.role, latency_ms, len, "first packet received");
        }
        if self.shared.mode == TestMode::Latency {
            self.shared.signal(RunSignal::Completed);
        }
    }

    async fn on_channel_closed(&mut self) {
        debug!(peer = %self.role, "data channel closed");
        self.shared.channel_closed.send_replace(true);
        commit_counters(&self.shared, self.role, self.peer.as_ref()).await;
    }
}

async fn commit_counters(shared: &PairShared, role: PeerRole, peer: &dyn Peer) {
    let transport = peer.transport_counters().await;
    let channel = shared.channel_slot(role).lock().await.clone();
    let app = match channel {
        Some(channel) => channel.counters().await,
        None => Default::default(),
    };

    let mut stats = shared.stats.lock().await;
    match role {
        PeerRole::Offerer => {
            stats.set_offerer_bytes(app.bytes_sent, transport.bytes_sent, transport.bytes_received)
        }
        PeerRole::Answerer => stats.set_answerer_bytes(
            app.bytes_received,
            transport.bytes_sent,
            transport.bytes_received,
        ),
    }
}

// ---------------------------------------------------------------------------
// Connection pair
// ---------------------------------------------------------------------------

pub struct ConnectionPair {
    offerer: Arc<dyn Peer>,
    answerer: Arc<dyn Peer>,
    channel: Arc<dyn DataChannel>,
    shared: Arc<PairShared>,
    to_offerer: Arc<CandidateGate>,
    to_answerer: Arc<CandidateGate>,
    offerer_connected: watch::Receiver<Option<bool>>,
    answerer_connected: watch::Receiver<Option<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionPair {
    /// Create both peers and the offerer's data channel and start draining
    /// their events. Negotiation starts with [`ConnectionPair::negotiate`].
    pub async fn new(
        engine: &dyn Engine,
        options: PairOptions,
        stats: SharedStats,
        signals: mpsc::Sender<RunSignal>,
    ) -> Result<Self, EngineError> {
        let started = Instant::now();
        let descriptor = &options.descriptor;

        let offerer_config = PeerConfig {
            ice_servers: vec![IceServer {
                urls: vec![descriptor.uri()],
                username: descriptor.username.clone(),
                credential: descriptor.credential.clone(),
            }],
            transport_policy: descriptor.transport_policy(),
        };
        let answerer_config = PeerConfig {
            ice_servers: vec![IceServer::new(options.answerer_stun_url.clone())],
            transport_policy: TransportPolicy::All,
        };

        let (offerer, offerer_events) = engine.new_peer(offerer_config).await?;
        let (answerer, answerer_events) = match engine.new_peer(answerer_config).await {
            Ok(created) => created,
            Err(e) => {
                close_quietly(PeerRole::Offerer, offerer.as_ref()).await;
                return Err(e);
            }
        };

        let channel = match offerer
            .create_data_channel(DATA_CHANNEL_LABEL, ChannelInit::unreliable())
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly(PeerRole::Offerer, offerer.as_ref()).await;
                close_quietly(PeerRole::Answerer, answerer.as_ref()).await;
                return Err(e);
            }
        };
        if let Some(watermarks) = options.mode.watermarks() {
            channel
                .set_buffered_amount_low_threshold(watermarks.low)
                .await;
        }

        let (low_water, low_water_signal) = low_water_channel();
        let (channel_closed, _) = watch::channel(false);
        let shared = Arc::new(PairShared {
            mode: options.mode,
            stats,
            signals,
            started,
            overrides: options.overrides,
            first_send: Arc::new(OnceLock::new()),
            channel_closed,
            low_water,
            low_water_signal: Mutex::new(Some(low_water_signal)),
            offerer_channel: Mutex::new(None),
            answerer_channel: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        });

        let to_offerer = Arc::new(CandidateGate::new(offerer.clone(), PeerRole::Offerer));
        let to_answerer = Arc::new(CandidateGate::new(answerer.clone(), PeerRole::Answerer));

        let (offerer_tx, offerer_connected) = watch::channel(None);
        let (answerer_tx, answerer_connected) = watch::channel(None);

        let tasks = vec![
            spawn_peer_task(PeerTask {
                role: PeerRole::Offerer,
                peer: offerer.clone(),
                events: offerer_events,
                shared: shared.clone(),
                outbound: to_answerer.clone(),
                connected: offerer_tx,
                machine: PeerMachine::new(PeerRole::Offerer),
                first_message_seen: false,
            }),
            spawn_peer_task(PeerTask {
                role: PeerRole::Answerer,
                peer: answerer.clone(),
                events: answerer_events,
                shared: shared.clone(),
                outbound: to_offerer.clone(),
                connected: answerer_tx,
                machine: PeerMachine::new(PeerRole::Answerer),
                first_message_seen: false,
            }),
        ];

        debug!(
            uri = %options.descriptor.uri(),
            mode = ?options.mode,
            "connection pair created"
        );

        Ok(Self {
            offerer,
            answerer,
            channel,
            shared,
            to_offerer,
            to_answerer,
            offerer_connected,
            answerer_connected,
            tasks,
        })
    }

    /// Run the local offer/answer exchange. Any failure is fatal to the run.
    pub async fn negotiate(&self) -> Result<(), EngineError> {
        let offer = self.offerer.create_offer().await?;
        self.offerer.set_local_description(offer.clone()).await?;
        let offer = SessionDescription::from_json(&offer.to_json()?)?;
        self.answerer.set_remote_description(offer).await?;
        self.to_answerer.open().await;

        let answer = self.answerer.create_answer().await?;
        self.answerer.set_local_description(answer.clone()).await?;
        let answer = SessionDescription::from_json(&answer.to_json()?)?;
        self.offerer.set_remote_description(answer).await?;
        self.to_offerer.open().await;

        debug!("local SDP exchange complete");
        Ok(())
    }

    pub fn mode(&self) -> TestMode {
        self.shared.mode
    }

    /// Per-peer connected notifications: `Some(true)` on Connected,
    /// `Some(false)` on Failed or Closed.
    pub fn connected(&self, role: PeerRole) -> watch::Receiver<Option<bool>> {
        match role {
            PeerRole::Offerer => self.offerer_connected.clone(),
            PeerRole::Answerer => self.answerer_connected.clone(),
        }
    }

    pub async fn channel_opened(&self) -> bool {
        self.shared.offerer_channel.lock().await.is_some()
    }

    pub async fn close_channel(&self) {
        self.shared.channel_closed.send_replace(true);
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "failed to close data channel");
        }
    }

    /// Commit both peers' byte counters to stats.
    pub async fn commit_counters(&self) {
        commit_counters(&self.shared, PeerRole::Offerer, self.offerer.as_ref()).await;
        commit_counters(&self.shared, PeerRole::Answerer, self.answerer.as_ref()).await;
    }

    /// Close both peers. A failure closing one peer does not stop the other
    /// from being closed; the first error is returned.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.shared.channel_closed.send_replace(true);
        let mut first_error = None;
        for (role, peer) in [
            (PeerRole::Offerer, &self.offerer),
            (PeerRole::Answerer, &self.answerer),
        ] {
            if let Err(e) = peer.close().await {
                warn!(peer = %role, error = %e, "failed to close peer connection");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait for event and worker tasks to finish, aborting stragglers.
    pub async fn join(&mut self, timeout: Duration) {
        let mut handles = std::mem::take(&mut self.tasks);
        handles.append(&mut *self.shared.workers.lock().await);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            debug!(tasks = aborts.len(), "tasks did not finish in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Drop for ConnectionPair {
    fn drop(&mut self) {
        for handle in &self.tasks {
            handle.abort();
        }
    }
}

fn spawn_peer_task(task: PeerTask) -> JoinHandle<()> {
    tokio::spawn(task.run().in_current_span())
}

async fn close_quietly(role: PeerRole, peer: &dyn Peer) {
    if let Err(e) = peer.close().await {
        warn!(peer = %role, error = %e, "failed to close peer connection");
    }
}
