//! Test client: runs one candidate from pair construction to finalized stats.
//!
//! A run moves `Created → Negotiating → Running → Stopping → Done`. While
//! running, the client races an early-completion or abort signal from the
//! connection pair against the test deadline; whichever fires first ends
//! the run. Stats are always produced, even when negotiation fails.

pub mod pair;
pub mod peer;
pub mod throughput;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::candidate::CandidateDescriptor;
use crate::engine::{Engine, EngineError};
use crate::report::ReportSink;
use crate::stats::{PeerRole, SharedStats, Stats};

use self::pair::{ConnectionPair, EventOverrides, PairOptions, TestMode};

const SIGNAL_QUEUE_DEPTH: usize = 8;

/// How long teardown waits for each background task before aborting it.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("negotiation failed: {0}")]
    Negotiation(#[source] EngineError),

    #[error("teardown failed: {0}")]
    Teardown(#[source] EngineError),

    #[error("failed to serialize stats: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Created,
    Negotiating,
    Running,
    Stopping,
    Done,
}

/// Why the running phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Connectivity or first-packet delivery confirmed early.
    Completed,
    /// A peer reported Failed.
    Aborted,
    DeadlineElapsed,
    NegotiationFailed,
}

/// Early-exit signals raised by the connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Completed,
    Aborted(PeerRole),
}

/// Per-run settings resolved by the caller.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub provider: String,
    pub node: String,
    /// Shared by every candidate in one sweep.
    pub test_run_id: String,
    pub test_run_started_at: DateTime<Utc>,
    pub do_throughput: bool,
    pub answerer_stun_url: String,
    pub stun_duration: Duration,
    pub turn_duration: Duration,
    pub drain_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            provider: String::new(),
            node: String::new(),
            test_run_id: Uuid::new_v4().to_string(),
            test_run_started_at: Utc::now(),
            do_throughput: false,
            answerer_stun_url: "stun:stun.l.google.com:19302".to_string(),
            stun_duration: Duration::from_secs(2),
            turn_duration: Duration::from_secs(20),
            drain_grace: Duration::from_secs(1),
        }
    }
}

/// Result of one run. `stats` is finalized.
#[derive(Debug)]
pub struct RunOutcome {
    pub stats: Stats,
    pub end: RunEnd,
    pub elapsed: Duration,
    /// Negotiation or teardown failure, returned for the caller to act on.
    pub error: Option<ClientError>,
}

impl RunOutcome {
    pub fn connected(&self) -> bool {
        self.stats.connected
    }
}

pub struct TestClient {
    engine: Arc<dyn Engine>,
    descriptor: CandidateDescriptor,
    options: ClientOptions,
    sink: Option<Arc<dyn ReportSink>>,
    overrides: EventOverrides,
    phase: watch::Sender<RunPhase>,
}

impl TestClient {
    pub fn new(
        engine: Arc<dyn Engine>,
        descriptor: CandidateDescriptor,
        options: ClientOptions,
    ) -> Self {
        let (phase, _) = watch::channel(RunPhase::Created);
        Self {
            engine,
            descriptor,
            options,
            sink: None,
            overrides: EventOverrides::default(),
            phase,
        }
    }

    /// Deliver finalized stats to `sink` at the end of the run.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_overrides(mut self, overrides: EventOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn descriptor(&self) -> &CandidateDescriptor {
        &self.descriptor
    }

    pub fn mode(&self) -> TestMode {
        TestMode::select(&self.descriptor, self.options.do_throughput)
    }

    pub fn deadline(&self) -> Duration {
        match self.mode() {
            TestMode::Connectivity => self.options.stun_duration,
            TestMode::Latency | TestMode::Throughput => self.options.turn_duration,
        }
    }

    pub fn phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Run the test to completion.
    pub async fn run(&self) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "candidate_run",
            provider = %self.options.provider,
            run_id = %run_id,
            scheme = %self.descriptor.scheme,
            protocol = %self.descriptor.protocol,
            port = self.descriptor.port,
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: String) -> RunOutcome {
        let started = Instant::now();
        let mode = self.mode();
        let deadline = self.deadline();

        let mut stats = Stats::new(
            self.options.test_run_id.clone(),
            self.options.test_run_started_at,
        );
        stats.set_run_id(run_id);
        stats.set_provider(self.options.provider.clone());
        stats.set_node(self.options.node.clone());
        stats.set_descriptor(&self.descriptor);
        let stats = stats.shared();

        info!(
            uri = %self.descriptor.uri(),
            mode = ?mode,
            deadline_ms = deadline.as_millis() as u64,
            "starting candidate run"
        );

        self.set_phase(RunPhase::Negotiating);
        let (signal_tx, mut signal_rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        let options = PairOptions {
            descriptor: self.descriptor.clone(),
            answerer_stun_url: self.options.answerer_stun_url.clone(),
            mode,
            overrides: self.overrides.clone(),
        };
        let mut pair =
            match ConnectionPair::new(self.engine.as_ref(), options, stats.clone(), signal_tx).await
            {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to build connection pair");
                    return self
                        .finish(
                            stats,
                            RunEnd::NegotiationFailed,
                            started,
                            Some(ClientError::Negotiation(e)),
                        )
                        .await;
                }
            };

        let mut error = None;
        let end = {
            let negotiation = pair.negotiate();
            tokio::pin!(negotiation);
            let timer = tokio::time::sleep(deadline);
            tokio::pin!(timer);
            let mut negotiated = false;

            self.set_phase(RunPhase::Running);
            loop {
                tokio::select! {
                    result = &mut negotiation, if !negotiated => {
                        negotiated = true;
                        if let Err(e) = result {
                            error!(error = %e, "negotiation failed");
                            error = Some(ClientError::Negotiation(e));
                            break RunEnd::NegotiationFailed;
                        }
                    }
                    Some(signal) = signal_rx.recv() => match signal {
                        RunSignal::Completed => break RunEnd::Completed,
                        RunSignal::Aborted(role) => {
                            warn!(peer = %role, "aborting run");
                            break RunEnd::Aborted;
                        }
                    },
                    _ = &mut timer => break RunEnd::DeadlineElapsed,
                }
            }
        };

        self.set_phase(RunPhase::Stopping);
        debug!(end = ?end, "stopping run");

        let drain = mode.drives_data() && pair.channel_opened().await;
        pair.close_channel().await;
        if drain {
            tokio::time::sleep(self.options.drain_grace).await;
        }
        pair.commit_counters().await;
        if let Err(e) = pair.close().await {
            error.get_or_insert(ClientError::Teardown(e));
        }
        pair.join(TASK_JOIN_TIMEOUT).await;

        self.finish(stats, end, started, error).await
    }

    async fn finish(
        &self,
        stats: SharedStats,
        end: RunEnd,
        started: Instant,
        mut error: Option<ClientError>,
    ) -> RunOutcome {
        let snapshot = {
            let mut stats = stats.lock().await;
            stats.finalize();
            stats.clone()
        };

        match snapshot.to_json() {
            Ok(json) => info!(individual_test_completed = true, stats = %json, "candidate run finished"),
            Err(e) => {
                warn!(error = %e, "failed to serialize stats");
                error.get_or_insert(ClientError::Serialize(e));
            }
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.deliver(&snapshot).await {
                warn!(error = %e, "failed to deliver stats");
            }
        }

        self.set_phase(RunPhase::Done);
        RunOutcome {
            stats: snapshot,
            end,
            elapsed: started.elapsed(),
            error,
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        debug!(phase = ?phase, "run phase");
        self.phase.send_replace(phase);
    }
}
