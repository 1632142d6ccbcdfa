//! Throughput driver: the flow-controlled send loop on the offerer and the
//! periodic sampler on the answerer.
//!
//! The sender keeps the channel saturated without letting the engine queue
//! grow without bound: once buffered bytes pass the high watermark it parks
//! on a single-slot wake-up that the engine's buffered-amount-low event
//! fills.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::{DataChannel, Peer, PeerState};
use crate::stats::{SharedStats, ThroughputSample};

/// Size of every test message.
pub const PAYLOAD_SIZE: usize = 1024;

/// Receive-side sampling cadence.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

const BITS_PER_MEGABIT: f64 = 1024.0 * 1024.0;

/// The sender yields to the scheduler every this many messages.
const YIELD_EVERY: u64 = 64;

// ---------------------------------------------------------------------------
// Watermarks
// ---------------------------------------------------------------------------

/// Buffered-amount thresholds for the send loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Engine fires buffered-amount-low when the buffer drops below this.
    pub low: usize,
    /// Sender stops issuing sends above this.
    pub high: usize,
}

impl Watermarks {
    /// First-packet latency check.
    pub const LATENCY: Watermarks = Watermarks {
        low: 512 * 1024,
        high: 1024 * 1024,
    };

    /// Full throughput run, sized for high-bandwidth relays.
    pub const THROUGHPUT: Watermarks = Watermarks {
        low: 4 * 1024 * 1024,
        high: 8 * 1024 * 1024,
    };
}

// ---------------------------------------------------------------------------
// Low-water signal
// ---------------------------------------------------------------------------

/// Producer half of the single-slot buffered-amount-low wake-up.
///
/// Notifying while a wake-up is already pending is a no-op.
#[derive(Debug, Clone)]
pub struct LowWaterNotifier {
    tx: mpsc::Sender<()>,
}

impl LowWaterNotifier {
    pub fn notify(&self) {
        // Full means a wake-up is already pending; closed means the sender
        // is gone. Either way there is nothing to do.
        let _ = self.tx.try_send(());
    }
}

/// Consumer half, owned by the send loop.
#[derive(Debug)]
pub struct LowWaterSignal {
    rx: mpsc::Receiver<()>,
}

impl LowWaterSignal {
    /// Wait for a wake-up. Returns `false` once every notifier is dropped.
    pub async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

pub fn low_water_channel() -> (LowWaterNotifier, LowWaterSignal) {
    let (tx, rx) = mpsc::channel(1);
    (LowWaterNotifier { tx }, LowWaterSignal { rx })
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

pub struct SenderContext {
    pub channel: Arc<dyn DataChannel>,
    pub watermarks: Watermarks,
    pub low_water: LowWaterSignal,
    /// Flips to `true` when the channel or its peer closes.
    pub closed: watch::Receiver<bool>,
    /// Set on the first send; read by the receiver for first-packet latency.
    pub first_send: Arc<OnceLock<Instant>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderReport {
    pub messages: u64,
    pub bytes: u64,
    /// Times the loop parked on the high watermark.
    pub stalls: u64,
}

/// Send fixed-size payloads as fast as the channel accepts them until the
/// channel closes or a send fails.
pub async fn run_sender(ctx: SenderContext) -> SenderReport {
    let SenderContext {
        channel,
        watermarks,
        mut low_water,
        mut closed,
        first_send,
    } = ctx;

    channel
        .set_buffered_amount_low_threshold(watermarks.low)
        .await;

    let payload = Bytes::from(vec![0u8; PAYLOAD_SIZE]);
    let mut report = SenderReport::default();

    info!(
        label = channel.label(),
        low = watermarks.low,
        high = watermarks.high,
        "starting send loop"
    );

    'send: loop {
        if *closed.borrow() {
            break;
        }

        while channel.buffered_amount().await > watermarks.high {
            report.stalls += 1;
            tokio::select! {
                biased;

                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break 'send;
                    }
                }
                woke = low_water.wait() => {
                    if !woke {
                        break 'send;
                    }
                }
            }
        }

        first_send.get_or_init(Instant::now);

        match channel.send(&payload).await {
            Ok(n) => {
                report.messages += 1;
                report.bytes += n as u64;
            }
            Err(e) => {
                debug!(error = %e, "send failed, stopping send loop");
                break;
            }
        }

        if report.messages % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    info!(
        messages = report.messages,
        bytes = report.bytes,
        stalls = report.stalls,
        "send loop finished"
    );
    report
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

pub struct SamplerContext {
    pub peer: Arc<dyn Peer>,
    pub channel: Arc<dyn DataChannel>,
    pub stats: SharedStats,
    pub interval: Duration,
}

/// Sample received bytes on every tick while the peer stays connected.
/// Returns the number of samples recorded.
pub async fn run_sampler(ctx: SamplerContext) -> u64 {
    let opened = Instant::now();
    let interval_ms = ctx.interval.as_millis() as u64;

    let mut ticker = tokio::time::interval_at(opened + ctx.interval, ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_bytes = 0u64;
    let mut last_at = opened;
    let mut samples = 0u64;

    // Ticks never fire early and Delay spaces late ones a full interval
    // apart, so bucket keys are strictly increasing.

    loop {
        ticker.tick().await;
        if ctx.peer.connection_state() != PeerState::Connected {
            break;
        }

        let now = Instant::now();
        let bytes = ctx.channel.counters().await.bytes_received;
        let sample = ThroughputSample {
            elapsed_ms: (now - opened).as_millis() as u64 / interval_ms * interval_ms,
            cumulative_mbps: mbps(bytes, now - opened),
            instant_mbps: mbps(bytes.saturating_sub(last_bytes), now - last_at),
        };
        ctx.stats.lock().await.add_throughput(sample);

        debug!(
            elapsed_ms = sample.elapsed_ms,
            cumulative_mbps = sample.cumulative_mbps,
            instant_mbps = sample.instant_mbps,
            "throughput sample"
        );

        last_bytes = bytes;
        last_at = now;
        samples += 1;
    }

    info!(
        samples,
        elapsed_ms = opened.elapsed().as_millis() as u64,
        throughput_mbps = mbps(last_bytes, last_at - opened),
        "sampler finished"
    );
    samples
}

/// Convert a byte count over a duration into megabits per second.
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs / BITS_PER_MEGABIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ChannelCounters, ChannelInit, EngineError, IceCandidate, SessionDescription,
        TransportCounters,
    };
    use crate::stats::Stats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockChannel {
        buffered: AtomicUsize,
        sends: AtomicU64,
        sends_above_high: AtomicU64,
        high: AtomicUsize,
        received: AtomicU64,
        closed: AtomicBool,
    }

    #[async_trait]
    impl DataChannel for MockChannel {
        fn label(&self) -> &str {
            "mock"
        }

        async fn send(&self, data: &Bytes) -> Result<usize, EngineError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(EngineError::ChannelClosed);
            }
            if self.buffered.load(Ordering::SeqCst) > self.high.load(Ordering::SeqCst) {
                self.sends_above_high.fetch_add(1, Ordering::SeqCst);
            }
            self.buffered.fetch_add(data.len(), Ordering::SeqCst);
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(data.len())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}

        async fn counters(&self) -> ChannelCounters {
            ChannelCounters {
                bytes_sent: 0,
                bytes_received: self.received.load(Ordering::SeqCst),
            }
        }

        async fn close(&self) -> Result<(), EngineError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockPeer {
        state: AtomicU8,
    }

    impl MockPeer {
        fn set_connected(&self, connected: bool) {
            self.state.store(u8::from(connected), Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Peer for MockPeer {
        async fn create_data_channel(
            &self,
            _label: &str,
            _init: ChannelInit,
        ) -> Result<Arc<dyn DataChannel>, EngineError> {
            Err(EngineError::DataChannel("mock".into()))
        }
        async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
            Err(EngineError::Description("mock".into()))
        }
        async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
            Err(EngineError::Description("mock".into()))
        }
        async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), EngineError> {
            Ok(())
        }
        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), EngineError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), EngineError> {
            Ok(())
        }
        fn connection_state(&self) -> PeerState {
            if self.state.load(Ordering::SeqCst) == 1 {
                PeerState::Connected
            } else {
                PeerState::Closed
            }
        }
        async fn transport_counters(&self) -> TransportCounters {
            TransportCounters::default()
        }
        async fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn sender_ctx(
        channel: Arc<MockChannel>,
        watermarks: Watermarks,
    ) -> (SenderContext, LowWaterNotifier, watch::Sender<bool>) {
        let (notifier, low_water) = low_water_channel();
        let (closed_tx, closed) = watch::channel(false);
        channel.high.store(watermarks.high, Ordering::SeqCst);
        let ctx = SenderContext {
            channel,
            watermarks,
            low_water,
            closed,
            first_send: Arc::new(OnceLock::new()),
        };
        (ctx, notifier, closed_tx)
    }

    #[test]
    fn test_mbps() {
        assert_eq!(mbps(0, Duration::from_secs(1)), 0.0);
        assert_eq!(mbps(1024, Duration::ZERO), 0.0);
        assert_eq!(mbps(128 * 1024, Duration::from_secs(1)), 1.0);
        assert_eq!(mbps(128 * 1024, Duration::from_millis(500)), 2.0);
    }

    #[tokio::test]
    async fn test_low_water_coalesces() {
        let (notifier, mut signal) = low_water_channel();
        notifier.notify();
        notifier.notify();
        notifier.notify();
        assert!(signal.wait().await);
        assert!(signal.rx.try_recv().is_err());
    }

    #[test]
    fn test_low_water_wait_pends_until_notified() {
        let (notifier, mut signal) = low_water_channel();
        let mut wait = tokio_test::task::spawn(signal.wait());
        tokio_test::assert_pending!(wait.poll());

        notifier.notify();
        assert!(wait.is_woken());
        assert!(tokio_test::assert_ready!(wait.poll()));
        drop(wait);

        drop(notifier);
        let mut wait = tokio_test::task::spawn(signal.wait());
        assert!(!tokio_test::assert_ready!(wait.poll()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_blocks_above_high_watermark_and_resumes() {
        let channel = Arc::new(MockChannel::default());
        let watermarks = Watermarks::LATENCY;
        channel.buffered.store(watermarks.high + 1, Ordering::SeqCst);

        let (ctx, notifier, closed_tx) = sender_ctx(channel.clone(), watermarks);
        let handle = tokio::spawn(run_sender(ctx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.sends.load(Ordering::SeqCst), 0);

        // Engine drained the buffer and fired buffered-amount-low.
        channel.buffered.store(0, Ordering::SeqCst);
        notifier.notify();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let sends = channel.sends.load(Ordering::SeqCst);
        assert!(sends > 0, "sender should resume after low-water notification");
        // Refills to just past the high watermark, then parks again.
        assert_eq!(sends as usize, watermarks.high / PAYLOAD_SIZE + 1);
        assert_eq!(channel.sends_above_high.load(Ordering::SeqCst), 0);

        closed_tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sender must stop after close")
            .unwrap();
        assert_eq!(report.messages, sends);
        assert!(report.stalls >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_not_left_blocked_after_close() {
        let channel = Arc::new(MockChannel::default());
        let watermarks = Watermarks::THROUGHPUT;
        channel.buffered.store(watermarks.high * 2, Ordering::SeqCst);

        let (ctx, _notifier, closed_tx) = sender_ctx(channel.clone(), watermarks);
        let handle = tokio::spawn(run_sender(ctx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        closed_tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("blocked sender must observe close")
            .unwrap();
        assert_eq!(report.messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_stops_when_notifier_dropped() {
        let channel = Arc::new(MockChannel::default());
        let watermarks = Watermarks::LATENCY;
        channel.buffered.store(watermarks.high * 2, Ordering::SeqCst);

        let (ctx, notifier, _closed_tx) = sender_ctx(channel, watermarks);
        let handle = tokio::spawn(run_sender(ctx));
        drop(notifier);
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("sender must stop when no wake-up can arrive")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sender_stops_on_send_error() {
        let channel = Arc::new(MockChannel::default());
        channel.closed.store(true, Ordering::SeqCst);
        let (ctx, _notifier, _closed_tx) = sender_ctx(channel, Watermarks::LATENCY);
        let first_send = ctx.first_send.clone();

        let report = tokio::time::timeout(Duration::from_secs(1), run_sender(ctx))
            .await
            .expect("send error must end the loop");
        assert_eq!(report.messages, 0);
        assert!(first_send.get().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_records_until_disconnected() {
        let peer = Arc::new(MockPeer {
            state: AtomicU8::new(1),
        });
        let channel = Arc::new(MockChannel::default());
        let stats = Stats::new("run", chrono::Utc::now()).shared();

        let handle = tokio::spawn(run_sampler(SamplerContext {
            peer: peer.clone(),
            channel: channel.clone(),
            stats: stats.clone(),
            interval: SAMPLE_INTERVAL,
        }));

        for _ in 0..5 {
            channel.received.fetch_add(128 * 1024, Ordering::SeqCst);
            tokio::time::sleep(SAMPLE_INTERVAL).await;
        }
        peer.set_connected(false);

        let samples = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sampler must stop once disconnected")
            .unwrap();
        assert!(samples >= 4);

        let stats = stats.lock().await;
        assert_eq!(stats.throughput.len() as u64, samples);
        let keys: Vec<u64> = stats.throughput.keys().copied().collect();
        assert_eq!(keys[0], 100);
        assert!(keys.windows(2).all(|w| w[1] - w[0] == 100));
        assert!(stats.throughput_max > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_sample_is_keyed_by_measured_elapsed() {
        let peer = Arc::new(MockPeer {
            state: AtomicU8::new(1),
        });
        let channel = Arc::new(MockChannel::default());
        let stats = Stats::new("run", chrono::Utc::now()).shared();

        // Holding the lock stalls the sampler on its first sample.
        let guard = stats.lock().await;
        let handle = tokio::spawn(run_sampler(SamplerContext {
            peer: peer.clone(),
            channel: channel.clone(),
            stats: stats.clone(),
            interval: SAMPLE_INTERVAL,
        }));
        channel.received.fetch_add(64 * 1024, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(450)).await;
        drop(guard);

        tokio::time::sleep(Duration::from_millis(120)).await;
        peer.set_connected(false);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sampler must stop once disconnected")
            .unwrap();

        let stats = stats.lock().await;
        let keys: Vec<u64> = stats.throughput.keys().copied().collect();
        assert_eq!(&keys[..3], &[100, 400, 500]);
        assert!(keys.iter().all(|k| k % 100 == 0));
    }
}
