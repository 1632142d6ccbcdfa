//! End-to-end candidate runs over the in-process loopback engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::mpsc;

use iceperf::candidate::{CandidateDescriptor, CandidateType};
use iceperf::client::pair::EventOverrides;
use iceperf::client::{ClientError, ClientOptions, RunEnd, RunOutcome, TestClient};
use iceperf::engine::{IceCandidate, PeerState};
use iceperf::engine::loopback::{FailurePoint, LinkOutcome, LoopbackConfig, LoopbackEngine};
use iceperf::report::HttpReporter;
use iceperf::stats::PeerRole;

fn options(do_throughput: bool) -> ClientOptions {
    ClientOptions {
        provider: "loopback".to_string(),
        node: "test".to_string(),
        do_throughput,
        answerer_stun_url: "stun:stun.loopback.test:3478".to_string(),
        stun_duration: Duration::from_secs(2),
        turn_duration: Duration::from_secs(3),
        drain_grace: Duration::from_millis(100),
        ..Default::default()
    }
}

fn client(uri: &str, do_throughput: bool, engine: LoopbackEngine) -> TestClient {
    let descriptor = CandidateDescriptor::parse(uri)
        .unwrap()
        .with_credentials(Some("user".into()), Some("pass".into()));
    TestClient::new(Arc::new(engine), descriptor, options(do_throughput))
}

async fn run(uri: &str, do_throughput: bool, config: LoopbackConfig) -> RunOutcome {
    client(uri, do_throughput, LoopbackEngine::new(config)).run().await
}

#[tokio::test(start_paused = true)]
async fn test_stun_run_completes_without_data() {
    let outcome = run("stun:stun.loopback.test:3478", false, LoopbackConfig::default()).await;

    assert_eq!(outcome.end, RunEnd::Completed);
    assert!(outcome.elapsed < Duration::from_secs(2));
    assert!(outcome.connected());
    assert!(outcome.error.is_none());

    let stats = &outcome.stats;
    assert!(stats.is_finalized());
    assert!(stats.time_to_connected_state > 0.0);
    assert!(stats.throughput.is_empty());
    assert_eq!(stats.throughput_max, 0.0);
    assert_eq!(stats.offerer_dc_bytes_sent_total, 0);
    assert_eq!(stats.latency_first_packet, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_stun_ignores_throughput_flag() {
    let outcome = run("stun:stun.loopback.test:3478", true, LoopbackConfig::default()).await;
    assert_eq!(outcome.end, RunEnd::Completed);
    assert!(outcome.stats.throughput.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_turn_latency_run_completes_on_first_packet() {
    let outcome = run(
        "turn:turn.loopback.test:3478?transport=udp",
        false,
        LoopbackConfig::default(),
    )
    .await;

    assert_eq!(outcome.end, RunEnd::Completed);
    assert!(outcome.elapsed < Duration::from_secs(3));
    assert!(outcome.connected());
    assert!(outcome.stats.latency_first_packet >= 0.0);
    assert!(outcome.stats.throughput.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_turn_throughput_run_samples_until_deadline() {
    let outcome = run(
        "turns:turn.loopback.test:5349?transport=tcp",
        true,
        LoopbackConfig::default(),
    )
    .await;

    assert_eq!(outcome.end, RunEnd::DeadlineElapsed);
    assert!(outcome.connected());

    let stats = &outcome.stats;
    assert!(!stats.throughput.is_empty());
    assert_eq!(stats.throughput.len(), stats.throughput_instant.len());
    assert!(stats.throughput_max > 0.0);
    for instant in stats.throughput_instant.values() {
        assert!(*instant <= stats.throughput_max);
    }
    for key in stats.throughput.keys() {
        assert_eq!(key % 100, 0);
    }

    assert!(stats.answerer_dc_bytes_received_total > 0);
    assert!(stats.answerer_dc_bytes_received_total <= stats.offerer_dc_bytes_sent_total);
    assert!(stats.offerer_ice_transport_bytes_sent_total > 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_peer_aborts_early() {
    let config = LoopbackConfig {
        outcome: LinkOutcome::Fail {
            after: Duration::from_millis(100),
        },
        ..Default::default()
    };
    let outcome = run("turn:turn.loopback.test:3478?transport=udp", true, config).await;

    assert_eq!(outcome.end, RunEnd::Aborted);
    assert!(outcome.elapsed < Duration::from_secs(1));
    assert!(!outcome.connected());
    assert_eq!(outcome.stats.time_to_connected_state, 0.0);
    assert!(outcome.stats.throughput.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_after_connect_aborts_and_clears_connected() {
    let config = LoopbackConfig {
        outcome: LinkOutcome::ConnectThenFail {
            connect_after: Duration::from_millis(50),
            fail_after: Duration::from_millis(50),
        },
        ..Default::default()
    };
    let outcome = run("turn:turn.loopback.test:3478?transport=udp", true, config).await;

    assert_eq!(outcome.end, RunEnd::Aborted);
    assert!(outcome.elapsed < Duration::from_secs(1));
    assert!(!outcome.connected());
    assert!(!outcome.stats.connected);
    assert!(outcome.stats.time_to_connected_state > 0.0);
    assert!(outcome.stats.is_finalized());
}

#[tokio::test(start_paused = true)]
async fn test_stun_failure_after_connect_keeps_completion() {
    let config = LoopbackConfig {
        outcome: LinkOutcome::ConnectThenFail {
            connect_after: Duration::from_millis(50),
            fail_after: Duration::from_millis(50),
        },
        ..Default::default()
    };
    let outcome = run("stun:stun.loopback.test:3478", false, config).await;

    assert_eq!(outcome.end, RunEnd::Completed);
    assert!(outcome.connected());
}

#[tokio::test(start_paused = true)]
async fn test_answerer_failure_aborts_early() {
    let config = LoopbackConfig {
        outcome: LinkOutcome::AnswererFail {
            after: Duration::from_millis(100),
        },
        ..Default::default()
    };
    let outcome = run("turn:turn.loopback.test:3478?transport=udp", false, config).await;

    assert_eq!(outcome.end, RunEnd::Aborted);
    assert!(outcome.elapsed < Duration::from_secs(1));
    assert!(!outcome.connected());
    assert!(!outcome.stats.connected);
    assert_eq!(outcome.stats.time_to_connected_state, 0.0);
    assert!(outcome.stats.is_finalized());
}

#[tokio::test(start_paused = true)]
async fn test_never_connecting_runs_to_deadline() {
    let config = LoopbackConfig {
        outcome: LinkOutcome::Never,
        ..Default::default()
    };
    let outcome = run("stun:stun.loopback.test:3478", false, config).await;

    assert_eq!(outcome.end, RunEnd::DeadlineElapsed);
    assert!(outcome.elapsed >= Duration::from_secs(2));
    assert!(!outcome.connected());
}

#[tokio::test(start_paused = true)]
async fn test_only_reflexive_and_relay_candidates_are_timed() {
    let config = LoopbackConfig {
        offerer_candidates: vec![CandidateType::Host, CandidateType::Srflx, CandidateType::Relay],
        outcome: LinkOutcome::Never,
        ..Default::default()
    };
    let outcome = run("stun:stun.loopback.test:3478", false, config).await;

    let timings = &outcome.stats.offerer_candidate_timings;
    let kinds: Vec<CandidateType> = timings.iter().map(|t| t.candidate_type).collect();
    assert_eq!(kinds, vec![CandidateType::Srflx, CandidateType::Relay]);
    assert!(timings[0].elapsed_ms <= timings[1].elapsed_ms);
    assert_eq!(
        outcome.stats.offerer_time_to_receive_candidate,
        timings[0].elapsed_ms
    );
}

#[tokio::test(start_paused = true)]
async fn test_candidates_reach_the_other_peer() {
    let engine = LoopbackEngine::default();
    let outcome = client("stun:stun.loopback.test:3478", false, engine.clone())
        .run()
        .await;
    assert!(outcome.connected());

    let delivered = engine.delivered_candidates().await;
    assert!(!delivered.is_empty());
    assert!(delivered.iter().all(|(_, kind)| kind.is_timed()));
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_failure_still_produces_stats() {
    for point in [FailurePoint::NewPeer, FailurePoint::CreateOffer, FailurePoint::CreateAnswer] {
        let config = LoopbackConfig {
            fail_at: Some(point),
            ..Default::default()
        };
        let outcome = run("turn:turn.loopback.test:3478?transport=udp", false, config).await;

        assert_eq!(outcome.end, RunEnd::NegotiationFailed, "{point:?}");
        assert!(matches!(outcome.error, Some(ClientError::Negotiation(_))));
        assert!(outcome.stats.is_finalized());
        assert!(!outcome.connected());
        assert_eq!(outcome.stats.scheme, "turn");
        assert_eq!(outcome.stats.port, "3478");
    }
}

#[tokio::test(start_paused = true)]
async fn test_teardown_failure_is_reported() {
    let config = LoopbackConfig {
        fail_at: Some(FailurePoint::Close),
        ..Default::default()
    };
    let outcome = run("stun:stun.loopback.test:3478", false, config).await;

    assert_eq!(outcome.end, RunEnd::Completed);
    assert!(matches!(outcome.error, Some(ClientError::Teardown(_))));
    assert!(outcome.connected());
    assert!(outcome.stats.is_finalized());
}

#[tokio::test(start_paused = true)]
async fn test_overrides_replace_default_handlers() {
    let candidates = Arc::new(AtomicUsize::new(0));
    let states = Arc::new(AtomicUsize::new(0));
    let overrides = EventOverrides {
        on_candidate: Some({
            let candidates = candidates.clone();
            Arc::new(move |_: PeerRole, _: &IceCandidate| {
                candidates.fetch_add(1, Ordering::SeqCst);
            })
        }),
        on_state_change: Some({
            let states = states.clone();
            Arc::new(move |_: PeerRole, _: PeerState| {
                states.fetch_add(1, Ordering::SeqCst);
            })
        }),
    };

    let outcome = client(
        "stun:stun.loopback.test:3478",
        false,
        LoopbackEngine::default(),
    )
    .with_overrides(overrides)
    .run()
    .await;

    assert!(candidates.load(Ordering::SeqCst) > 0);
    assert!(states.load(Ordering::SeqCst) > 0);
    assert!(outcome.stats.offerer_candidate_timings.is_empty());
    assert!(!outcome.connected());
    assert_eq!(outcome.end, RunEnd::DeadlineElapsed);
}

#[derive(Clone)]
struct Collector {
    tx: mpsc::UnboundedSender<(Option<String>, serde_json::Value)>,
}

async fn insert(
    State(collector): State<Collector>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let _ = collector.tx.send((auth, body));
    Json(serde_json::json!({ "ok": true }))
}

#[tokio::test]
async fn test_finished_stats_are_posted_to_reporter() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/insert", post(insert))
        .with_state(Collector { tx });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let reporter = HttpReporter::new(format!("http://{addr}/insert"), "secret").unwrap();
    let outcome = client(
        "stun:stun.loopback.test:3478",
        false,
        LoopbackEngine::default(),
    )
    .with_sink(Arc::new(reporter))
    .run()
    .await;

    let (auth, body) = rx.recv().await.unwrap();
    assert_eq!(auth.as_deref(), Some("Bearer secret"));
    assert_eq!(body["runId"], outcome.stats.run_id.as_str());
    assert_eq!(body["provider"], "loopback");
    assert_eq!(body["connected"], true);
}
