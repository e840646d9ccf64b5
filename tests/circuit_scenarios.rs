//! End-to-end scenarios over an in-memory relay network
//!
//! Each test drives the real manager/circuit/stream stack against the
//! scripted relay chain in `common`: real handshakes, real onion
//! crypto, real SENDME accounting.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{RelaySpec, TestNet, TEST_DESTROY_REASON};
use tor_circuits::events::{NullBuildEventSink, ProgressSink};
use tor_circuits::{
    BuildEventSink, CircuitBuildEvent, CircuitKind, CircuitManager, CircuitManagerConfig,
    DirectoryStreamRequest, ErrorCode, ExitTarget, StreamStatus, TorError,
};

/// Config with short timers so tests run quickly.
fn fast_config() -> CircuitManagerConfig {
    CircuitManagerConfig {
        clean_circuit_floor: 1,
        max_pending_circuits: 2,
        build_timeout: Duration::from_secs(5),
        max_dirty_lifetime: Duration::from_secs(600),
        stream_open_timeout: Duration::from_secs(2),
        control_response_timeout: Duration::from_secs(2),
        request_deadline: Duration::from_secs(10),
        tick_interval: Duration::from_millis(50),
        first_hop_fast_create: false,
    }
}

/// Config whose scheduler matches requests but never builds circuits.
fn match_only_config() -> CircuitManagerConfig {
    CircuitManagerConfig {
        clean_circuit_floor: 0,
        max_pending_circuits: 0,
        ..fast_config()
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn three_relay_net() -> Arc<TestNet> {
    TestNet::new(&[
        RelaySpec::guard("relay1"),
        RelaySpec::middle("relay2"),
        RelaySpec::exit("relay3", &["accept *:80", "reject *:*"]),
    ])
}

/// Scenario 1: the scheduler builds a clean circuit ending at the only
/// exit, and an exit request completes over it, dirtying it.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_build_and_open() {
    common::init_logging();
    let net = three_relay_net();
    let manager = net.manager(fast_config());
    manager.start_building_circuits();

    wait_until("a clean circuit", || !manager.clean_circuits().is_empty()).await;
    let clean = manager.clean_circuits().into_iter().next().unwrap();
    assert_eq!(clean.hop_count(), 3);
    assert_eq!(clean.last_relay().unwrap().nickname, "relay3");
    assert_eq!(clean.kind(), CircuitKind::General);

    let response = manager.open_exit_stream_to("example.com", 80).await;
    assert_eq!(response.status, StreamStatus::StreamOpened);
    let stream = response.into_stream().unwrap();

    let (pending, active, clean) = manager.circuit_membership(stream.circuit());
    assert!(!pending);
    assert!(active, "carrying circuit stays active");
    assert!(!clean, "carrying circuit is no longer clean");

    manager.shutdown().await;
}

/// Scenario 2: the first matching circuit answers BEGIN with END; the
/// request is retried on another circuit, and the failing exit target
/// is remembered on the first circuit.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_exit_failure_fallback() {
    common::init_logging();
    let net = TestNet::new(&[
        RelaySpec::guard("relay1"),
        RelaySpec::middle("relay2"),
        RelaySpec::exit("relay3", &["accept *:80", "reject *:*"]),
        RelaySpec::exit("relay4", &["accept *:80", "reject *:*"]),
    ]);
    net.fail_begins_at("relay3");

    let manager = net.manager(match_only_config());
    manager.start_building_circuits();

    let first = manager.create_new_circuit(CircuitKind::General);
    assert!(
        first
            .open_circuit(
                vec![net.relay("relay1"), net.relay("relay2"), net.relay("relay3")],
                &NullBuildEventSink,
            )
            .await
    );
    assert!(first.is_connected());

    let target = ExitTarget::to_host("example.com", 80);
    assert!(first.can_handle_exit_to(&target));

    let request = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.open_exit_stream_to("example.com", 80).await })
    };

    // The matcher's attempt on the relay3 circuit fails with END and
    // lands in the failed-exit memo.
    wait_until("failed-exit memo", || !first.can_handle_exit_to(&target)).await;
    assert!(first.is_connected(), "END does not kill the circuit");

    // A circuit ending at relay4 serves the queued request.
    let second = manager.create_new_circuit(CircuitKind::General);
    assert!(
        second
            .open_circuit(
                vec![net.relay("relay1"), net.relay("relay2"), net.relay("relay4")],
                &NullBuildEventSink,
            )
            .await
    );

    let response = request.await.unwrap();
    assert_eq!(response.status, StreamStatus::StreamOpened);
    let stream = response.into_stream().unwrap();
    assert_eq!(stream.circuit().serial(), second.serial());

    manager.shutdown().await;
}

/// Scenario 3: three consecutive stream-open timeouts destroy the
/// circuit.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_stream_timeout_accounting() {
    common::init_logging();
    let net = three_relay_net();
    net.behavior.drop_connected.store(true, Ordering::SeqCst);

    let mut config = fast_config();
    config.stream_open_timeout = Duration::from_millis(100);
    let manager = net.manager(config);

    let circuit = manager.create_new_circuit(CircuitKind::General);
    assert!(
        circuit
            .open_circuit(
                vec![net.relay("relay1"), net.relay("relay2"), net.relay("relay3")],
                &NullBuildEventSink,
            )
            .await
    );

    let target = ExitTarget::to_host("example.com", 80);
    for attempt in 1..=3 {
        let err = circuit.open_exit_stream(&target).await.unwrap_err();
        assert!(
            matches!(err, TorError::StreamTimeout),
            "attempt {}: {:?}",
            attempt,
            err
        );
    }

    assert!(circuit.is_closed(), "timeout threshold destroys the circuit");
    let (pending, active, clean) = manager.circuit_membership(&circuit);
    assert!(!pending && !active && !clean);

    manager.shutdown().await;
}

/// Scenario 4a: aborting a blocked caller removes its request from the
/// queue.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_request_cancellation() {
    common::init_logging();
    let net = TestNet::new(&[RelaySpec::guard("relay1"), RelaySpec::middle("relay2")]);
    let manager = net.manager(match_only_config());
    manager.start_building_circuits();

    let request = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.open_exit_stream_to("example.com", 80).await })
    };
    wait_until("request queued", || manager.pending_request_count() == 1).await;

    request.abort();
    wait_until("request removed", || manager.pending_request_count() == 0).await;

    manager.shutdown().await;
}

/// Scenario 4b: shutdown completes blocked callers with an
/// interruption response.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_shutdown_interrupts_pending_request() {
    common::init_logging();
    let net = TestNet::new(&[RelaySpec::guard("relay1"), RelaySpec::middle("relay2")]);
    let manager = net.manager(match_only_config());
    manager.start_building_circuits();

    let request = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.open_exit_stream_to("example.com", 80).await })
    };
    wait_until("request queued", || manager.pending_request_count() == 1).await;

    manager.shutdown().await;
    let response = request.await.unwrap();
    assert_eq!(response.status, StreamStatus::StreamError);
    assert_eq!(response.error_code(), Some(ErrorCode::Interrupted));
    assert_eq!(manager.pending_request_count(), 0);
}

struct RecordingProgress(Mutex<Vec<u32>>);

impl ProgressSink for RecordingProgress {
    fn notify_event(&self, code: u32) {
        self.0.lock().unwrap().push(code);
    }
}

/// Scenario 5: a directory stream builds exactly one one-hop circuit
/// and fires the milestones in order.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_directory_stream() {
    common::init_logging();
    let net = TestNet::new(&[RelaySpec::guard("dirserver")]);
    let progress = Arc::new(RecordingProgress(Mutex::new(Vec::new())));

    let manager = CircuitManager::with_sinks(
        match_only_config(),
        net.directory(),
        net.transport(),
        Arc::clone(&progress) as Arc<dyn ProgressSink>,
        Arc::new(NullBuildEventSink),
    )
    .unwrap();

    let request = DirectoryStreamRequest::with_events(net.relay("dirserver"), 15, 20);
    let response = manager.open_directory_stream(request).await;
    assert!(response.is_opened(), "{:?}", response.error);
    let stream = response.into_stream().unwrap();

    assert!(stream.circuit().is_directory());
    assert_eq!(stream.circuit().hop_count(), 1);
    assert_eq!(manager.active_circuits().len(), 1);
    assert_eq!(*progress.0.lock().unwrap(), vec![15, 20]);

    manager.shutdown().await;
}

/// Scenario 6: a DESTROY cell mid-stream aborts every stream with the
/// destroy reason, and the circuit leaves all registry sets.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_destroy_propagation() {
    common::init_logging();
    let net = three_relay_net();
    let manager = net.manager(match_only_config());

    let circuit = manager.create_new_circuit(CircuitKind::General);
    assert!(
        circuit
            .open_circuit(
                vec![net.relay("relay1"), net.relay("relay2"), net.relay("relay3")],
                &NullBuildEventSink,
            )
            .await
    );

    let target = ExitTarget::to_host("example.com", 80);
    let mut stream = circuit.open_exit_stream(&target).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    assert_eq!(stream.read_some().await.unwrap().unwrap(), b"hello");

    net.destroy_all_circuits();

    let err = loop {
        match stream.read_some().await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("expected an abort, got clean EOF"),
            Err(e) => break e,
        }
    };
    match err {
        TorError::CircuitDestroyed { reason, .. } => assert_eq!(reason, TEST_DESTROY_REASON),
        other => panic!("expected CircuitDestroyed, got {:?}", other),
    }

    wait_until("registry cleared", || {
        manager.circuit_membership(&circuit) == (false, false, false)
    })
    .await;
    assert!(circuit.is_closed());

    manager.shutdown().await;
}

/// Data crosses both SENDME thresholds and still round-trips intact.
#[tokio::test(flavor = "multi_thread")]
async fn stream_data_crosses_sendme_thresholds() {
    common::init_logging();
    let net = three_relay_net();
    let manager = net.manager(match_only_config());

    let circuit = manager.create_new_circuit(CircuitKind::General);
    assert!(
        circuit
            .open_circuit(
                vec![net.relay("relay1"), net.relay("relay2"), net.relay("relay3")],
                &NullBuildEventSink,
            )
            .await
    );

    let target = ExitTarget::to_host("example.com", 80);
    let mut stream = circuit.open_exit_stream(&target).await.unwrap();

    // 120 full cells: past the stream SENDME step (50) and the circuit
    // SENDME step (100).
    let chunk = vec![0xa5u8; 498];
    for _ in 0..120 {
        stream.write_all(&chunk).await.unwrap();
    }

    let mut received = 0usize;
    while received < 120 * 498 {
        let data = stream
            .read_some()
            .await
            .unwrap()
            .expect("echo ended early");
        assert!(data.iter().all(|&b| b == 0xa5));
        received += data.len();
    }
    assert_eq!(received, 120 * 498);

    stream.close().await;
    manager.shutdown().await;
}

struct RecordingBuildEvents(Mutex<Vec<CircuitBuildEvent>>);

impl BuildEventSink for RecordingBuildEvents {
    fn on_build_event(&self, event: CircuitBuildEvent) {
        self.0.lock().unwrap().push(event);
    }
}

/// Build events fire per node, then once on completion.
#[tokio::test(flavor = "multi_thread")]
async fn build_events_fire_in_order() {
    common::init_logging();
    let net = three_relay_net();
    let manager = net.manager(match_only_config());

    let events = RecordingBuildEvents(Mutex::new(Vec::new()));
    let circuit = manager.create_new_circuit(CircuitKind::General);
    assert!(
        circuit
            .open_circuit(
                vec![net.relay("relay1"), net.relay("relay2"), net.relay("relay3")],
                &events,
            )
            .await
    );

    let seen = events.0.lock().unwrap();
    assert_eq!(seen.len(), 4);
    for (i, event) in seen[..3].iter().enumerate() {
        match event {
            CircuitBuildEvent::NodeAdded { index, fingerprint } => {
                assert_eq!(*index, i);
                assert_eq!(*fingerprint, net.relay(&format!("relay{}", i + 1)).fingerprint);
            }
            other => panic!("expected NodeAdded, got {:?}", other),
        }
    }
    assert_eq!(seen[3], CircuitBuildEvent::Completed);

    manager.shutdown().await;
}

/// A build toward an unreachable entry reports ConnectionFailed and
/// the circuit never enters the active set.
#[tokio::test(flavor = "multi_thread")]
async fn build_fails_cleanly_on_unreachable_entry() {
    common::init_logging();
    let net = three_relay_net();
    let manager = net.manager(match_only_config());

    // A relay the network does not know how to reach.
    let stranger = {
        let mut relay = (*net.relay("relay1")).clone();
        relay.nickname = "stranger".into();
        relay.fingerprint = "00".repeat(20);
        Arc::new(relay)
    };

    let events = RecordingBuildEvents(Mutex::new(Vec::new()));
    let circuit = manager.create_new_circuit(CircuitKind::General);
    assert!(circuit.open_circuit(vec![stranger], &events).await);
    assert!(circuit.is_closed());

    let seen = events.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], CircuitBuildEvent::Failed { .. }));

    let (pending, active, clean) = manager.circuit_membership(&circuit);
    assert!(!pending && !active && !clean);

    manager.shutdown().await;
}
