//! Circuit manager
//!
//! Aggregates the circuit registry and the pending-request queue, and
//! exposes the stream-opening API. Registry transitions are issued
//! exclusively by circuits as their status changes; all three sets
//! share one lock, so no observer ever sees a circuit in an impossible
//! combination of sets.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::Notify;

use crate::circuit::stream::OpenStreamResponse;
use crate::circuit::{Circuit, CircuitKind};
use crate::config::CircuitManagerConfig;
use crate::connection::{ChannelTransport, ConnectionCache};
use crate::directory::Directory;
use crate::error::{Result, TorError};
use crate::events::{BuildEventSink, NullBuildEventSink, NullProgressSink, ProgressSink};
use crate::relay::{ExitTarget, Relay};
use crate::requests::StreamRequestQueue;
use crate::rng::SecureRandom;
use crate::scheduler;

/// The three circuit sets, under one lock.
#[derive(Default)]
struct RegistryInner {
    pending: std::collections::HashMap<u64, Arc<Circuit>>,
    active: std::collections::HashMap<u64, Arc<Circuit>>,
    clean: std::collections::HashMap<u64, Arc<Circuit>>,
}

/// Registry of circuits by lifecycle set.
///
/// Invariants: `clean` is a subset of `active`; a circuit is in at most
/// one of pending/active; destroyed circuits are in neither.
pub(crate) struct CircuitRegistry {
    inner: Mutex<RegistryInner>,
    /// Woken on transitions the matcher cares about (OPEN, dirty).
    activity: Notify,
}

impl CircuitRegistry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            activity: Notify::new(),
        }
    }

    /// A circuit entered BUILDING.
    pub fn circuit_start_connect(&self, circuit: &Arc<Circuit>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.insert(circuit.serial(), Arc::clone(circuit));
    }

    /// A circuit reached OPEN.
    pub fn circuit_connected(&self, circuit: &Arc<Circuit>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.remove(&circuit.serial());
            inner.active.insert(circuit.serial(), Arc::clone(circuit));
            inner.clean.insert(circuit.serial(), Arc::clone(circuit));
        }
        self.activity.notify_waiters();
    }

    /// A circuit attached its first stream.
    pub fn circuit_dirty(&self, circuit: &Circuit) {
        self.inner.lock().unwrap().clean.remove(&circuit.serial());
        self.activity.notify_waiters();
    }

    /// A circuit was destroyed or failed: leaves every set atomically.
    pub fn circuit_inactive(&self, circuit: &Circuit) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&circuit.serial());
        inner.active.remove(&circuit.serial());
        inner.clean.remove(&circuit.serial());
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn pending_snapshot(&self) -> Vec<Arc<Circuit>> {
        self.inner.lock().unwrap().pending.values().cloned().collect()
    }

    pub fn active_snapshot(&self) -> Vec<Arc<Circuit>> {
        self.inner.lock().unwrap().active.values().cloned().collect()
    }

    pub fn clean_snapshot(&self) -> Vec<Arc<Circuit>> {
        self.inner.lock().unwrap().clean.values().cloned().collect()
    }

    /// Set membership for one circuit, read in one critical section.
    pub fn membership(&self, circuit: &Circuit) -> (bool, bool, bool) {
        let inner = self.inner.lock().unwrap();
        (
            inner.pending.contains_key(&circuit.serial()),
            inner.active.contains_key(&circuit.serial()),
            inner.clean.contains_key(&circuit.serial()),
        )
    }

    pub async fn wait_activity(&self) {
        self.activity.notified().await;
    }
}

/// Counters snapshotted by value through [`CircuitManager::stats`].
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Circuits that reached OPEN
    pub circuits_built: u64,
    /// Circuit builds that failed
    pub circuits_failed: u64,
    /// Streams successfully opened (exit and directory)
    pub streams_opened: u64,
    /// Exit requests that expired in the queue
    pub requests_timed_out: u64,
}

/// A directory stream request: which router to ask, and which
/// initialization milestones to report.
pub struct DirectoryStreamRequest {
    /// The directory router to contact
    pub relay: Arc<Relay>,
    /// Milestone fired once the one-hop circuit is built
    pub circuit_built_event: Option<u32>,
    /// Milestone fired once the stream is open
    pub stream_opened_event: Option<u32>,
}

impl DirectoryStreamRequest {
    /// Request a stream to `relay` with no milestones.
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            circuit_built_event: None,
            stream_opened_event: None,
        }
    }

    /// Report the given milestones while serving the request.
    pub fn with_events(relay: Arc<Relay>, circuit_built: u32, stream_opened: u32) -> Self {
        Self {
            relay,
            circuit_built_event: Some(circuit_built),
            stream_opened_event: Some(stream_opened),
        }
    }
}

/// Entry point for circuit building and stream dispatch.
pub struct CircuitManager {
    config: CircuitManagerConfig,
    directory: Arc<dyn Directory>,
    cache: Arc<ConnectionCache>,
    registry: Arc<CircuitRegistry>,
    requests: Arc<StreamRequestQueue>,
    rng: SecureRandom,
    progress: Arc<dyn ProgressSink>,
    build_events: Arc<dyn BuildEventSink>,
    stats: Mutex<ManagerStats>,
    scheduler_started: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
}

impl CircuitManager {
    /// Create a manager over a directory and transport, with no-op
    /// progress and build-event sinks.
    pub fn new(
        config: CircuitManagerConfig,
        directory: Arc<dyn Directory>,
        transport: Box<dyn ChannelTransport>,
    ) -> Result<Arc<Self>> {
        Self::with_sinks(
            config,
            directory,
            transport,
            Arc::new(NullProgressSink),
            Arc::new(NullBuildEventSink),
        )
    }

    /// Create a manager with explicit progress and build-event sinks.
    pub fn with_sinks(
        config: CircuitManagerConfig,
        directory: Arc<dyn Directory>,
        transport: Box<dyn ChannelTransport>,
        progress: Arc<dyn ProgressSink>,
        build_events: Arc<dyn BuildEventSink>,
    ) -> Result<Arc<Self>> {
        let rng = SecureRandom::new()?;
        Ok(Arc::new(Self {
            config,
            directory,
            cache: Arc::new(ConnectionCache::new(transport, rng)),
            registry: Arc::new(CircuitRegistry::new()),
            requests: Arc::new(StreamRequestQueue::new()),
            rng,
            progress,
            build_events,
            stats: Mutex::new(ManagerStats::default()),
            scheduler_started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }))
    }

    /// Start the periodic build scheduler. Idempotent.
    pub fn start_building_circuits(self: &Arc<Self>) {
        if self.scheduler_started.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(
            "Starting circuit build scheduler (floor {}, tick {:?})",
            self.config.clean_circuit_floor,
            self.config.tick_interval
        );
        scheduler::spawn(self);
    }

    /// Create a fresh, unbuilt circuit registered to this manager.
    pub fn create_new_circuit(&self, kind: CircuitKind) -> Arc<Circuit> {
        Circuit::create(
            kind,
            Arc::downgrade(&self.registry),
            Arc::clone(&self.cache),
            &self.config,
            self.rng,
        )
    }

    /// Open an exit stream to a hostname.
    ///
    /// Blocks until a circuit serves the request, the configured
    /// request deadline passes, or the manager shuts down.
    pub async fn open_exit_stream_to(&self, hostname: &str, port: u16) -> OpenStreamResponse {
        self.open_exit_stream(ExitTarget::to_host(hostname, port))
            .await
    }

    /// Open an exit stream to a literal IPv4 address.
    pub async fn open_exit_stream_to_addr(
        &self,
        addr: Ipv4Addr,
        port: u16,
    ) -> OpenStreamResponse {
        self.open_exit_stream(ExitTarget::to_addr(addr, port)).await
    }

    /// Open an exit stream to an already-built target.
    pub async fn open_exit_stream(&self, target: ExitTarget) -> OpenStreamResponse {
        if self.is_shutting_down() {
            return OpenStreamResponse::error(TorError::Interrupted);
        }
        log::debug!("Queueing exit stream request to {}", target);
        let ticket = self.requests.enqueue(target);
        ticket.wait().await
    }

    /// Open a directory stream: build a one-hop directory circuit to
    /// the requested router and open a BEGIN_DIR stream over it.
    ///
    /// Initialization milestones fire in order: circuit built, then
    /// stream opened.
    pub async fn open_directory_stream(
        self: &Arc<Self>,
        request: DirectoryStreamRequest,
    ) -> OpenStreamResponse {
        let circuit = self.create_new_circuit(CircuitKind::Directory);
        let attempted = circuit
            .open_circuit(vec![Arc::clone(&request.relay)], &*self.build_events)
            .await;
        if !attempted || !circuit.is_connected() {
            return OpenStreamResponse::connection_fail(TorError::ConnectionFailed(format!(
                "directory circuit to {} failed",
                request.relay.nickname
            )));
        }
        if let Some(code) = request.circuit_built_event {
            self.progress.notify_event(code);
        }

        match circuit.open_directory_stream().await {
            Ok(stream) => {
                if let Some(code) = request.stream_opened_event {
                    self.progress.notify_event(code);
                }
                self.stats.lock().unwrap().streams_opened += 1;
                OpenStreamResponse::opened(stream)
            }
            Err(e) => {
                circuit.destroy_circuit().await;
                OpenStreamResponse::from_result(Err(e))
            }
        }
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> ManagerStats {
        self.stats.lock().unwrap().clone()
    }

    /// Clean (OPEN, never-used) circuits.
    pub fn clean_circuits(&self) -> Vec<Arc<Circuit>> {
        self.registry.clean_snapshot()
    }

    /// Active (OPEN) circuits.
    pub fn active_circuits(&self) -> Vec<Arc<Circuit>> {
        self.registry.active_snapshot()
    }

    /// Circuits currently building.
    pub fn pending_circuits(&self) -> Vec<Arc<Circuit>> {
        self.registry.pending_snapshot()
    }

    /// Registry membership of one circuit: (pending, active, clean).
    pub fn circuit_membership(&self, circuit: &Circuit) -> (bool, bool, bool) {
        self.registry.membership(circuit)
    }

    /// Number of requests waiting to be matched.
    pub fn pending_request_count(&self) -> usize {
        self.requests.len()
    }

    /// Tear everything down: interrupt pending requests, destroy all
    /// circuits, close all connections, stop the scheduler.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Circuit manager shutting down");
        self.shutdown_notify.notify_waiters();
        self.requests.shutdown();

        let mut circuits = self.registry.active_snapshot();
        circuits.extend(self.registry.pending_snapshot());
        join_all(circuits.iter().map(|circuit| circuit.destroy_circuit())).await;
        self.cache.shutdown().await;
    }

    // ----- crate-internal accessors for the scheduler -----

    pub(crate) fn config(&self) -> &CircuitManagerConfig {
        &self.config
    }

    pub(crate) fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub(crate) fn registry(&self) -> &Arc<CircuitRegistry> {
        &self.registry
    }

    pub(crate) fn requests(&self) -> &Arc<StreamRequestQueue> {
        &self.requests
    }

    pub(crate) fn rng(&self) -> &SecureRandom {
        &self.rng
    }

    pub(crate) fn build_events(&self) -> &Arc<dyn BuildEventSink> {
        &self.build_events
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn note_circuit_built(&self) {
        self.stats.lock().unwrap().circuits_built += 1;
    }

    pub(crate) fn note_circuit_failed(&self) {
        self.stats.lock().unwrap().circuits_failed += 1;
    }

    pub(crate) fn note_stream_opened(&self) {
        self.stats.lock().unwrap().streams_opened += 1;
    }

    pub(crate) fn note_requests_timed_out(&self, count: usize) {
        self.stats.lock().unwrap().requests_timed_out += count as u64;
    }

    /// Sleep until the next tick, or earlier on registry/queue
    /// activity or shutdown.
    pub(crate) async fn wait_for_tick(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.tick_interval) => {}
            _ = self.registry.wait_activity() => {}
            _ = self.requests.wait_kick() => {}
            _ = self.shutdown_notify.notified() => {}
        }
    }
}
