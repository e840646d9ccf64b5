//! Circuits: multi-hop cryptographic tunnels through relays
//!
//! A [`Circuit`] composes the lifecycle state machine, the cell I/O and
//! the hop list. It drives its own build (create plus iterative
//! extends), opens exit and directory streams, and reports its registry
//! transitions to the manager as its status changes.

pub(crate) mod io;
pub mod status;
pub mod stream;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::config::CircuitManagerConfig;
use crate::connection::ConnectionCache;
use crate::error::{Result, TorError};
use crate::events::{BuildEventSink, CircuitBuildEvent};
use crate::manager::CircuitRegistry;
use crate::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use crate::protocol::handshake::{
    create2_payload, extend2_data, parse_created2, parse_created_fast, FastClient, NtorClient,
};
use crate::relay::{ExitTarget, Relay};
use crate::rng::SecureRandom;

use io::CircuitIo;
use status::CircuitStatus;
use stream::{StreamReply, TorStream};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// What a circuit is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitKind {
    /// General-purpose exit circuit
    General,
    /// One-hop directory circuit
    Directory,
}

/// Build/stream timing knobs copied from the manager config.
#[derive(Debug, Clone, Copy)]
struct CircuitTiming {
    stream_open_timeout: Duration,
    control_response_timeout: Duration,
    first_hop_fast_create: bool,
}

/// A circuit through the relay network.
pub struct Circuit {
    serial: u64,
    kind: CircuitKind,
    status: Mutex<CircuitStatus>,
    io: CircuitIo,
    path: Mutex<Vec<Arc<Relay>>>,
    failed_exits: Mutex<HashSet<ExitTarget>>,
    registry: Weak<CircuitRegistry>,
    cache: Arc<ConnectionCache>,
    timing: CircuitTiming,
    rng: SecureRandom,
}

impl Circuit {
    pub(crate) fn create(
        kind: CircuitKind,
        registry: Weak<CircuitRegistry>,
        cache: Arc<ConnectionCache>,
        config: &CircuitManagerConfig,
        rng: SecureRandom,
    ) -> Arc<Self> {
        Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            kind,
            status: Mutex::new(CircuitStatus::new()),
            io: CircuitIo::new(),
            path: Mutex::new(Vec::new()),
            failed_exits: Mutex::new(HashSet::new()),
            registry,
            cache,
            timing: CircuitTiming {
                stream_open_timeout: config.stream_open_timeout,
                control_response_timeout: config.control_response_timeout,
                first_hop_fast_create: config.first_hop_fast_create,
            },
            rng,
        })
    }

    /// Process-unique circuit serial (registry key).
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// What this circuit is for.
    pub fn kind(&self) -> CircuitKind {
        self.kind
    }

    /// Whether this is a directory-only circuit.
    pub fn is_directory(&self) -> bool {
        self.kind == CircuitKind::Directory
    }

    /// Wire circuit id; only valid after the circuit is bound.
    pub fn circuit_id(&self) -> Option<u32> {
        self.io.circuit_id()
    }

    /// Completed hops so far.
    pub fn hop_count(&self) -> usize {
        self.io.hop_count()
    }

    /// The relay at the final hop, if any hop has completed.
    pub fn last_relay(&self) -> Option<Arc<Relay>> {
        self.path.lock().unwrap().last().cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.status.lock().unwrap().is_connected()
    }

    pub fn is_building(&self) -> bool {
        self.status.lock().unwrap().is_building()
    }

    pub fn is_dirty(&self) -> bool {
        self.status.lock().unwrap().is_dirty()
    }

    /// Terminal (destroyed or failed).
    pub fn is_closed(&self) -> bool {
        self.status.lock().unwrap().is_closed()
    }

    pub(crate) fn milliseconds_dirty(&self) -> u128 {
        self.status.lock().unwrap().milliseconds_dirty()
    }

    pub(crate) fn milliseconds_since_creation(&self) -> u128 {
        self.status.lock().unwrap().milliseconds_since_creation()
    }

    /// Drive the build of this circuit along `path`.
    ///
    /// Returns whether a build was attempted: `false` when the path is
    /// empty or the circuit is not fresh. Build progress and the final
    /// outcome are reported through `events`; failures also transition
    /// the status to FAILED.
    pub async fn open_circuit(
        self: &Arc<Self>,
        path: Vec<Arc<Relay>>,
        events: &dyn BuildEventSink,
    ) -> bool {
        if path.is_empty() {
            log::warn!("Refusing to build a circuit over an empty path");
            return false;
        }
        {
            let mut status = self.status.lock().unwrap();
            if !status.is_unconnected() {
                return false;
            }
            status.set_state_building();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.circuit_start_connect(self);
        }

        match self.build(&path, events).await {
            Ok(()) => {
                let opened = self.status.lock().unwrap().set_state_open();
                if !opened {
                    // A concurrent teardown won; report it as a failure.
                    events.on_build_event(CircuitBuildEvent::Failed {
                        reason: "circuit destroyed during build".into(),
                    });
                    return true;
                }
                if let Some(registry) = self.registry.upgrade() {
                    registry.circuit_connected(self);
                }
                log::info!(
                    "✅ Circuit {} open: {} hops, exit {}",
                    self.serial,
                    path.len(),
                    path.last().map(|r| r.nickname.as_str()).unwrap_or("?")
                );
                events.on_build_event(CircuitBuildEvent::Completed);
                true
            }
            Err(e) => {
                log::info!("Circuit {} build failed: {}", self.serial, e);
                self.status.lock().unwrap().set_state_failed();
                if let Some(registry) = self.registry.upgrade() {
                    registry.circuit_inactive(self);
                }
                self.io.teardown(e.clone(), false).await;
                events.on_build_event(CircuitBuildEvent::Failed {
                    reason: e.to_string(),
                });
                true
            }
        }
    }

    /// Connect, create the first hop, then extend along the path.
    async fn build(
        self: &Arc<Self>,
        path: &[Arc<Relay>],
        events: &dyn BuildEventSink,
    ) -> Result<()> {
        let first = &path[0];
        let conn = self.cache.connection_to(first).await?;
        let circuit_id = self.io.bind(&conn, self)?;

        // First hop: CREATE_FAST or ntor CREATE2.
        let use_fast = self.timing.first_hop_fast_create
            || (self.kind == CircuitKind::Directory && path.len() == 1);
        let (handshake, create_cell) = if use_fast {
            let (handshake, x) = FastClient::start(&self.rng);
            (
                handshake,
                Cell::new(circuit_id, CellCommand::CreateFast, x),
            )
        } else {
            let (handshake, onionskin) = NtorClient::start(first)?;
            (
                handshake,
                Cell::new(circuit_id, CellCommand::Create2, create2_payload(&onionskin)),
            )
        };

        let reply_rx = self.io.expect_control_cell()?;
        self.io.send_cell(&create_cell).await?;
        let reply = self.await_handshake(reply_rx, "create").await?;
        let hdata = match reply.command {
            CellCommand::CreatedFast => parse_created_fast(&reply.payload)?,
            CellCommand::Created2 => parse_created2(&reply.payload)?,
            other => {
                return Err(TorError::UnexpectedCell {
                    expected: "CREATED2/CREATED_FAST".into(),
                    got: format!("{:?}", other),
                })
            }
        };
        let material = handshake.complete(hdata)?;
        self.io.add_hop(&material).await;
        self.path.lock().unwrap().push(Arc::clone(first));
        events.on_build_event(CircuitBuildEvent::NodeAdded {
            index: 0,
            fingerprint: first.fingerprint.clone(),
        });

        // Remaining hops: EXTEND2 through the current last hop.
        for (index, relay) in path.iter().enumerate().skip(1) {
            let (handshake, onionskin) = NtorClient::start(relay)?;
            let extend = RelayCell::new(
                RelayCommand::Extend2,
                0,
                extend2_data(relay, &onionskin)?,
            );
            let reply_rx = self.io.expect_extend_reply()?;
            self.io.send_relay_cell(&extend, index - 1, true).await?;
            let reply = self.await_handshake(reply_rx, "extend").await?;
            let hdata = match reply.command {
                RelayCommand::Extended2 => parse_created2(&reply.data)?.to_vec(),
                RelayCommand::Truncated => {
                    return Err(TorError::CircuitBuildFailed(format!(
                        "extend to {} truncated",
                        relay.nickname
                    )))
                }
                other => {
                    return Err(TorError::UnexpectedCell {
                        expected: "EXTENDED2".into(),
                        got: format!("{:?}", other),
                    })
                }
            };
            let material = handshake.complete(&hdata)?;
            self.io.add_hop(&material).await;
            self.path.lock().unwrap().push(Arc::clone(relay));
            events.on_build_event(CircuitBuildEvent::NodeAdded {
                index,
                fingerprint: relay.fingerprint.clone(),
            });
        }

        Ok(())
    }

    /// Await one handshake reply with the per-step timeout.
    async fn await_handshake<T>(&self, rx: oneshot::Receiver<T>, what: &str) -> Result<T> {
        match timeout(self.timing.control_response_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self
                .io
                .close_cause()
                .unwrap_or_else(|| TorError::CircuitBuildFailed("circuit torn down".into()))),
            Err(_) => {
                self.io.clear_handshake_waiters();
                Err(TorError::HandshakeFailed(format!("{} step timed out", what)))
            }
        }
    }

    /// Whether this circuit's final hop admits `target`.
    ///
    /// Directory circuits, unbuilt circuits and targets this circuit
    /// already failed on are excluded.
    pub fn can_handle_exit_to(&self, target: &ExitTarget) -> bool {
        if self.kind != CircuitKind::General || !self.is_connected() {
            return false;
        }
        if self.failed_exits.lock().unwrap().contains(target) {
            return false;
        }
        match self.last_relay() {
            Some(relay) => relay.accepts_exit_target(target),
            None => false,
        }
    }

    /// Remember that `target` failed on this circuit so retries pick a
    /// different one.
    pub fn record_failed_exit_target(&self, target: &ExitTarget) {
        log::debug!(
            "Circuit {} marking exit target {} as failed",
            self.serial,
            target
        );
        self.failed_exits.lock().unwrap().insert(target.clone());
    }

    /// Open a stream to an exit target through this circuit.
    ///
    /// On timeout the consecutive-timeout counter advances and, at the
    /// policy threshold, destroys the circuit.
    pub async fn open_exit_stream(self: &Arc<Self>, target: &ExitTarget) -> Result<TorStream> {
        if !self.is_connected() {
            return Err(TorError::Stream("circuit is not open".into()));
        }
        self.mark_dirty();

        let begin = format!("{}\0", target);
        let result = self
            .open_stream_inner(RelayCommand::Begin, begin.into_bytes(), target.to_string())
            .await;
        match result {
            Ok(stream) => {
                self.status.lock().unwrap().clear_stream_timeouts();
                Ok(stream)
            }
            Err(TorError::StreamTimeout) => {
                let drop_circuit = self.status.lock().unwrap().count_stream_timeout();
                if drop_circuit {
                    log::warn!(
                        "Circuit {} exceeded the stream-timeout threshold, destroying",
                        self.serial
                    );
                    self.destroy_circuit().await;
                }
                Err(TorError::StreamTimeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Open a directory stream through this circuit (BEGIN_DIR).
    pub async fn open_directory_stream(self: &Arc<Self>) -> Result<TorStream> {
        if !self.is_connected() {
            return Err(TorError::Stream("circuit is not open".into()));
        }
        self.mark_dirty();
        self.open_stream_inner(RelayCommand::BeginDir, Vec::new(), "directory".into())
            .await
    }

    async fn open_stream_inner(
        self: &Arc<Self>,
        command: RelayCommand,
        payload: Vec<u8>,
        target: String,
    ) -> Result<TorStream> {
        let (stream_id, reply_rx, incoming) = self.io.create_stream()?;
        let begin = RelayCell::new(command, stream_id, payload);
        let hop = self.io.hop_count().saturating_sub(1);
        if let Err(e) = self.io.send_relay_cell(&begin, hop, false).await {
            self.io.forget_stream(stream_id);
            return Err(e);
        }

        match timeout(self.timing.stream_open_timeout, reply_rx).await {
            Ok(Ok(StreamReply::Connected)) => {
                log::debug!("📡 Stream {} opened to {}", stream_id, target);
                Ok(TorStream::new(
                    Arc::clone(self),
                    stream_id,
                    target,
                    incoming,
                ))
            }
            Ok(Ok(StreamReply::End { reason })) => Err(TorError::stream_end(reason)),
            Ok(Ok(StreamReply::Aborted(cause))) => Err(cause),
            Ok(Err(_)) => Err(self
                .io
                .close_cause()
                .unwrap_or_else(|| TorError::Stream("circuit torn down".into()))),
            Err(_) => {
                self.io.forget_stream(stream_id);
                Err(TorError::StreamTimeout)
            }
        }
    }

    /// Send one chunk of stream data (called by [`TorStream`]).
    pub(crate) async fn send_stream_data(&self, stream_id: u16, chunk: Vec<u8>) -> Result<()> {
        self.io.send_stream_data(stream_id, chunk).await
    }

    /// Close a stream with RELAY_END (called by [`TorStream`]).
    pub(crate) async fn close_stream(&self, stream_id: u16, reason: u8) {
        let end = RelayCell::new(RelayCommand::End, stream_id, vec![reason]);
        let hop = self.io.hop_count().saturating_sub(1);
        if let Err(e) = self.io.send_relay_cell(&end, hop, false).await {
            log::debug!("END for stream {} not sent: {}", stream_id, e);
        }
        self.io.forget_stream(stream_id);
    }

    /// Drop a stream slot without an END cell (called on handle drop).
    pub(crate) fn forget_stream(&self, stream_id: u16) {
        self.io.forget_stream(stream_id);
    }

    /// Flag the circuit for closing; deliveries for unknown streams are
    /// discarded silently from here on.
    pub fn mark_for_close(&self) {
        self.io.mark_for_close();
    }

    fn mark_dirty(&self) {
        let newly_dirty = {
            let mut status = self.status.lock().unwrap();
            if status.is_dirty() {
                false
            } else {
                status.mark_dirty();
                true
            }
        };
        if newly_dirty {
            if let Some(registry) = self.registry.upgrade() {
                registry.circuit_dirty(self);
            }
        }
    }

    /// Destroy the circuit locally: emit a DESTROY cell, abort every
    /// stream, and leave all registries.
    pub async fn destroy_circuit(&self) {
        self.finish(TorError::circuit_destroyed(0), true).await;
    }

    /// A DESTROY cell arrived for this circuit.
    pub(crate) async fn handle_remote_destroy(&self, reason: u8) {
        log::info!(
            "Circuit {} destroyed by remote: {}",
            self.serial,
            TorError::circuit_destroyed(reason)
        );
        self.finish(TorError::circuit_destroyed(reason), false).await;
    }

    /// The underlying connection died.
    pub(crate) async fn handle_connection_closed(&self, cause: TorError) {
        self.finish(cause, false).await;
    }

    /// A protocol violation surfaced while processing inbound cells.
    async fn protocol_failure(&self, cause: TorError) {
        log::warn!("Circuit {} protocol violation: {}", self.serial, cause);
        self.finish(cause, true).await;
    }

    async fn finish(&self, cause: TorError, send_destroy: bool) {
        self.status.lock().unwrap().set_state_destroyed();
        if let Some(registry) = self.registry.upgrade() {
            registry.circuit_inactive(self);
        }
        self.io.teardown(cause, send_destroy).await;
    }

    /// Entry point for the connection reader: one inbound cell.
    pub(crate) async fn handle_inbound_cell(self: &Arc<Self>, cell: Cell) {
        match cell.command {
            CellCommand::Relay | CellCommand::RelayEarly => {
                if let Err(e) = self.io.deliver_relay_cell(cell).await {
                    self.protocol_failure(e).await;
                }
            }
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                self.handle_remote_destroy(reason).await;
            }
            _ => {
                if let Err(e) = self.io.deliver_control_cell(cell) {
                    self.protocol_failure(e).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("serial", &self.serial)
            .field("kind", &self.kind)
            .field("circuit_id", &self.circuit_id())
            .field("hops", &self.hop_count())
            .finish()
    }
}
