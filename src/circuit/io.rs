//! Per-circuit cell I/O
//!
//! Owns the binding between a circuit and its connection, the onion
//! crypto layers, the stream table and the flow-control windows. The
//! connection's reader task delivers inbound cells here in arrival
//! order; callers send relay cells through here with cipher-state order
//! guaranteed to match wire order.
//!
//! Locking: `inner` is a plain mutex and is never held across an await.
//! The outbound crypto sits behind its own async mutex which *is* held
//! across the cell write, so two concurrent senders cannot interleave
//! their keystream advances and their wire writes differently. Senders
//! blocked on a flow-control window wait on `window_notify` with no
//! lock held.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{mpsc, oneshot, Notify};

use crate::circuit::stream::{StreamEntry, StreamItem, StreamReply};
use crate::connection::Connection;
use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use crate::protocol::crypto::{HopCryptState, HopKeyMaterial};
use crate::protocol::flow_control::CircuitFlowControl;

/// Upper bound on concurrently open streams per circuit.
const MAX_STREAMS_PER_CIRCUIT: usize = 50;

struct Binding {
    conn: Arc<Connection>,
    circuit_id: u32,
}

struct IoInner {
    /// Backward crypt state per hop, in path order.
    inbound: Vec<HopCryptState>,

    /// Circuit-level SENDME windows.
    circ_flow: CircuitFlowControl,

    /// Stream table.
    streams: HashMap<u16, StreamEntry>,

    /// Recently closed stream ids; late cells for them are dropped
    /// silently instead of tearing the circuit down.
    half_closed: HashSet<u16>,

    /// Next stream id to try.
    next_stream_id: u16,

    /// Rendezvous slot for the one in-flight CREATE handshake reply.
    control_waiter: Option<oneshot::Sender<Cell>>,

    /// Rendezvous slot for the one in-flight EXTEND reply.
    extend_waiter: Option<oneshot::Sender<RelayCell>>,

    /// Deliveries for unknown streams are dropped once set.
    marked_for_close: bool,

    /// Set exactly once at teardown, with the cause.
    closed: Option<TorError>,
}

/// Cell I/O state of one circuit.
pub(crate) struct CircuitIo {
    binding: OnceLock<Binding>,
    inner: Mutex<IoInner>,
    outbound: tokio::sync::Mutex<Vec<HopCryptState>>,
    window_notify: Notify,
}

impl CircuitIo {
    pub fn new() -> Self {
        Self {
            binding: OnceLock::new(),
            inner: Mutex::new(IoInner {
                inbound: Vec::new(),
                circ_flow: CircuitFlowControl::new(),
                streams: HashMap::new(),
                half_closed: HashSet::new(),
                next_stream_id: 1,
                control_waiter: None,
                extend_waiter: None,
                marked_for_close: false,
                closed: None,
            }),
            outbound: tokio::sync::Mutex::new(Vec::new()),
            window_notify: Notify::new(),
        }
    }

    /// Bind the circuit to a connection, allocating its circuit id.
    pub fn bind(&self, conn: &Arc<Connection>, circuit: &Arc<super::Circuit>) -> Result<u32> {
        if self.binding.get().is_some() {
            return Err(TorError::Internal("circuit already bound".into()));
        }
        let circuit_id = conn.attach_circuit(circuit)?;
        let binding = Binding {
            conn: Arc::clone(conn),
            circuit_id,
        };
        if self.binding.set(binding).is_err() {
            conn.detach_circuit(circuit_id);
            return Err(TorError::Internal("circuit already bound".into()));
        }
        Ok(circuit_id)
    }

    fn binding(&self) -> Result<&Binding> {
        self.binding
            .get()
            .ok_or_else(|| TorError::Internal("circuit is not bound to a connection".into()))
    }

    /// The circuit id, valid only after binding.
    pub fn circuit_id(&self) -> Option<u32> {
        self.binding.get().map(|b| b.circuit_id)
    }

    /// Number of completed hops.
    pub fn hop_count(&self) -> usize {
        self.inner.lock().unwrap().inbound.len()
    }

    fn last_hop(&self) -> Result<usize> {
        let hops = self.hop_count();
        if hops == 0 {
            return Err(TorError::Internal("circuit has no hops".into()));
        }
        Ok(hops - 1)
    }

    /// The teardown cause, once destroyed.
    pub fn close_cause(&self) -> Option<TorError> {
        self.inner.lock().unwrap().closed.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().unwrap().closed.is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.inner.lock().unwrap().closed {
            Some(cause) => Err(cause.clone()),
            None => Ok(()),
        }
    }

    /// Install key material for a newly completed hop.
    pub async fn add_hop(&self, material: &HopKeyMaterial) {
        let mut outbound = self.outbound.lock().await;
        self.inner.lock().unwrap().inbound.push(material.inbound());
        outbound.push(material.outbound());
    }

    /// Send a control cell on the bound connection.
    pub async fn send_cell(&self, cell: &Cell) -> Result<()> {
        self.ensure_open()?;
        self.binding()?.conn.send_cell(cell).await
    }

    /// Onion-encrypt a relay cell for `hop` and write it out.
    ///
    /// The payload digest uses hop `hop`'s running state, then every
    /// layer from `hop` inward wraps the payload. The outbound lock is
    /// held across the write so keystreams advance in wire order.
    pub async fn send_relay_cell(&self, cell: &RelayCell, hop: usize, early: bool) -> Result<()> {
        self.ensure_open()?;
        let binding = self.binding()?;
        let mut payload = cell.to_payload()?;

        let mut outbound = self.outbound.lock().await;
        let layers = outbound.as_mut_slice();
        if hop >= layers.len() {
            return Err(TorError::Internal(format!(
                "relay cell addressed to hop {} of {}",
                hop,
                layers.len()
            )));
        }
        layers[hop].set_digest(&mut payload);
        for layer in layers[..=hop].iter_mut().rev() {
            layer.apply_keystream(&mut payload);
        }

        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        let cell = Cell::new(binding.circuit_id, command, payload);
        binding.conn.send_cell(&cell).await
    }

    /// Send one RELAY_DATA cell on a stream, suspending while either
    /// the stream or the circuit send window is exhausted.
    pub async fn send_stream_data(&self, stream_id: u16, chunk: Vec<u8>) -> Result<()> {
        loop {
            let notified = self.window_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.inner.lock().unwrap();
                let inner = &mut *guard;
                if let Some(cause) = &inner.closed {
                    return Err(cause.clone());
                }
                let entry = inner
                    .streams
                    .get_mut(&stream_id)
                    .ok_or_else(|| TorError::Stream(format!("stream {} is closed", stream_id)))?;
                if !entry.connected {
                    return Err(TorError::Stream(format!(
                        "stream {} is not connected",
                        stream_id
                    )));
                }
                // Claim both window slots before releasing the lock.
                if entry.flow.can_send() && inner.circ_flow.can_send() {
                    entry.flow.on_send()?;
                    inner.circ_flow.on_send()?;
                    break;
                }
                log::trace!("Stream {} blocked on send window", stream_id);
            }

            notified.await;
        }

        let cell = RelayCell::new(RelayCommand::Data, stream_id, chunk);
        let hop = self.last_hop()?;
        self.send_relay_cell(&cell, hop, false).await
    }

    /// Allocate a stream slot. Returns the id, the open-reply waiter
    /// and the delivery buffer.
    pub fn create_stream(
        &self,
    ) -> Result<(
        u16,
        oneshot::Receiver<StreamReply>,
        mpsc::UnboundedReceiver<StreamItem>,
    )> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cause) = &inner.closed {
            return Err(cause.clone());
        }
        if inner.streams.len() >= MAX_STREAMS_PER_CIRCUIT {
            return Err(TorError::ResourceExhausted(format!(
                "too many streams on circuit (max {})",
                MAX_STREAMS_PER_CIRCUIT
            )));
        }

        let start = inner.next_stream_id;
        let stream_id = loop {
            let id = inner.next_stream_id;
            inner.next_stream_id = inner.next_stream_id.wrapping_add(1);
            if inner.next_stream_id == 0 {
                inner.next_stream_id = 1; // Skip 0: it addresses the circuit itself
            }
            if id != 0 && !inner.streams.contains_key(&id) && !inner.half_closed.contains(&id) {
                break id;
            }
            if inner.next_stream_id == start {
                return Err(TorError::ResourceExhausted("no stream ids available".into()));
            }
        };

        let (entry, reply_rx, data_rx) = StreamEntry::new(stream_id);
        inner.streams.insert(stream_id, entry);
        Ok((stream_id, reply_rx, data_rx))
    }

    /// Drop a stream slot without sending anything. Late deliveries for
    /// it are discarded silently.
    pub fn forget_stream(&self, stream_id: u16) {
        let mut inner = self.inner.lock().unwrap();
        if inner.streams.remove(&stream_id).is_some() {
            inner.half_closed.insert(stream_id);
        }
    }

    /// Register the rendezvous for the next CREATE-style reply.
    ///
    /// Only one handshake cell may be outstanding per circuit.
    pub fn expect_control_cell(&self) -> Result<oneshot::Receiver<Cell>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cause) = &inner.closed {
            return Err(cause.clone());
        }
        if inner.control_waiter.is_some() || inner.extend_waiter.is_some() {
            return Err(TorError::Internal(
                "a handshake is already in flight on this circuit".into(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        inner.control_waiter = Some(tx);
        Ok(rx)
    }

    /// Register the rendezvous for the next EXTENDED reply.
    pub fn expect_extend_reply(&self) -> Result<oneshot::Receiver<RelayCell>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cause) = &inner.closed {
            return Err(cause.clone());
        }
        if inner.control_waiter.is_some() || inner.extend_waiter.is_some() {
            return Err(TorError::Internal(
                "a handshake is already in flight on this circuit".into(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        inner.extend_waiter = Some(tx);
        Ok(rx)
    }

    /// Drop any registered handshake rendezvous (after a timeout).
    pub fn clear_handshake_waiters(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.control_waiter = None;
        inner.extend_waiter = None;
    }

    /// Mark the circuit so deliveries for unknown streams are dropped
    /// silently until it is destroyed.
    pub fn mark_for_close(&self) {
        self.inner.lock().unwrap().marked_for_close = true;
    }

    /// Route a control cell from the connection reader.
    ///
    /// CREATE-style replies go to the handshake rendezvous; connection
    /// housekeeping cells are ignored; anything else is a protocol
    /// violation.
    pub fn deliver_control_cell(&self, cell: Cell) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed.is_some() {
            return Ok(());
        }
        match cell.command {
            CellCommand::Created | CellCommand::Created2 | CellCommand::CreatedFast => {
                match inner.control_waiter.take() {
                    Some(waiter) => {
                        let _ = waiter.send(cell);
                    }
                    None => {
                        log::debug!("Late {:?} cell, dropping", cell.command);
                    }
                }
                Ok(())
            }
            CellCommand::Netinfo | CellCommand::PaddingNegotiate => Ok(()),
            other => Err(TorError::UnexpectedCell {
                expected: "CREATED2/CREATED_FAST".into(),
                got: format!("{:?}", other),
            }),
        }
    }

    /// Decrypt and dispatch a relay cell from the connection reader.
    ///
    /// Peeling stops at the first hop whose digest verifies; an
    /// unrecognized cell is a protocol violation. Errors returned here
    /// destroy the circuit.
    pub async fn deliver_relay_cell(&self, cell: Cell) -> Result<()> {
        let mut owed_sendmes: Vec<(RelayCell, usize)> = Vec::new();
        let mut wake_senders = false;

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_some() {
                return Ok(());
            }

            let mut payload = cell.payload;
            if payload.len() != Cell::PAYLOAD_SIZE {
                return Err(TorError::ProtocolError("short relay payload".into()));
            }

            let mut recognized_hop = None;
            for (hop, layer) in inner.inbound.iter_mut().enumerate() {
                layer.apply_keystream(&mut payload);
                if RelayCell::payload_recognized(&payload) && layer.check_digest(&payload) {
                    recognized_hop = Some(hop);
                    break;
                }
            }
            let Some(hop) = recognized_hop else {
                return Err(TorError::DigestMismatch);
            };

            let relay_cell = RelayCell::from_payload(&payload)?;
            log::trace!(
                "Relay cell from hop {}: {:?} stream={} len={}",
                hop,
                relay_cell.command,
                relay_cell.stream_id,
                relay_cell.length
            );

            match relay_cell.command {
                RelayCommand::Data => {
                    let stream_id = relay_cell.stream_id;
                    if stream_id == 0 {
                        return Err(TorError::ProtocolError("DATA with stream id 0".into()));
                    }
                    if inner.circ_flow.on_deliver()? {
                        owed_sendmes.push((RelayCell::new(RelayCommand::Sendme, 0, vec![]), hop));
                    }
                    let silently_dropped =
                        inner.marked_for_close || inner.half_closed.contains(&stream_id);
                    match inner.streams.get_mut(&stream_id) {
                        Some(entry) => {
                            if !entry.connected {
                                return Err(TorError::UnexpectedCell {
                                    expected: "CONNECTED".into(),
                                    got: "DATA".into(),
                                });
                            }
                            if entry.flow.on_deliver()? {
                                owed_sendmes.push((
                                    RelayCell::new(RelayCommand::Sendme, stream_id, vec![]),
                                    hop,
                                ));
                            }
                            let _ = entry.incoming.send(StreamItem::Data(relay_cell.data));
                        }
                        None if silently_dropped => {
                            log::debug!("Data for closed stream {}, dropping", stream_id);
                        }
                        None => {
                            return Err(TorError::ProtocolError(format!(
                                "data for unknown stream {}",
                                stream_id
                            )));
                        }
                    }
                }
                RelayCommand::End => {
                    let stream_id = relay_cell.stream_id;
                    let reason = relay_cell.data.first().copied().unwrap_or(0);
                    match inner.streams.remove(&stream_id) {
                        Some(mut entry) => {
                            inner.half_closed.insert(stream_id);
                            match entry.reply.take() {
                                Some(reply) => {
                                    let _ = reply.send(StreamReply::End { reason });
                                }
                                None => {
                                    let _ = entry.incoming.send(StreamItem::End { reason });
                                }
                            }
                        }
                        None => {
                            log::debug!("END for unknown stream {}, dropping", stream_id);
                        }
                    }
                }
                RelayCommand::Connected => {
                    let stream_id = relay_cell.stream_id;
                    let silently_dropped =
                        inner.marked_for_close || inner.half_closed.contains(&stream_id);
                    match inner.streams.get_mut(&stream_id) {
                        Some(entry) if !entry.connected => {
                            entry.connected = true;
                            if let Some(reply) = entry.reply.take() {
                                let _ = reply.send(StreamReply::Connected);
                            }
                        }
                        Some(_) => {
                            return Err(TorError::UnexpectedCell {
                                expected: "DATA/END".into(),
                                got: "CONNECTED twice".into(),
                            });
                        }
                        None if silently_dropped => {
                            log::debug!("CONNECTED for closed stream {}, dropping", stream_id);
                        }
                        None => {
                            return Err(TorError::ProtocolError(format!(
                                "CONNECTED for unknown stream {}",
                                stream_id
                            )));
                        }
                    }
                }
                RelayCommand::Sendme => {
                    if relay_cell.stream_id == 0 {
                        inner.circ_flow.on_sendme_received()?;
                    } else {
                        match inner.streams.get_mut(&relay_cell.stream_id) {
                            Some(entry) => entry.flow.on_sendme_received()?,
                            None => {
                                log::debug!(
                                    "SENDME for unknown stream {}, dropping",
                                    relay_cell.stream_id
                                );
                            }
                        }
                    }
                    wake_senders = true;
                }
                RelayCommand::Extended | RelayCommand::Extended2 | RelayCommand::Truncated => {
                    match inner.extend_waiter.take() {
                        Some(waiter) => {
                            let _ = waiter.send(relay_cell);
                        }
                        None => {
                            return Err(TorError::UnexpectedCell {
                                expected: "no extend in flight".into(),
                                got: format!("{:?}", relay_cell.command),
                            });
                        }
                    }
                }
                RelayCommand::Drop => {}
                other => {
                    return Err(TorError::UnexpectedCell {
                        expected: "client-bound relay command".into(),
                        got: format!("{:?}", other),
                    });
                }
            }
        }

        if wake_senders {
            self.window_notify.notify_waiters();
        }
        for (sendme, hop) in owed_sendmes {
            self.send_relay_cell(&sendme, hop, false).await?;
        }
        Ok(())
    }

    /// Tear the circuit's I/O down: abort every stream with `cause`,
    /// optionally emit a DESTROY cell, and drop the connection binding.
    pub async fn teardown(&self, cause: TorError, send_destroy: bool) {
        let entries = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(cause.clone());
            inner.control_waiter = None;
            inner.extend_waiter = None;
            inner.streams.drain().collect::<Vec<_>>()
        };

        for (_, mut entry) in entries {
            match entry.reply.take() {
                Some(reply) => {
                    let _ = reply.send(StreamReply::Aborted(cause.clone()));
                }
                None => {
                    let _ = entry.incoming.send(StreamItem::Aborted(cause.clone()));
                }
            }
        }
        self.window_notify.notify_waiters();

        if let Some(binding) = self.binding.get() {
            if send_destroy && !binding.conn.is_closed() {
                let destroy = Cell::destroy(binding.circuit_id, 0);
                if let Err(e) = binding.conn.send_cell(&destroy).await {
                    log::debug!("Destroy cell not sent: {}", e);
                }
            }
            binding.conn.detach_circuit(binding.circuit_id);
        }
    }
}
