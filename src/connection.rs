//! Relay connections and the connection cache
//!
//! A [`Connection`] frames cells over a pre-established transport link
//! and owns the dispatch table from circuit ids to circuits: one reader
//! task per connection parses inbound cells and hands them to the
//! owning circuit in arrival order. The [`ConnectionCache`] reuses one
//! connection per relay.
//!
//! The transport itself (TLS, pluggable transports, test pipes) is
//! supplied by the embedding application through [`ChannelTransport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use crate::circuit::Circuit;
use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand, CircIdWidth};
use crate::rng::SecureRandom;
use crate::relay::Relay;

/// A byte stream able to carry framed cells.
pub trait CellLink: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> CellLink for T {}

/// Produces link-ready byte streams to relays.
///
/// The link must already be established end to end (the version and
/// netinfo exchange belongs to the transport, not to this crate).
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open (or fail to open) a link to `relay`.
    async fn connect(&self, relay: &Relay) -> Result<Box<dyn CellLink>>;
}

/// A live connection to one relay.
pub struct Connection {
    peer_fingerprint: String,
    id_width: CircIdWidth,
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn CellLink>>>,
    circuits: Mutex<HashMap<u32, Weak<Circuit>>>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    rng: SecureRandom,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_fingerprint", &self.peer_fingerprint)
            .field("id_width", &self.id_width)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Maximum attempts to find an unused circuit id before giving up.
    const ID_ALLOC_ATTEMPTS: usize = 32;

    /// Wrap an established link and start its reader task.
    pub(crate) fn launch(peer: &Relay, link: Box<dyn CellLink>, rng: SecureRandom) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(link);
        let conn = Arc::new(Self {
            peer_fingerprint: peer.fingerprint.clone(),
            id_width: CircIdWidth::Four,
            writer: tokio::sync::Mutex::new(write_half),
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
            rng,
        });

        let handle = tokio::spawn(Self::read_loop(Arc::clone(&conn), read_half));
        *conn.reader.lock().unwrap() = Some(handle);
        conn
    }

    /// Fingerprint of the relay this connection reaches
    pub fn peer_fingerprint(&self) -> &str {
        &self.peer_fingerprint
    }

    /// Circuit-id width negotiated on this connection
    pub fn id_width(&self) -> CircIdWidth {
        self.id_width
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of circuits currently multiplexed on this connection
    pub fn circuit_count(&self) -> usize {
        self.circuits.lock().unwrap().len()
    }

    /// Write one cell to the link.
    pub async fn send_cell(&self, cell: &Cell) -> Result<()> {
        if self.is_closed() {
            return Err(TorError::ConnectionClosed(format!(
                "connection to {} is closed",
                self.peer_fingerprint
            )));
        }
        let bytes = cell.to_bytes(self.id_width)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| TorError::ConnectionClosed(format!("cell write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| TorError::ConnectionClosed(format!("cell flush failed: {}", e)))?;
        Ok(())
    }

    /// Register a circuit on this connection and allocate its id.
    ///
    /// Ids are drawn at random (with the initiator's high bit set) and
    /// retried on collision.
    pub(crate) fn attach_circuit(&self, circuit: &Arc<Circuit>) -> Result<u32> {
        if self.is_closed() {
            return Err(TorError::ConnectionClosed(format!(
                "connection to {} is closed",
                self.peer_fingerprint
            )));
        }
        let mut circuits = self.circuits.lock().unwrap();
        for _ in 0..Self::ID_ALLOC_ATTEMPTS {
            let raw = self.rng.next_u32() & self.id_width.id_mask();
            let id = match self.id_width {
                CircIdWidth::Two => raw | 0x8000,
                CircIdWidth::Four => raw | 0x8000_0000,
            };
            if let std::collections::hash_map::Entry::Vacant(slot) = circuits.entry(id) {
                slot.insert(Arc::downgrade(circuit));
                return Ok(id);
            }
        }
        Err(TorError::ResourceExhausted(
            "no free circuit id on connection".into(),
        ))
    }

    /// Remove a circuit's dispatch entry.
    pub(crate) fn detach_circuit(&self, circuit_id: u32) {
        self.circuits.lock().unwrap().remove(&circuit_id);
    }

    /// Reader task: parse inbound cells and dispatch them per circuit.
    async fn read_loop(conn: Arc<Connection>, mut reader: ReadHalf<Box<dyn CellLink>>) {
        let frame_len = conn.id_width.cell_size();
        let mut frame = vec![0u8; frame_len];
        loop {
            if let Err(e) = reader.read_exact(&mut frame).await {
                conn.close_with(TorError::ConnectionClosed(format!(
                    "read from {} failed: {}",
                    conn.peer_fingerprint, e
                )))
                .await;
                return;
            }

            let cell = match Cell::from_bytes(&frame, conn.id_width) {
                Ok(cell) => cell,
                Err(e) => {
                    log::warn!(
                        "Undecodable cell from {}: {}",
                        conn.peer_fingerprint,
                        e
                    );
                    conn.close_with(e).await;
                    return;
                }
            };

            if cell.command == CellCommand::Padding || cell.command == CellCommand::Vpadding {
                continue;
            }

            let circuit = {
                let circuits = conn.circuits.lock().unwrap();
                circuits.get(&cell.circuit_id).and_then(Weak::upgrade)
            };
            match circuit {
                Some(circuit) => circuit.handle_inbound_cell(cell).await,
                None => {
                    log::debug!(
                        "Dropping {:?} cell for unknown circuit {}",
                        cell.command,
                        cell.circuit_id
                    );
                }
            }
        }
    }

    /// Close the connection and tear down every circuit bound to it.
    pub(crate) async fn close_with(&self, cause: TorError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let circuits: Vec<Arc<Circuit>> = {
            let mut map = self.circuits.lock().unwrap();
            map.drain().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        if !circuits.is_empty() {
            log::info!(
                "Connection to {} closed, tearing down {} circuits: {}",
                self.peer_fingerprint,
                circuits.len(),
                cause
            );
        }
        for circuit in circuits {
            circuit.handle_connection_closed(cause.clone()).await;
        }
    }

    /// Close and stop the reader task.
    pub(crate) async fn shutdown(&self) {
        self.close_with(TorError::ConnectionClosed("shutting down".into()))
            .await;
        let handle = self.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Cache of live connections, one per relay.
pub struct ConnectionCache {
    transport: Box<dyn ChannelTransport>,
    connections: tokio::sync::Mutex<HashMap<String, Arc<Connection>>>,
    rng: SecureRandom,
}

impl ConnectionCache {
    /// Create a cache over the given transport.
    pub fn new(transport: Box<dyn ChannelTransport>, rng: SecureRandom) -> Self {
        Self {
            transport,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            rng,
        }
    }

    /// Get a connection to `relay`, reusing a live one when possible.
    pub async fn connection_to(&self, relay: &Relay) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(&relay.fingerprint) {
            if !existing.is_closed() {
                log::debug!("Reusing connection to {}", relay.nickname);
                return Ok(Arc::clone(existing));
            }
            connections.remove(&relay.fingerprint);
        }

        let link = self
            .transport
            .connect(relay)
            .await
            .map_err(|e| TorError::ConnectionFailed(format!("{}: {}", relay.nickname, e)))?;
        let conn = Connection::launch(relay, link, self.rng);
        connections.insert(relay.fingerprint.clone(), Arc::clone(&conn));
        log::debug!("Opened connection to {}", relay.nickname);
        Ok(conn)
    }

    /// Number of cached connections (including recently closed ones).
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Close every cached connection.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.shutdown().await;
        }
    }
}
