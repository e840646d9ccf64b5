//! Tor cell protocol
//!
//! Implements the cell format used on relay connections. Cells are the
//! basic unit of communication: a circuit id, a command byte and a
//! fixed-size payload. Relay cells carry an inner structure addressed to
//! a specific hop; only the circuit I/O layer parses or emits it.

use crate::error::{Result, TorError};

/// Width of the circuit-id field on a connection.
///
/// Early link protocols used 2-byte ids; version 4 and later use 4
/// bytes. The width is a property of the connection, not of the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircIdWidth {
    /// 2-byte circuit ids (link protocol <= 3)
    Two,
    /// 4-byte circuit ids (link protocol >= 4)
    Four,
}

impl CircIdWidth {
    /// Number of bytes the circuit id occupies on the wire.
    pub fn bytes(self) -> usize {
        match self {
            CircIdWidth::Two => 2,
            CircIdWidth::Four => 4,
        }
    }

    /// Total size of a fixed-length cell on a connection of this width.
    pub fn cell_size(self) -> usize {
        self.bytes() + 1 + Cell::PAYLOAD_SIZE
    }

    /// Mask of circuit-id values representable at this width.
    pub fn id_mask(self) -> u32 {
        match self {
            CircIdWidth::Two => 0xffff,
            CircIdWidth::Four => 0xffff_ffff,
        }
    }
}

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit (deprecated)
    Create = 1,
    /// CREATED - circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - keyless circuit creation
    CreateFast = 5,
    /// CREATED_FAST - keyless circuit created
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell allowed during circuit extension
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether this command carries an onion-encrypted relay payload.
    pub fn is_relay(self) -> bool {
        matches!(self, CellCommand::Relay | CellCommand::RelayEarly)
    }
}

/// A fixed-length cell
#[derive(Debug, Clone)]
pub struct Cell {
    /// Circuit ID (width on the wire depends on the connection)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload, padded to [`Cell::PAYLOAD_SIZE`] on the wire
    pub payload: Vec<u8>,
}

impl Cell {
    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a DESTROY cell with the given reason byte
    pub fn destroy(circuit_id: u32, reason: u8) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, vec![reason])
    }

    /// Serialize the cell for a connection with the given id width
    pub fn to_bytes(&self, width: CircIdWidth) -> Result<Vec<u8>> {
        if self.payload.len() > Self::PAYLOAD_SIZE {
            return Err(TorError::Internal(format!(
                "Cell payload too large: {} bytes",
                self.payload.len()
            )));
        }
        if self.circuit_id > width.id_mask() {
            return Err(TorError::Internal(format!(
                "Circuit id {:#x} does not fit the connection's id width",
                self.circuit_id
            )));
        }

        let mut buf = Vec::with_capacity(width.cell_size());
        match width {
            CircIdWidth::Two => buf.extend_from_slice(&(self.circuit_id as u16).to_be_bytes()),
            CircIdWidth::Four => buf.extend_from_slice(&self.circuit_id.to_be_bytes()),
        }
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.payload);
        buf.resize(width.cell_size(), 0);
        Ok(buf)
    }

    /// Parse a cell from one wire frame
    pub fn from_bytes(data: &[u8], width: CircIdWidth) -> Result<Self> {
        if data.len() < width.cell_size() {
            return Err(TorError::ProtocolError("Cell too short".into()));
        }

        let id_len = width.bytes();
        let circuit_id = match width {
            CircIdWidth::Two => u16::from_be_bytes([data[0], data[1]]) as u32,
            CircIdWidth::Four => u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        };

        let command = CellCommand::from_u8(data[id_len]).ok_or_else(|| {
            TorError::ProtocolError(format!("Unknown command: {}", data[id_len]))
        })?;

        let payload = data[id_len + 1..width.cell_size()].to_vec();

        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - stream data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - long-range padding
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory stream
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// Relay cell (inner structure of a RELAY or RELAY_EARLY payload)
#[derive(Debug, Clone)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (zero after successful decryption at the target hop)
    pub recognized: u16,

    /// Stream ID (zero for circuit-level cells)
    pub stream_id: u16,

    /// Digest (4 bytes of the running hop digest)
    pub digest: [u8; 4],

    /// Length of data
    pub length: u16,

    /// Data (up to [`RelayCell::MAX_DATA_SIZE`] bytes)
    pub data: Vec<u8>,
}

/// Byte offset of the digest field within a relay payload.
pub const RELAY_DIGEST_OFFSET: usize = 5;

/// Relay payload header length (command + recognized + stream + digest + length).
pub const RELAY_HEADER_LEN: usize = 11;

impl RelayCell {
    /// Maximum data size in a relay cell
    pub const MAX_DATA_SIZE: usize = Cell::PAYLOAD_SIZE - RELAY_HEADER_LEN;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= Self::MAX_DATA_SIZE);
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            length: data.len() as u16,
            data,
        }
    }

    /// Serialize to a full relay payload (digest field zeroed)
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::Internal(format!(
                "Relay data too large: {} bytes",
                self.data.len()
            )));
        }

        let mut buf = Vec::with_capacity(Cell::PAYLOAD_SIZE);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(Cell::PAYLOAD_SIZE, 0);
        Ok(buf)
    }

    /// Parse a relay cell from a decrypted payload
    pub fn from_payload(data: &[u8]) -> Result<Self> {
        if data.len() < RELAY_HEADER_LEN {
            return Err(TorError::ProtocolError("Relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(data[0]).ok_or_else(|| {
            TorError::ProtocolError(format!("Unknown relay command: {}", data[0]))
        })?;

        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]);

        let data_end = RELAY_HEADER_LEN + length as usize;
        if data_end > data.len() {
            return Err(TorError::ProtocolError("Relay cell data truncated".into()));
        }

        let cell_data = data[RELAY_HEADER_LEN..data_end].to_vec();

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            length,
            data: cell_data,
        })
    }

    /// Quick check of the recognized field of a decrypted payload.
    pub fn payload_recognized(payload: &[u8]) -> bool {
        payload.len() >= RELAY_HEADER_LEN && payload[1] == 0 && payload[2] == 0
    }
}
