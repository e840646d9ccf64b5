//! Wire protocol pieces used by the circuit layer
//!
//! - Cell and relay-cell framing
//! - Per-hop relay crypto (AES-CTR keystreams, running digests, KDFs)
//! - Create/extend handshakes
//! - SENDME flow-control windows

pub mod cell;
pub mod crypto;
pub mod flow_control;
pub mod handshake;

pub use cell::{Cell, CellCommand, CircIdWidth, RelayCell, RelayCommand};
pub use crypto::{derive_fast, derive_ntor, HopCryptState, HopKeyMaterial};
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use handshake::{FastClient, HopHandshake, NtorClient};
