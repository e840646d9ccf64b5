//! # tor-circuits
//!
//! Circuit management core for a Tor client: builds, maintains and
//! multiplexes anonymizing circuits across a pool of relay
//! connections, and dispatches application stream requests (exit
//! streams and directory streams) onto suitable circuits.
//!
//! ## Architecture
//!
//! ```text
//! CircuitManager          registry of pending/active/clean circuits,
//!   |                     stream-opening API
//!   +-- scheduler         periodic task: plan builds, match requests
//!   +-- Circuit           status machine + hop list + cell I/O
//!   |     +-- TorStream   per-stream windows and buffers
//!   +-- ConnectionCache   one framed connection per relay
//!         +-- transport   supplied by the embedding application
//! ```
//!
//! The directory (router lookup, exit policies, families) and the
//! transport (TLS or otherwise) are external collaborators behind the
//! [`Directory`] and [`ChannelTransport`] traits; cell crypto and the
//! create/extend handshakes live in [`protocol`].

pub mod circuit;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod events;
pub mod manager;
pub mod protocol;
pub mod relay;
pub mod rng;

mod path;
mod requests;
mod scheduler;

pub use circuit::status::CircuitStatus;
pub use circuit::stream::{OpenStreamResponse, StreamStatus, TorStream};
pub use circuit::{Circuit, CircuitKind};
pub use config::CircuitManagerConfig;
pub use connection::{CellLink, ChannelTransport, Connection, ConnectionCache};
pub use directory::{Directory, StaticDirectory};
pub use error::{ErrorCode, Result, TorError};
pub use events::{BuildEventSink, CircuitBuildEvent, ProgressSink};
pub use manager::{CircuitManager, DirectoryStreamRequest, ManagerStats};
pub use relay::{ExitPolicy, ExitTarget, Relay, RelayFlags, TargetHost};
pub use rng::SecureRandom;
