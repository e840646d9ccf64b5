//! Error types for the circuit management core
//!
//! This module provides the error taxonomy for circuit building and
//! stream opening:
//! - Detailed error variants for different failure modes
//! - Error classification (fatal vs retryable)
//! - Error codes for programmatic handling

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    ConnectionTimeout = 101,
    ConnectionClosed = 102,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    UnexpectedCell = 201,
    DigestMismatch = 202,
    HandshakeFailed = 203,
    WindowOverrun = 204,

    // Circuit errors (3xx)
    CircuitBuildFailed = 300,
    CircuitDestroyed = 301,
    StreamFailed = 303,
    StreamTimeout = 304,
    PolicyReject = 305,

    // Security errors (4xx) - FATAL
    EntropyError = 402,

    // Cryptographic errors (5xx)
    CryptoError = 500,
    KeyDerivationFailed = 501,

    // Directory errors (6xx)
    NoRelaysAvailable = 602,

    // Caller errors (8xx)
    Interrupted = 800,
    InvalidTarget = 801,

    // Internal errors (9xx)
    InternalError = 900,
    ResourceExhausted = 901,
}

/// Main error type for the circuit management core
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("Digest mismatch in relay cell")]
    DigestMismatch,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Flow-control window overrun: {0}")]
    WindowOverrun(String),

    // ===== Circuit Errors =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream ended by remote: reason={reason} ({reason_name})")]
    StreamEnd { reason: u8, reason_name: String },

    #[error("Stream open timed out")]
    StreamTimeout,

    #[error("No circuit admits exit target: {0}")]
    PolicyReject(String),

    // ===== Security Errors (FATAL) =====
    #[error("Entropy/RNG failure: {0}")]
    EntropyError(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto: {0}")]
    Crypto(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ===== Directory Errors =====
    #[error("No relays available: {0}")]
    NoRelaysAvailable(String),

    // ===== Caller Errors =====
    #[error("Stream request interrupted")]
    Interrupted,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            // Connection
            TorError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            TorError::Timeout => ErrorCode::ConnectionTimeout,
            TorError::ConnectionClosed(_) => ErrorCode::ConnectionClosed,

            // Protocol
            TorError::ProtocolError(_) => ErrorCode::ProtocolViolation,
            TorError::UnexpectedCell { .. } => ErrorCode::UnexpectedCell,
            TorError::DigestMismatch => ErrorCode::DigestMismatch,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,
            TorError::WindowOverrun(_) => ErrorCode::WindowOverrun,

            // Circuit
            TorError::CircuitBuildFailed(_) => ErrorCode::CircuitBuildFailed,
            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::Stream(_) => ErrorCode::StreamFailed,
            TorError::StreamEnd { .. } => ErrorCode::StreamFailed,
            TorError::StreamTimeout => ErrorCode::StreamTimeout,
            TorError::PolicyReject(_) => ErrorCode::PolicyReject,

            // Security (fatal)
            TorError::EntropyError(_) => ErrorCode::EntropyError,

            // Crypto
            TorError::Crypto(_) => ErrorCode::CryptoError,
            TorError::KeyDerivationFailed(_) => ErrorCode::KeyDerivationFailed,

            // Directory
            TorError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,

            // Caller
            TorError::Interrupted => ErrorCode::Interrupted,
            TorError::InvalidTarget(_) => ErrorCode::InvalidTarget,

            // Internal
            TorError::Internal(_) => ErrorCode::InternalError,
            TorError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        }
    }

    /// Whether this error is fatal (should abort the entire client)
    pub fn is_fatal(&self) -> bool {
        matches!(self, TorError::EntropyError(_))
    }

    /// Whether this error can be retried on a different circuit or relay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailed(_)
                | TorError::Timeout
                | TorError::ConnectionClosed(_)
                | TorError::CircuitBuildFailed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::HandshakeFailed(_)
                | TorError::Stream(_)
                | TorError::StreamEnd { .. }
                | TorError::StreamTimeout
                | TorError::PolicyReject(_)
        )
    }

    /// Whether this error indicates a protocol violation on the circuit.
    ///
    /// A violating circuit must be destroyed and never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TorError::ProtocolError(_)
                | TorError::UnexpectedCell { .. }
                | TorError::DigestMismatch
                | TorError::WindowOverrun(_)
        )
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
        .to_string();

        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }

    /// Create a StreamEnd error with the RELAY_END reason name
    pub fn stream_end(reason: u8) -> Self {
        let reason_name = match reason {
            1 => "MISC",
            2 => "RESOLVEFAILED",
            3 => "CONNECTREFUSED",
            4 => "EXITPOLICY",
            5 => "DESTROY",
            6 => "DONE",
            7 => "TIMEOUT",
            8 => "NOROUTE",
            9 => "HIBERNATING",
            10 => "INTERNAL",
            11 => "RESOURCELIMIT",
            12 => "CONNRESET",
            13 => "TORPROTOCOL",
            14 => "NOTDIRECTORY",
            _ => "UNKNOWN",
        }
        .to_string();

        TorError::StreamEnd {
            reason,
            reason_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(TorError::EntropyError("test".into()).is_fatal());

        assert!(!TorError::ConnectionFailed("test".into()).is_fatal());
        assert!(!TorError::Timeout.is_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TorError::ConnectionFailed("test".into()).is_retryable());
        assert!(TorError::StreamTimeout.is_retryable());
        assert!(TorError::CircuitBuildFailed("test".into()).is_retryable());

        assert!(!TorError::DigestMismatch.is_retryable());
        assert!(!TorError::Interrupted.is_retryable());
    }

    #[test]
    fn test_protocol_violations_are_not_retryable() {
        let violation = TorError::WindowOverrun("window went negative".into());
        assert!(violation.is_protocol_violation());
        assert!(!violation.is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TorError::ConnectionFailed("test".into()).code(),
            ErrorCode::ConnectionFailed
        );
        assert_eq!(TorError::StreamTimeout.code(), ErrorCode::StreamTimeout);
        assert_eq!(TorError::Interrupted.code(), ErrorCode::Interrupted);
    }

    #[test]
    fn test_circuit_destroyed() {
        let err = TorError::circuit_destroyed(1);
        if let TorError::CircuitDestroyed {
            reason,
            reason_name,
        } = err
        {
            assert_eq!(reason, 1);
            assert_eq!(reason_name, "PROTOCOL");
        } else {
            panic!("Expected CircuitDestroyed");
        }
    }

    #[test]
    fn test_stream_end_reason_names() {
        let err = TorError::stream_end(4);
        if let TorError::StreamEnd { reason_name, .. } = err {
            assert_eq!(reason_name, "EXITPOLICY");
        } else {
            panic!("Expected StreamEnd");
        }
    }
}
