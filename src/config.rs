//! Configuration for the circuit manager
//!
//! Tunables for the build scheduler, stream timeouts and resource caps.
//! Config loading from files is left to the embedding application.

use std::time::Duration;

/// Configuration for circuit building and stream dispatch
#[derive(Debug, Clone)]
pub struct CircuitManagerConfig {
    /// Minimum number of clean general-purpose circuits to keep ready
    pub clean_circuit_floor: usize,

    /// Maximum number of circuits building concurrently
    pub max_pending_circuits: usize,

    /// How long a circuit build may take before it is abandoned
    pub build_timeout: Duration,

    /// Maximum lifetime of a circuit once it has carried a stream
    pub max_dirty_lifetime: Duration,

    /// How long a stream open waits for RELAY_CONNECTED
    pub stream_open_timeout: Duration,

    /// How long a single create/extend step waits for its response cell
    pub control_response_timeout: Duration,

    /// How long an exit-stream request may sit unmatched before it
    /// completes with a timeout response
    pub request_deadline: Duration,

    /// Scheduler tick interval
    pub tick_interval: Duration,

    /// Use CREATE_FAST for the first hop instead of the ntor handshake.
    ///
    /// One-hop directory circuits always use CREATE_FAST.
    pub first_hop_fast_create: bool,
}

impl Default for CircuitManagerConfig {
    fn default() -> Self {
        Self {
            clean_circuit_floor: 2,
            max_pending_circuits: 4,
            build_timeout: Duration::from_secs(30),
            max_dirty_lifetime: Duration::from_secs(10 * 60),
            stream_open_timeout: Duration::from_secs(10),
            control_response_timeout: Duration::from_secs(10),
            request_deadline: Duration::from_secs(2 * 60),
            tick_interval: Duration::from_secs(1),
            first_hop_fast_create: false,
        }
    }
}
