//! Build and initialization event sinks
//!
//! Circuit builds report progress as a small tagged event type delivered
//! to a synchronous observer. Directory streams additionally report
//! numbered initialization milestones to a best-effort progress sink.

/// Events emitted while a circuit build is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBuildEvent {
    /// One hop completed its create/extend handshake.
    NodeAdded {
        /// Position of the hop in the path, starting at 0.
        index: usize,
        /// Fingerprint of the relay at that hop.
        fingerprint: String,
    },
    /// The whole path is built and the circuit is open.
    Completed,
    /// The build failed.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

/// Observer for circuit build progress.
pub trait BuildEventSink: Send + Sync {
    /// Called for every build event, on the building task.
    fn on_build_event(&self, event: CircuitBuildEvent);
}

/// Sink that discards all build events.
#[derive(Debug, Default)]
pub struct NullBuildEventSink;

impl BuildEventSink for NullBuildEventSink {
    fn on_build_event(&self, _event: CircuitBuildEvent) {}
}

/// Best-effort sink for client initialization milestones.
///
/// Milestone codes are chosen by the embedding application; delivery
/// failures are ignored.
pub trait ProgressSink: Send + Sync {
    /// Report that the milestone identified by `code` was reached.
    fn notify_event(&self, code: u32);
}

/// Sink that discards all progress events.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn notify_event(&self, _code: u32) {}
}
