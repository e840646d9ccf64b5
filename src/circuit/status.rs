//! Circuit lifecycle state machine
//!
//! Tracks a circuit's build progress and usage history:
//!
//! ```text
//! UNCONNECTED -> BUILDING -> OPEN -> DESTROYED
//!       \            \        (DIRTY is a sub-flag of OPEN)
//!        \            \
//!         +------------+--> FAILED (terminal)
//! ```
//!
//! Timestamps reset on BUILDING and OPEN; `dirty_since` is set when the
//! first stream is attached. Transitions that would be a no-op are
//! idempotent; genuinely illegal transitions are programmer errors.

use std::time::Instant;

/// Consecutive stream-open timeouts after which a circuit should be
/// dropped.
pub const STREAM_TIMEOUT_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unconnected,
    Building,
    Open,
    Failed,
    Destroyed,
}

/// Per-circuit state record
#[derive(Debug)]
pub struct CircuitStatus {
    state: State,
    dirty: bool,
    created_at: Instant,
    dirty_since: Option<Instant>,
    stream_timeouts: u32,
}

impl CircuitStatus {
    /// New status in the UNCONNECTED state
    pub fn new() -> Self {
        Self {
            state: State::Unconnected,
            dirty: false,
            created_at: Instant::now(),
            dirty_since: None,
            stream_timeouts: 0,
        }
    }

    pub fn is_unconnected(&self) -> bool {
        self.state == State::Unconnected
    }

    pub fn is_building(&self) -> bool {
        self.state == State::Building
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Open
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == State::Destroyed
    }

    /// Terminal either way: FAILED or DESTROYED
    pub fn is_closed(&self) -> bool {
        self.is_failed() || self.is_destroyed()
    }

    /// Enter BUILDING. Legal only from UNCONNECTED (idempotent from
    /// BUILDING itself); resets the creation timestamp.
    pub fn set_state_building(&mut self) {
        match self.state {
            State::Unconnected => {
                self.state = State::Building;
                self.created_at = Instant::now();
            }
            State::Building => {}
            other => panic!("illegal circuit transition: {:?} -> BUILDING", other),
        }
    }

    /// Enter OPEN from BUILDING; resets the creation timestamp.
    ///
    /// Returns `false` without transitioning when the circuit was
    /// already torn down (a concurrent destroy won the race).
    pub fn set_state_open(&mut self) -> bool {
        match self.state {
            State::Building => {
                self.state = State::Open;
                self.created_at = Instant::now();
                true
            }
            State::Open => true,
            State::Failed | State::Destroyed => false,
            State::Unconnected => {
                panic!("illegal circuit transition: UNCONNECTED -> OPEN")
            }
        }
    }

    /// Enter FAILED from UNCONNECTED or BUILDING. No-op when already
    /// terminal.
    pub fn set_state_failed(&mut self) {
        match self.state {
            State::Unconnected | State::Building => self.state = State::Failed,
            State::Failed | State::Destroyed => {}
            State::Open => panic!("illegal circuit transition: OPEN -> FAILED"),
        }
    }

    /// Enter DESTROYED. Legal from any state; terminal.
    pub fn set_state_destroyed(&mut self) {
        self.state = State::Destroyed;
    }

    /// Record the first stream attachment. Idempotent.
    pub fn mark_dirty(&mut self) {
        if !self.dirty {
            self.dirty = true;
            self.dirty_since = Some(Instant::now());
        }
    }

    /// Count one consecutive stream-open timeout.
    ///
    /// Returns `true` once the policy threshold is reached, suggesting
    /// the circuit should be dropped.
    pub fn count_stream_timeout(&mut self) -> bool {
        self.stream_timeouts += 1;
        self.stream_timeouts >= STREAM_TIMEOUT_LIMIT
    }

    /// Reset the consecutive-timeout counter after a successful open.
    pub fn clear_stream_timeouts(&mut self) {
        self.stream_timeouts = 0;
    }

    /// Milliseconds since the first stream attachment, or 0 when clean.
    pub fn milliseconds_dirty(&self) -> u128 {
        self.dirty_since
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0)
    }

    /// Milliseconds since the last BUILDING/OPEN transition.
    pub fn milliseconds_since_creation(&self) -> u128 {
        self.created_at.elapsed().as_millis()
    }
}

impl Default for CircuitStatus {
    fn default() -> Self {
        Self::new()
    }
}
