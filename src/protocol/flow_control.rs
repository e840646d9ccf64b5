//! SENDME flow control
//!
//! Each circuit and each stream has a send window and a deliver window.
//! Sending relay data decrements the send window; it is replenished in
//! fixed steps by SENDME cells from the far end. Delivered data
//! decrements the deliver window; when it falls a full step below its
//! initial value we owe the far end a SENDME.
//!
//! A window overrun in either direction is protocol-fatal for the
//! circuit: a send below zero, a delivery below zero, or a SENDME
//! pushing the send window above its initial bound.

use crate::error::{Result, TorError};

/// Circuit-level flow control
///
/// One pair of windows for the whole circuit, shared by all streams.
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    /// Relay data cells we may still send
    send_window: i32,

    /// Relay data cells the far end may still send us
    deliver_window: i32,
}

impl CircuitFlowControl {
    /// Initial circuit window size
    pub const INITIAL_WINDOW: i32 = 1000;

    /// Window increment per SENDME
    pub const WINDOW_INCREMENT: i32 = 100;

    /// Create circuit flow control with full windows
    pub fn new() -> Self {
        Self {
            send_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
        }
    }

    /// Whether a relay data cell may be sent right now
    pub fn can_send(&self) -> bool {
        self.send_window > 0
    }

    /// Current send window (for diagnostics)
    pub fn send_window(&self) -> i32 {
        self.send_window
    }

    /// Account for one sent relay data cell
    pub fn on_send(&mut self) -> Result<()> {
        self.send_window -= 1;
        if self.send_window < 0 {
            return Err(TorError::WindowOverrun(
                "circuit send window went negative".into(),
            ));
        }
        Ok(())
    }

    /// Account for a received circuit-level SENDME
    pub fn on_sendme_received(&mut self) -> Result<()> {
        self.send_window += Self::WINDOW_INCREMENT;
        if self.send_window > Self::INITIAL_WINDOW {
            return Err(TorError::WindowOverrun(
                "unexpected circuit SENDME".into(),
            ));
        }
        log::debug!(
            "Circuit send window: {} (+{})",
            self.send_window,
            Self::WINDOW_INCREMENT
        );
        Ok(())
    }

    /// Account for one delivered relay data cell.
    ///
    /// Returns `true` when a circuit-level SENDME is now owed.
    pub fn on_deliver(&mut self) -> Result<bool> {
        self.deliver_window -= 1;
        if self.deliver_window < 0 {
            return Err(TorError::WindowOverrun(
                "circuit deliver window went negative".into(),
            ));
        }
        if self.deliver_window <= Self::INITIAL_WINDOW - Self::WINDOW_INCREMENT {
            self.deliver_window += Self::WINDOW_INCREMENT;
            log::debug!("Circuit deliver window refilled, SENDME due");
            return Ok(true);
        }
        Ok(false)
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control
///
/// Independent windows for a single stream within a circuit.
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    send_window: i32,
    deliver_window: i32,
    stream_id: u16,
}

impl StreamFlowControl {
    /// Initial stream window size
    pub const INITIAL_WINDOW: i32 = 500;

    /// Window increment per SENDME
    pub const WINDOW_INCREMENT: i32 = 50;

    /// Create stream flow control with full windows
    pub fn new(stream_id: u16) -> Self {
        Self {
            send_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
            stream_id,
        }
    }

    /// Whether a data cell may be sent on this stream right now
    pub fn can_send(&self) -> bool {
        self.send_window > 0
    }

    /// Account for one sent data cell
    pub fn on_send(&mut self) -> Result<()> {
        self.send_window -= 1;
        if self.send_window < 0 {
            return Err(TorError::WindowOverrun(format!(
                "stream {} send window went negative",
                self.stream_id
            )));
        }
        Ok(())
    }

    /// Account for a received stream-level SENDME
    pub fn on_sendme_received(&mut self) -> Result<()> {
        self.send_window += Self::WINDOW_INCREMENT;
        if self.send_window > Self::INITIAL_WINDOW {
            return Err(TorError::WindowOverrun(format!(
                "unexpected SENDME on stream {}",
                self.stream_id
            )));
        }
        log::debug!(
            "Stream {} send window: {} (+{})",
            self.stream_id,
            self.send_window,
            Self::WINDOW_INCREMENT
        );
        Ok(())
    }

    /// Account for one delivered data cell.
    ///
    /// Returns `true` when a stream-level SENDME is now owed.
    pub fn on_deliver(&mut self) -> Result<bool> {
        self.deliver_window -= 1;
        if self.deliver_window < 0 {
            return Err(TorError::WindowOverrun(format!(
                "stream {} deliver window went negative",
                self.stream_id
            )));
        }
        if self.deliver_window <= Self::INITIAL_WINDOW - Self::WINDOW_INCREMENT {
            self.deliver_window += Self::WINDOW_INCREMENT;
            return Ok(true);
        }
        Ok(false)
    }
}
