//! Streams multiplexed over a circuit
//!
//! A [`TorStream`] is one logical byte-channel inside a circuit. Writes
//! are chunked into RELAY_DATA cells and obey both the stream and the
//! circuit SENDME windows; reads drain the per-stream delivery buffer
//! filled by the circuit's cell dispatch.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::circuit::Circuit;
use crate::error::{ErrorCode, Result, TorError};
use crate::protocol::cell::RelayCell;
use crate::protocol::flow_control::StreamFlowControl;

/// RELAY_END reason used for clean local closes.
pub const END_REASON_DONE: u8 = 6;

/// Items delivered into a stream's receive buffer.
#[derive(Debug)]
pub(crate) enum StreamItem {
    /// Payload of one RELAY_DATA cell
    Data(Vec<u8>),
    /// Remote RELAY_END
    End { reason: u8 },
    /// The circuit was torn down under the stream
    Aborted(TorError),
}

/// Reply to a stream-open attempt.
#[derive(Debug)]
pub(crate) enum StreamReply {
    /// RELAY_CONNECTED arrived
    Connected,
    /// RELAY_END arrived instead
    End { reason: u8 },
    /// The circuit was torn down while the open was pending
    Aborted(TorError),
}

/// Bookkeeping for one stream slot in the circuit's stream table.
pub(crate) struct StreamEntry {
    /// Present until the open completes; consumed by CONNECTED/END.
    pub reply: Option<tokio::sync::oneshot::Sender<StreamReply>>,
    /// Delivery buffer toward the stream handle.
    pub incoming: mpsc::UnboundedSender<StreamItem>,
    /// Stream-level SENDME windows.
    pub flow: StreamFlowControl,
    /// Whether RELAY_CONNECTED has arrived.
    pub connected: bool,
}

impl StreamEntry {
    pub fn new(
        stream_id: u16,
    ) -> (
        Self,
        tokio::sync::oneshot::Receiver<StreamReply>,
        mpsc::UnboundedReceiver<StreamItem>,
    ) {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        (
            Self {
                reply: Some(reply_tx),
                incoming: data_tx,
                flow: StreamFlowControl::new(stream_id),
                connected: false,
            },
            reply_rx,
            data_rx,
        )
    }
}

/// An open stream through a circuit
pub struct TorStream {
    circuit: Arc<Circuit>,
    stream_id: u16,
    target: String,
    incoming: mpsc::UnboundedReceiver<StreamItem>,
    closed: bool,
    at_eof: bool,
}

impl TorStream {
    pub(crate) fn new(
        circuit: Arc<Circuit>,
        stream_id: u16,
        target: String,
        incoming: mpsc::UnboundedReceiver<StreamItem>,
    ) -> Self {
        Self {
            circuit,
            stream_id,
            target,
            incoming,
            closed: false,
            at_eof: false,
        }
    }

    /// Stream id within the circuit
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// The circuit carrying this stream
    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    /// Human-readable target description
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the stream has been closed locally or remotely
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write all of `data`, chunked into RELAY_DATA cells.
    ///
    /// Suspends while the stream or circuit send window is exhausted.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::Stream("Stream is closed".into()));
        }
        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            self.circuit
                .send_stream_data(self.stream_id, chunk.to_vec())
                .await?;
        }
        Ok(())
    }

    /// Read the next chunk of delivered data.
    ///
    /// Returns `Ok(None)` at clean end-of-stream.
    pub async fn read_some(&mut self) -> Result<Option<Vec<u8>>> {
        if self.at_eof || self.closed {
            return Ok(None);
        }
        match self.incoming.recv().await {
            Some(StreamItem::Data(data)) => Ok(Some(data)),
            Some(StreamItem::End { reason }) => {
                self.at_eof = true;
                self.closed = true;
                if reason == END_REASON_DONE {
                    Ok(None)
                } else {
                    Err(TorError::stream_end(reason))
                }
            }
            Some(StreamItem::Aborted(err)) => {
                self.at_eof = true;
                self.closed = true;
                Err(err)
            }
            None => {
                self.at_eof = true;
                Ok(None)
            }
        }
    }

    /// Read until end-of-stream, collecting everything delivered.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_some().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Close the stream with RELAY_END (reason DONE).
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.circuit
            .close_stream(self.stream_id, END_REASON_DONE)
            .await;
    }
}

impl fmt::Debug for TorStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorStream")
            .field("stream_id", &self.stream_id)
            .field("target", &self.target)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if !self.closed {
            log::debug!(
                "Stream {} to {} dropped without close",
                self.stream_id,
                self.target
            );
            self.circuit.forget_stream(self.stream_id);
        }
    }
}

/// Outcome of a stream-open request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// The stream is open and usable
    StreamOpened,
    /// No `connected` reply within the deadline
    StreamTimeout,
    /// The remote end refused or the request failed
    StreamError,
    /// The entry connection could not be established
    ConnectionFail,
}

/// Response handed back to stream-open callers
#[derive(Debug)]
pub struct OpenStreamResponse {
    /// Outcome classification
    pub status: StreamStatus,
    /// The opened stream, on success
    pub stream: Option<TorStream>,
    /// The terminal error, on failure
    pub error: Option<TorError>,
}

impl OpenStreamResponse {
    /// Successful open
    pub fn opened(stream: TorStream) -> Self {
        Self {
            status: StreamStatus::StreamOpened,
            stream: Some(stream),
            error: None,
        }
    }

    /// Timed-out open
    pub fn timeout() -> Self {
        Self {
            status: StreamStatus::StreamTimeout,
            stream: None,
            error: Some(TorError::StreamTimeout),
        }
    }

    /// Failed open
    pub fn error(err: TorError) -> Self {
        Self {
            status: StreamStatus::StreamError,
            stream: None,
            error: Some(err),
        }
    }

    /// Open that never reached the network
    pub fn connection_fail(err: TorError) -> Self {
        Self {
            status: StreamStatus::ConnectionFail,
            stream: None,
            error: Some(err),
        }
    }

    /// Classify a stream-open result
    pub fn from_result(result: Result<TorStream>) -> Self {
        match result {
            Ok(stream) => Self::opened(stream),
            Err(TorError::StreamTimeout) => Self::timeout(),
            Err(err @ TorError::ConnectionFailed(_))
            | Err(err @ TorError::ConnectionClosed(_))
            | Err(err @ TorError::Timeout) => Self::connection_fail(err),
            Err(err) => Self::error(err),
        }
    }

    /// Whether the stream opened
    pub fn is_opened(&self) -> bool {
        self.status == StreamStatus::StreamOpened
    }

    /// Code of the carried error, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code())
    }

    /// Take the stream out of a successful response
    pub fn into_stream(self) -> Result<TorStream> {
        match self.stream {
            Some(stream) => Ok(stream),
            None => Err(self
                .error
                .unwrap_or_else(|| TorError::Internal("response carries no stream".into()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_classification() {
        let resp = OpenStreamResponse::from_result(Err(TorError::StreamTimeout));
        assert_eq!(resp.status, StreamStatus::StreamTimeout);
        assert_eq!(resp.error_code(), Some(ErrorCode::StreamTimeout));

        let resp =
            OpenStreamResponse::from_result(Err(TorError::ConnectionFailed("refused".into())));
        assert_eq!(resp.status, StreamStatus::ConnectionFail);

        let resp = OpenStreamResponse::from_result(Err(TorError::stream_end(4)));
        assert_eq!(resp.status, StreamStatus::StreamError);
        assert!(!resp.is_opened());
    }

    #[test]
    fn test_into_stream_on_failure_returns_error() {
        let resp = OpenStreamResponse::timeout();
        assert!(matches!(
            resp.into_stream(),
            Err(TorError::StreamTimeout)
        ));
    }
}
