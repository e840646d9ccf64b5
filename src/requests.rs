//! Pending exit-stream requests
//!
//! Callers of the stream API enqueue an [`ExitRequest`] and wait for it
//! to complete; the scheduler's matcher drains the queue against the
//! circuit registry. A request completes exactly once, after which it
//! is removed from the queue. Dropping the caller's ticket cancels the
//! request and removes it as well.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};

use crate::circuit::stream::OpenStreamResponse;
use crate::error::TorError;
use crate::relay::ExitTarget;

/// One pending exit-stream request.
pub(crate) struct ExitRequest {
    id: u64,
    /// The requested exit target.
    pub target: ExitTarget,
    /// When the request was enqueued.
    pub enqueued_at: Instant,
    reply: Mutex<Option<oneshot::Sender<OpenStreamResponse>>>,
}

impl ExitRequest {
    /// Complete the request. Returns `false` when it was already
    /// completed or the caller has gone away.
    fn complete(&self, response: OpenStreamResponse) -> bool {
        match self.reply.lock().unwrap().take() {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Whether a completion has already been delivered (or taken).
    pub fn is_complete(&self) -> bool {
        self.reply.lock().unwrap().is_none()
    }
}

/// The shared FIFO of pending exit requests.
pub(crate) struct StreamRequestQueue {
    inner: Mutex<Vec<Arc<ExitRequest>>>,
    kick: Notify,
    next_id: AtomicU64,
}

impl StreamRequestQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            kick: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueue a request and hand back the caller's ticket.
    pub fn enqueue(self: &Arc<Self>, target: ExitTarget) -> RequestTicket {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(ExitRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            target,
            enqueued_at: Instant::now(),
            reply: Mutex::new(Some(tx)),
        });
        self.inner.lock().unwrap().push(Arc::clone(&request));
        self.kick.notify_waiters();
        RequestTicket {
            queue: Arc::clone(self),
            request,
            rx,
        }
    }

    /// Complete a request and drop it from the queue.
    ///
    /// Returns whether the caller actually received the response.
    pub fn complete(&self, request: &Arc<ExitRequest>, response: OpenStreamResponse) -> bool {
        let delivered = request.complete(response);
        self.remove(request.id);
        delivered
    }

    fn remove(&self, id: u64) {
        self.inner.lock().unwrap().retain(|r| r.id != id);
    }

    /// Snapshot of the pending requests, in FIFO order.
    pub fn pending(&self) -> Vec<Arc<ExitRequest>> {
        self.inner.lock().unwrap().clone()
    }

    /// Distinct ports across pending requests.
    pub fn pending_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.target.port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Complete every request older than `deadline` with a timeout
    /// response. Returns how many were expired.
    pub fn expire_older_than(&self, deadline: Duration) -> usize {
        let expired: Vec<Arc<ExitRequest>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .iter()
                .filter(|r| r.enqueued_at.elapsed() >= deadline)
                .cloned()
                .collect()
        };
        for request in &expired {
            log::info!("Exit request to {} timed out in queue", request.target);
            self.complete(request, OpenStreamResponse::timeout());
        }
        expired.len()
    }

    /// Complete every pending request with an interruption response.
    pub fn shutdown(&self) {
        let pending: Vec<Arc<ExitRequest>> = self.inner.lock().unwrap().drain(..).collect();
        for request in pending {
            request.complete(OpenStreamResponse::error(TorError::Interrupted));
        }
        self.kick.notify_waiters();
    }

    /// Wake the matcher.
    pub fn kick(&self) {
        self.kick.notify_waiters();
    }

    /// Wait until something enqueues or kicks.
    pub async fn wait_kick(&self) {
        self.kick.notified().await;
    }
}

/// The caller's handle on a pending request.
///
/// Awaiting the ticket yields the response; dropping it without
/// awaiting removes the request from the queue (cancellation).
pub(crate) struct RequestTicket {
    queue: Arc<StreamRequestQueue>,
    request: Arc<ExitRequest>,
    rx: oneshot::Receiver<OpenStreamResponse>,
}

impl RequestTicket {
    /// Wait for the request to complete.
    pub async fn wait(mut self) -> OpenStreamResponse {
        match (&mut self.rx).await {
            Ok(response) => response,
            // The queue vanished under us (manager dropped mid-wait).
            Err(_) => OpenStreamResponse::error(TorError::Interrupted),
        }
    }
}

impl Drop for RequestTicket {
    fn drop(&mut self) {
        // Completed requests were already removed; this only fires for
        // cancellation.
        self.queue.remove(self.request.id);
    }
}
