//! # Handle Release Queue
//!
//! Handles whose last proxy was dropped are queued here and sent to the host
//! as one `release` frame, either right before the next outgoing call or as
//! soon as [`RELEASE_BATCH`] handles have piled up.
//!
//! A handle the host hands out again before the flush is taken back out of the
//! queue.
//!
//! Release is a hint. A failed write is logged and the handles are forgotten;
//! the host expires stale handles on its own.

use std::sync::Arc;
use std::sync::Mutex;

use hostwire::Message;
use hostwire::ReleaseSink;
use tracing::debug;

use crate::transport::Transport;

/// Queue length that triggers an eager flush.
pub const RELEASE_BATCH: usize = 64;

pub(crate) struct ReleaseQueue {
    queue: Mutex<Vec<i64>>,
    transport: Arc<dyn Transport>,
}

impl ReleaseQueue {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            transport,
        }
    }

    /// Sends every queued handle in one frame. No-op when the queue is empty.
    pub(crate) fn flush(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        self.flush_locked(&mut queue);
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    // holding the queue lock across the write keeps release frames in order
    fn flush_locked(&self, queue: &mut Vec<i64>) {
        if queue.is_empty() {
            return;
        }
        let handles = std::mem::take(queue);
        let count = handles.len();
        let sent = Message::Release { handles }
            .to_bytes()
            .map_err(crate::Error::from)
            .and_then(|payload| self.transport.send(&payload));
        match sent {
            Ok(()) => debug!(count, "released handles"),
            Err(e) => debug!(count, "dropping handle release: {e}"),
        }
    }
}

impl ReleaseSink for ReleaseQueue {
    fn release(&self, handle: i64) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(handle);
        if queue.len() >= RELEASE_BATCH {
            self.flush_locked(&mut queue);
        }
    }

    fn reclaim(&self, handle: i64) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.retain(|queued| *queued != handle);
    }
}
