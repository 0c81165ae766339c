//! # Batch Manager
//!
//! While a batch scope is open, calls are appended to a buffer instead of being
//! written. Flushing sends every buffered call as a single `call_batch` frame
//! and waits for all of their replies.
//!
//! ## Invariants
//! - Buffered calls keep their argument values (and so their handle leases)
//!   alive until the frame is written.
//! - The effective mode is `atomic` if any open scope is atomic, else `frame`.

use std::sync::Mutex;

use hostwire::CallMessage;
use hostwire::Value;
use tokio::sync::oneshot;

use crate::bridge::Bridge;
use crate::error::Result;
use crate::proxy::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Calls travel together but succeed or fail independently.
    Frame,
    /// The host stops at the first failure. Earlier effects are not rolled back.
    Atomic,
}

impl BatchMode {
    /// Combines the modes of nested scopes.
    pub fn effective(modes: &[BatchMode]) -> Option<BatchMode> {
        if modes.is_empty() {
            None
        } else if modes.contains(&BatchMode::Atomic) {
            Some(BatchMode::Atomic)
        } else {
            Some(BatchMode::Frame)
        }
    }
}

/// A buffered call and the values it refers to.
struct Buffered {
    message: CallMessage,
    keep: (Selector, Vec<Value>),
}

/// Everything a flush needs: the frame body and the replies to wait for.
pub(crate) struct Drained {
    pub atomic: bool,
    pub messages: Vec<CallMessage>,
    pub replies: Vec<oneshot::Receiver<Result<Value>>>,
    /// Dropped after the frame is written.
    pub retained: Vec<(Selector, Vec<Value>)>,
}

#[derive(Default)]
struct State {
    stack: Vec<BatchMode>,
    buffered: Vec<Buffered>,
    replies: Vec<oneshot::Receiver<Result<Value>>>,
}

#[derive(Default)]
pub(crate) struct Batcher {
    state: Mutex<State>,
}

impl Batcher {
    pub(crate) fn push_scope(&self, mode: BatchMode) {
        self.lock().stack.push(mode);
    }

    pub(crate) fn pop_scope(&self) {
        self.lock().stack.pop();
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.lock().stack.is_empty()
    }

    pub(crate) fn mode(&self) -> Option<BatchMode> {
        BatchMode::effective(&self.lock().stack)
    }

    /// Buffers a call when a scope is open. Hands the message and its arguments
    /// back otherwise, so the caller keeps them alive until it sends.
    pub(crate) fn try_buffer(
        &self,
        message: CallMessage,
        selector: &Selector,
        args: Vec<Value>,
        reply: oneshot::Receiver<Result<Value>>,
    ) -> std::result::Result<(), (CallMessage, Vec<Value>)> {
        let mut state = self.lock();
        if state.stack.is_empty() {
            return Err((message, args));
        }
        state.replies.push(reply);
        state.buffered.push(Buffered {
            message,
            keep: (selector.clone(), args),
        });
        Ok(())
    }

    /// Takes the buffer, tagging it with the mode of the open scopes.
    ///
    /// With `closing_scope` set, the innermost scope is popped in the same
    /// critical section, after its mode has been counted.
    pub(crate) fn drain(&self, closing_scope: bool) -> Drained {
        let mut state = self.lock();
        let atomic = BatchMode::effective(&state.stack) == Some(BatchMode::Atomic);
        if closing_scope {
            state.stack.pop();
        }

        let buffered = std::mem::take(&mut state.buffered);
        let replies = std::mem::take(&mut state.replies);
        let mut messages = Vec::with_capacity(buffered.len());
        let mut retained = Vec::with_capacity(buffered.len());
        for entry in buffered {
            messages.push(entry.message);
            retained.push(entry.keep);
        }

        Drained { atomic, messages, replies, retained }
    }

    pub(crate) fn buffered(&self) -> usize {
        self.lock().buffered.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An open batch scope.
///
/// [`BatchScope::finish`] leaves the scope and sends the buffer. Dropping the
/// scope unfinished only leaves it; calls already buffered wait for the next
/// flush.
#[must_use = "buffered calls are not sent until the scope is finished"]
pub struct BatchScope {
    bridge: Bridge,
    open: bool,
}

impl BatchScope {
    pub(crate) fn open(bridge: Bridge, mode: BatchMode) -> Self {
        bridge.batcher().push_scope(mode);
        Self { bridge, open: true }
    }

    /// Leaves the scope, sends one `call_batch` frame, and waits for every reply.
    pub async fn finish(mut self) -> Result<()> {
        self.open = false;
        self.bridge.flush_batch(true).await
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        if self.open {
            self.bridge.batcher().pop_scope();
        }
    }
}
