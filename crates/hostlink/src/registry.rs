//! # Request Registry
//!
//! Correlates outgoing call ids with their eventual `return` or `error` frame.
//!
//! Two kinds of waiter share one id space:
//! - **Async**: a oneshot sender resolved from the reader thread; the caller
//!   awaits the [`CallFuture`] on the runtime.
//! - **Blocking**: a mutex/condvar slot the calling thread parks on.
//!
//! ## Invariants
//! - Ids are allocated monotonically from 1 and never reused.
//! - An id maps to at most one waiter, and that waiter is resolved exactly once:
//!   whoever removes it from the table (a reply, a send failure, or close) owns it.
//! - After [`Registry::close`], every waiter registered before or after fails
//!   with `ConnectionLost`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use dashmap::DashMap;
use hostwire::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;

// ============================================================================
//  WAITERS
// ============================================================================

/// Parking spot for a thread inside a blocking call.
#[derive(Default)]
pub(crate) struct Slot {
    result: Mutex<Option<Result<Value>>>,
    ready: Condvar,
}

impl Slot {
    fn fill(&self, result: Result<Value>) {
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(result);
        self.ready.notify_all();
    }

    /// Parks the current thread until the slot is filled.
    pub(crate) fn wait(&self) -> Result<Value> {
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.ready.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }
}

pub(crate) enum Waiter {
    Async {
        tx: oneshot::Sender<Result<Value>>,
        /// Second copy of the result for a batch flush awaiting this call.
        batch: Option<oneshot::Sender<Result<Value>>>,
    },
    Blocking(Arc<Slot>),
}

impl Waiter {
    fn resolve(self, result: Result<Value>) {
        match self {
            Waiter::Async { tx, batch } => {
                if let Some(batch) = batch {
                    let _ = batch.send(result.clone());
                }
                // the caller may have dropped its future
                let _ = tx.send(result);
            }
            Waiter::Blocking(slot) => slot.fill(result),
        }
    }
}

// ============================================================================
//  REGISTRY
// ============================================================================

pub(crate) struct Registry {
    next_id: AtomicU64,
    waiters: DashMap<u64, Waiter>,
    closed: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: DashMap::new(),
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an async waiter and returns the future the caller awaits.
    pub(crate) fn register_async(&self, id: u64) -> CallFuture {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Waiter::Async { tx, batch: None });
        CallFuture { rx }
    }

    /// Registers an async waiter whose result is also delivered to a batch flush.
    pub(crate) fn register_batched(&self, id: u64) -> (CallFuture, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        let (batch_tx, batch_rx) = oneshot::channel();
        self.insert(id, Waiter::Async { tx, batch: Some(batch_tx) });
        (CallFuture { rx }, batch_rx)
    }

    pub(crate) fn register_blocking(&self, id: u64) -> Arc<Slot> {
        let slot = Arc::new(Slot::default());
        self.insert(id, Waiter::Blocking(slot.clone()));
        slot
    }

    fn insert(&self, id: u64, waiter: Waiter) {
        self.waiters.insert(id, waiter);
        // a close that raced with this insert may have missed the entry
        if self.closed.load(Ordering::SeqCst) {
            self.fail(id, self.lost());
        }
    }

    /// Delivers a terminal result. Returns `false` for unknown or retired ids.
    pub(crate) fn complete(&self, id: u64, result: Result<Value>) -> bool {
        match self.waiters.remove(&id) {
            Some((_, waiter)) => {
                waiter.resolve(result);
                true
            }
            None => {
                debug!(id, "reply for unknown call id");
                false
            }
        }
    }

    /// Fails a single waiter, typically after its frame could not be written.
    pub(crate) fn fail(&self, id: u64, error: Error) {
        self.complete(id, Err(error));
    }

    /// Fails every outstanding waiter with `ConnectionLost`. Idempotent; the
    /// first reason sticks.
    pub(crate) fn close(&self, reason: &str) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert_with(|| reason.to_string());
        }
        self.closed.store(true, Ordering::SeqCst);

        let error = self.lost();
        let ids: Vec<u64> = self.waiters.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                waiter.resolve(Err(error.clone()));
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The error handed to waiters once the connection is gone.
    pub(crate) fn lost(&self) -> Error {
        let reason = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        Error::ConnectionLost(reason.clone().unwrap_or_else(|| "connection closed".into()))
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.waiters.len()
    }
}

// ============================================================================
//  CALL FUTURE
// ============================================================================

/// The eventual result of an async call.
///
/// The call is already registered (and sent, unless buffered by a batch scope)
/// when this is created; awaiting it only waits for the reply.
#[must_use = "the reply is lost unless the future is awaited"]
pub struct CallFuture {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for CallFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(Error::ConnectionLost("reply channel dropped".into()))))
    }
}
