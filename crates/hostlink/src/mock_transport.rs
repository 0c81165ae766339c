//! In-memory transports for tests.
//!
//! Not meant for production use; exposed so integration tests can script a
//! fake host on the other end of the pipe.

use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::error::Result;
use crate::transport::Transport;

/// One end of a duplex frame pipe built on tokio mpsc channels.
///
/// Frames sent on one end appear on the peer's `recv` and vice versa. Closing
/// or dropping an end makes both its own `recv` and the peer's report
/// end-of-stream.
///
/// ## Invariants
///
/// - **Hang-up Marker:** a `None` packet ends the stream. Closing posts one to
///   the peer and one to this end's own queue, so a reader blocked here wakes.
/// - **FIFO:** frames sent before a hang-up are delivered before it.
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    wake: mpsc::UnboundedSender<Packet>,
    rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: AtomicBool,
}

type Packet = Option<Vec<u8>>;

impl MemoryTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self::new(tx_a.clone(), tx_b.clone(), rx_b),
            Self::new(tx_b, tx_a, rx_a),
        )
    }

    fn new(
        tx: mpsc::UnboundedSender<Packet>,
        wake: mpsc::UnboundedSender<Packet>,
        rx: mpsc::UnboundedReceiver<Packet>,
    ) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            wake,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, payload: &[u8]) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => tx
                .send(Some(payload.to_vec()))
                .map_err(|_| Error::Transport("peer hung up".into())),
            None => Err(Error::Transport("transport closed".into())),
        }
    }

    /// Must be called from a plain thread, never from inside a runtime.
    fn recv(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        match rx.blocking_recv() {
            Some(Some(frame)) => Ok(Some(frame)),
            _ => {
                self.closed.store(true, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    /// Hangs up both directions and wakes a reader blocked on this end.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(None);
        }
        let _ = self.wake.send(None);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
