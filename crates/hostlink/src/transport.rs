//! # Transport Abstraction
//!
//! Moves whole frames between the client and the host.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: a transport sends and receives complete payloads. It
//!   knows nothing about messages, ids, or values.
//! - **Blocking**: the reader loop is a plain OS thread and blocking callers
//!   may run outside any runtime, so both directions are synchronous.
//!
//! ## Invariants
//! - `send` is atomic with respect to concurrent senders; frames never interleave.
//! - `recv` returns `Ok(None)` once the peer has closed the stream.

use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::net::Shutdown;
use std::net::TcpStream;
use std::sync::Mutex;

use hostwire::frame;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;

/// A bidirectional, frame-preserving byte channel.
///
/// Object-safe so the bridge can hold `Arc<dyn Transport>`.
pub trait Transport: Send + Sync + 'static {
    /// Writes one frame and flushes it.
    fn send(&self, payload: &[u8]) -> Result<()>;

    /// Blocks until the next frame arrives.
    fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Tears the channel down, waking a blocked `recv` where possible.
    fn close(&self) {}
}

/// Length-prefixed frames over a TCP stream.
pub struct TcpTransport {
    writer: Mutex<BufWriter<TcpStream>>,
    reader: Mutex<BufReader<TcpStream>>,
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .map_err(|e| Error::Transport(format!("connect to {address}: {e}")))?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let writer = BufWriter::new(stream.try_clone()?);
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            stream,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        frame::write_frame(&mut *writer, payload)?;
        writer.flush()?;
        Ok(())
    }

    fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        Ok(frame::read_frame(&mut *reader)?)
    }

    fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown of closed stream: {e}");
        }
    }
}
