//! # Length-Prefixed Framing
//!
//! A frame is a 4-byte big-endian payload length followed by exactly that many
//! bytes. Readers loop on short reads; writers emit header and body with one
//! `write_all` so a buffered stream sends the frame in one piece.
//!
//! ## Invariants
//! - End-of-stream at any point of a frame is reported as `Ok(None)`, a clean close.
//! - A declared length of zero or above [`MAX_FRAME_LEN`] is an error; nothing
//!   is allocated for it.

use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use crate::error::Error;
use crate::error::Result;

/// Upper bound on a single payload.
pub const MAX_FRAME_LEN: u32 = 1 << 30;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Prepends the length prefix to `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = checked_len(payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Validates a payload length for the header.
pub fn checked_len(len: usize) -> Result<u32> {
    if len == 0 {
        return Err(Error::EmptyFrame);
    }
    u32::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(Error::FrameTooLarge(len as u64))
}

/// Writes one frame. The caller flushes.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame)?;
    Ok(())
}

/// Reads one frame, or `None` when the stream ended.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    if !read_full(reader, &mut header)? {
        return Ok(None);
    }

    let len = u32::from_be_bytes(header);
    if len == 0 {
        return Err(Error::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len.into()));
    }

    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Fills `buf` completely. Returns `false` on end-of-stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
