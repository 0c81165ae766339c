//! # Error Definitions
//!
//! Failures of the wire layer: framing, JSON, and tagged-object decoding.
//! Every one of these is a protocol error from the connection's point of view.

/// Wire-level failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The payload was not a valid JSON document, or a frame did not match its schema.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A `__uuid__` tag carried text that is not a UUID.
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    /// A tagged object was missing a required member or had the wrong shape.
    #[error("Malformed tagged object: {0}")]
    MalformedTag(String),

    /// A frame declared an empty payload.
    #[error("Empty frame")]
    EmptyFrame,

    /// A frame declared a payload larger than `MAX_FRAME_LEN`.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u64),

    /// Reading or writing the underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
