//! # Error Definitions
//!
//! Failures surfaced to callers of the bridge. The type is `Clone` because a
//! single connection loss fans out to every outstanding call.

use std::fmt;

use hostwire::message::ENTITY_GONE;

/// An `error` frame from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    /// Machine-readable code, when the host sent one.
    pub code: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, code: Option<String>) -> Self {
        Self { message: message.into(), code }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The reader loop ended; no reply will ever arrive.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The host rejected the call.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// The call addressed a host object that no longer exists.
    #[error("Entity gone: {0}")]
    EntityGone(RemoteError),

    /// A frame could not be decoded. Fatal to the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Writing to the connection failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Event dispatch needs a tokio runtime and none was running.
    #[error("No tokio runtime available")]
    NoRuntime,
}

impl Error {
    /// Maps a host `error` frame to the matching variant.
    pub fn from_remote(message: Option<String>, code: Option<String>) -> Self {
        let remote = RemoteError::new(message.unwrap_or_else(|| "unknown error".into()), code);
        if remote.code.as_deref() == Some(ENTITY_GONE) {
            Error::EntityGone(remote)
        } else {
            Error::Remote(remote)
        }
    }

    /// True for every failure reported by the host, including stale references.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_) | Error::EntityGone(_))
    }

    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(e) | Error::EntityGone(e) => Some(e),
            _ => None,
        }
    }
}

impl From<hostwire::Error> for Error {
    fn from(e: hostwire::Error) -> Self {
        match e {
            hostwire::Error::Io(io) => Error::Transport(io.to_string()),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
