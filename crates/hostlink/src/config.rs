//! Connection settings handed to the client process by the host.

use crate::error::Error;
use crate::error::Result;

/// Environment variable carrying the loopback port.
pub const PORT_VAR: &str = "PYJAVABRIDGE_PORT";

/// Environment variable carrying the bearer token.
pub const TOKEN_VAR: &str = "PYJAVABRIDGE_TOKEN";

/// The host only listens on loopback.
pub const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
}

impl BridgeConfig {
    pub fn new(port: u16, token: impl Into<String>) -> Self {
        Self {
            host: LOOPBACK.to_string(),
            port,
            token: token.into(),
        }
    }

    /// Reads the port and token from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`. The port is required and must be non-zero;
    /// a missing token means an empty one.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let raw = lookup(PORT_VAR).ok_or_else(|| Error::Config(format!("{PORT_VAR} is not set")))?;
        let port = raw
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("{PORT_VAR}={raw:?}: {e}")))?;
        if port == 0 {
            return Err(Error::Config(format!("{PORT_VAR} must be non-zero")));
        }

        Ok(Self::new(port, lookup(TOKEN_VAR).unwrap_or_default()))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
