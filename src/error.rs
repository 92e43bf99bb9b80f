//! Error types for the netfence proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving proxy connections.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Malformed SOCKS5 handshake, request, or frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SOCKS5 command byte the proxy does not implement
    #[error("unsupported SOCKS5 command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// Address with an unknown ATYP or one that does not parse
    #[error("unsupported or malformed address")]
    BadAddress,

    /// FWD_UDP frame length outside the accepted range
    #[error("UDP frame length {0} out of range")]
    FrameLength(usize),

    /// `start()` called while the proxy is already running
    #[error("proxy is already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// True for per-connection faults that must never take down the listener.
    pub fn is_connection_fault(&self) -> bool {
        !matches!(self, Error::AlreadyRunning | Error::Config(_))
    }
}
