//! Error taxonomy shared across the workspace.
//!
//! Variants follow the failure kinds of the system rather than the crates that
//! produce them: connection setup, configuration, protocol violations, the
//! "transport closed underneath us" family that pumps treat as graceful EOF,
//! resource exhaustion, and operating-system failures.

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure kinds of the VPN core.
#[derive(Debug, Error)]
pub enum Error {
    /// Dial, handshake, or idle-timeout failures on the QUIC tunnel.
    #[error("connection: {0}")]
    Connection(String),
    /// Invalid or missing configuration; fatal at startup.
    #[error("config: {0}")]
    Config(String),
    /// Malformed CONNECT-IP traffic or an unexpected peer response.
    #[error("protocol: {0}")]
    Protocol(String),
    /// The tunnel or TUN device reported EOF/reset; graceful for pumps.
    #[error("transport closed: {0}")]
    TransportClosed(String),
    /// Pool exhaustion or buffer starvation.
    #[error("resource: {0}")]
    Resource(String),
    /// TUN creation or route installation rejected by the OS.
    #[error("system: {0}")]
    System(String),
    /// Underlying I/O failure that fits no finer kind.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }
    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    /// Whether this error means the peer or the OS closed the transport.
    ///
    /// Pumps exit without reporting when this returns true: connection EOF,
    /// resets, and writes on an already-closed socket are ordinary shutdown,
    /// not faults.
    pub fn is_closed_network(&self) -> bool {
        match self {
            Error::TransportClosed(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            Error::Connection(msg) => {
                msg.contains("closed") || msg.contains("reset") || msg.contains("aborted")
            }
            _ => false,
        }
    }
}

// Map TOML deserialization errors into the config error domain without adding
// a new variant.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(e: ipnet::AddrParseError) -> Self {
        Error::Config(e.to_string())
    }
}
