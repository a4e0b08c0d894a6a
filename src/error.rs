//! Error types for the lease server.
//!
//! Protocol outcomes such as an exhausted pool or a conflicting REQUEST are
//! not errors: the engine reports them as a [`Decision`](crate::Decision).
//! [`Error`] covers the fallible edges around it: configuration, sockets and
//! the wire decoder.

/// Errors raised outside the lease state machine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Datagram rejected at the decode boundary.
    ///
    /// Covers short packets, a wrong magic cookie, relay loops and
    /// truncated or ill-sized options. Such datagrams never reach the engine.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Invalid server configuration, see [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation, option or bind failure.
    ///
    /// Binding port 67 or `SO_BINDTODEVICE` usually needs `CAP_NET_BIND_SERVICE`
    /// and `CAP_NET_RAW`.
    #[error("Socket error: {0}")]
    Socket(String),
}

/// A specialized Result type for lease server operations.
pub type Result<T> = std::result::Result<T, Error>;
