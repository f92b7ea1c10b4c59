//! Error types for the CAN gateway.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error type.
///
/// Protocol desynchronization and short reads are recovered inside the
/// decoder and never show up here. Transport failures are logged and drive
/// reconnection; only `open()`/`close()` and configuration loading surface
/// errors to callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection could not be established or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The operation requires an established connection.
    #[error("Not connected")]
    NotConnected,

    /// Protocol-level error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data could not be interpreted.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Operation timed out.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was closed before the operation completed.
    #[error("Connection closed")]
    Closed,

    /// Operation is not supported.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create an invalid data error.
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this is an ordinary network failure (refused, unreachable,
    /// address in use, timed out) rather than a setup or programming fault.
    ///
    /// Ordinary failures are logged at warn level, everything else at error.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::AddrInUse
                    | ErrorKind::AddrNotAvailable
                    | ErrorKind::HostUnreachable
                    | ErrorKind::NetworkUnreachable
                    | ErrorKind::NetworkDown
                    | ErrorKind::TimedOut
                    | ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl Clone for GatewayError {
    fn clone(&self) -> Self {
        match self {
            Self::Connection(s) => Self::Connection(s.clone()),
            Self::NotConnected => Self::NotConnected,
            Self::Protocol(s) => Self::Protocol(s.clone()),
            Self::Config(s) => Self::Config(s.clone()),
            Self::InvalidData(s) => Self::InvalidData(s.clone()),
            Self::Timeout(d) => Self::Timeout(*d),
            Self::Closed => Self::Closed,
            Self::Unsupported(s) => Self::Unsupported(s.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Internal(s) => Self::Internal(s.clone()),
        }
    }
}
