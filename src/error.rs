//! Error types shared across the tunnel client.
//!
//! The library seams return precise `TunnelError` variants; the binary
//! glue wraps them in `anyhow` with context.
use std::io;
use thiserror::Error;

/// Main error type of the tunnel client.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Address resolution produced no usable endpoint
    #[error("failed to resolve address: {0}")]
    AddressResolve(String),

    /// Configuration error (bad value, unsupported version, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Reliable-transport (KCP) layer error
    #[error("transport error: {0}")]
    Transport(String),

    /// FEC codec construction or reconstruction error
    #[error("fec error: {0}")]
    Fec(String),

    /// Stream multiplexer error
    #[error("mux error: {0}")]
    Mux(String),

    /// The mux session is closed; no new streams can be opened
    #[error("mux session closed")]
    SessionClosed,

    /// Control pipe error
    #[error("control pipe error: {0}")]
    Control(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias used throughout the library.
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn control(msg: impl Into<String>) -> Self {
        Self::Control(msg.into())
    }

    /// Whether this error means the session is gone and a refill is due.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::config("unsupported smux version: 3");
        assert_eq!(
            err.to_string(),
            "configuration error: unsupported smux version: 3"
        );
    }

    #[test]
    fn test_session_closed_check() {
        assert!(TunnelError::SessionClosed.is_session_closed());
        assert!(!TunnelError::config("x").is_session_closed());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: TunnelError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }
}
