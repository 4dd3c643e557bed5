//! Error types for the Parley protocol core.
//!
//! Transport failures are expected and recovered by reconnecting; only
//! credential rejection is fatal to the session.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors reported by, or to, the connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Configured endpoint is not a valid URL
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Underlying transport error (refused, reset, send failure)
    #[error("transport error: {0}")]
    Transport(String),

    /// Handshake or pong did not arrive in time
    #[error("timeout after {elapsed:?}")]
    Timeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Server rejected the token
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Peer closed the connection
    #[error("connection closed by peer")]
    Closed,
}

impl ConnectionError {
    /// Returns true if a reconnect may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. } | Self::Closed)
    }

    /// Returns true if the session must not reconnect with the same token.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected(_) | Self::InvalidEndpoint(_))
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout { elapsed: Duration::ZERO },
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionAborted => Self::Closed,
            _ => Self::Transport(err.to_string()),
        }
    }
}
