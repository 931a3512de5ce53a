//! Error types for lifeline-mesh.

use thiserror::Error;

/// Result type for peer channel operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Connect, send and decode failures.
///
/// Never fatal to the caller. Cloneable so it can ride inside a
/// [`ChannelEvent::Error`](crate::ChannelEvent::Error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("no route to peer {0}")]
    UnknownPeer(String),

    #[error("peer {0} is not connected")]
    NotConnected(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("peer channel is closed")]
    ChannelClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}
