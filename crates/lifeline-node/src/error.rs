//! Error types for the Lifeline node.

use lifeline_cells::GroupError;
use lifeline_mesh::TransportError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed environment configuration
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Rejected heartbeat operation
    #[error("Heartbeat error: {0}")]
    Heartbeat(#[from] lifeline_heartbeat::Error),

    /// Cell registry error
    #[error("Cell error: {0}")]
    Group(#[from] GroupError),

    /// Peer channel error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Escalation client could not be built
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] lifeline_heartbeat::DispatchError),

    /// Admin command that makes no sense
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
