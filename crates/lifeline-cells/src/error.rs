//! Error types for lifeline-cells.

use thiserror::Error;

use crate::GroupId;

/// Result type for trust cell operations.
pub type Result<T> = std::result::Result<T, GroupError>;

/// Errors that can occur while registering or querying cells.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    /// Membership is malformed: wrong size, a repeated id, or an empty id.
    #[error("invalid cell membership: {0}")]
    Validation(String),

    /// A cell with the same canonical membership already exists.
    #[error("cell {0} is already registered")]
    Duplicate(GroupId),

    /// No cell is registered under this id.
    #[error("unknown cell {0}")]
    UnknownGroup(GroupId),

    /// The peer is not one of the cell's four members.
    #[error("peer {peer_id} is not a member of cell {group_id}")]
    NotMember { peer_id: String, group_id: GroupId },
}
