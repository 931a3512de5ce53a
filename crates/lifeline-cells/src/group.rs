//! Cell identity and membership.

use serde::{Deserialize, Serialize};

use crate::{GroupError, Result, CELL_SIZE};

/// Canonical cell identifier: hex-encoded BLAKE3 of the sorted membership.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Compute the id of an already-sorted membership.
    ///
    /// Each member is framed as `len (u64 LE) || bytes`, so an id that
    /// contains a separator character can never alias another membership.
    pub fn from_sorted(members: &[String; CELL_SIZE]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"lifeline/k4/v1");
        for member in members {
            hasher.update(&(member.len() as u64).to_le_bytes());
            hasher.update(member.as_bytes());
        }
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    /// Wrap an id received from elsewhere (wire, admin socket).
    pub fn from_hex(hex_id: impl Into<String>) -> Self {
        Self(hex_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate and sort a proposed membership.
///
/// Fails with [`GroupError::Validation`] unless there are exactly four
/// non-empty, distinct ids.
pub fn canonicalize<S: AsRef<str>>(members: &[S]) -> Result<[String; CELL_SIZE]> {
    if members.len() != CELL_SIZE {
        return Err(GroupError::Validation(format!(
            "a cell needs exactly {} members, got {}",
            CELL_SIZE,
            members.len()
        )));
    }

    let mut sorted: Vec<String> = members.iter().map(|m| m.as_ref().to_string()).collect();
    if sorted.iter().any(String::is_empty) {
        return Err(GroupError::Validation("member ids must not be empty".into()));
    }

    sorted.sort();
    if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(GroupError::Validation(format!(
            "member {} appears more than once",
            pair[0]
        )));
    }

    sorted
        .try_into()
        .map_err(|_| GroupError::Validation("membership size changed during sort".into()))
}

/// A registered four-member trust cell.
///
/// Membership never changes after registration; only `active` toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustGroup {
    pub id: GroupId,
    /// Sorted member ids.
    pub members: [String; CELL_SIZE],
    /// Registration time (unix millis).
    pub created_at: u64,
    pub active: bool,
}

impl TrustGroup {
    pub fn contains(&self, peer_id: &str) -> bool {
        self.members.iter().any(|m| m == peer_id)
    }

    /// The three other members, from `peer_id`'s point of view.
    pub fn others(&self, peer_id: &str) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| m.as_str() != peer_id)
            .map(String::as_str)
            .collect()
    }
}
