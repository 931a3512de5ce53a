//! Compact per-cell heartbeat payload.

use serde::{Deserialize, Serialize};

use crate::GroupId;

/// Coherence above which the sender is flagged as panicking.
pub const PANIC_ABOVE: f64 = 90.0;

/// Coherence below which the sender is flagged as silent.
pub const SILENT_BELOW: f64 = 10.0;

/// Coarse remaining-capacity signal, 0 (depleted) to 3 (full).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Capacity(u8);

impl Capacity {
    pub const MAX: u8 = 3;
    pub const EMPTY: Self = Self(0);
    pub const FULL: Self = Self(Self::MAX);

    /// `None` when `level` is above [`Capacity::MAX`].
    pub const fn new(level: u8) -> Option<Self> {
        if level <= Self::MAX {
            Some(Self(level))
        } else {
            None
        }
    }

    pub const fn level(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Capacity {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level).ok_or_else(|| format!("capacity {} exceeds {}", level, Self::MAX))
    }
}

impl From<Capacity> for u8 {
    fn from(capacity: Capacity) -> Self {
        capacity.0
    }
}

/// Status flags carried in every cell heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFlags {
    pub capacity: Capacity,
    pub panic_mode: bool,
    pub silent_mode: bool,
}

/// Heartbeat a member sends to the rest of its cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHeartbeat {
    pub sender_id: String,
    pub group_id: GroupId,
    /// Millis since the sender's previous heartbeat for this cell.
    pub timestamp_delta: u64,
    pub status_flags: StatusFlags,
    /// 0-100 coherence score.
    pub coherence: f64,
}

impl GroupHeartbeat {
    /// Build a heartbeat, deriving the panic/silent flags from `coherence`.
    pub fn new(
        sender_id: impl Into<String>,
        group_id: GroupId,
        coherence: f64,
        capacity: Capacity,
        timestamp_delta: u64,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            group_id,
            timestamp_delta,
            status_flags: StatusFlags {
                capacity,
                panic_mode: coherence > PANIC_ABOVE,
                silent_mode: coherence < SILENT_BELOW,
            },
            coherence,
        }
    }
}
