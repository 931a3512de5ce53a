//! Durable heartbeat state.

use lifeline_mesh::Status;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_INTERVAL_ID;
use crate::{DailyCheckIn, EscalationConfig, HeartbeatEntry};

/// The record persisted after mutations and reloaded at boot.
///
/// Missing fields fall back to defaults so older files still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub current_status: Status,
    pub last_check_in: Option<u64>,
    pub check_in_interval: String,
    /// Newest first.
    pub personal_log: Vec<HeartbeatEntry>,
    pub escalation_config: EscalationConfig,
    pub my_peer_id: Option<String>,
    /// Newest first.
    pub check_in_history: Vec<DailyCheckIn>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            current_status: Status::Green,
            last_check_in: None,
            check_in_interval: DEFAULT_INTERVAL_ID.to_string(),
            personal_log: Vec::new(),
            escalation_config: EscalationConfig::default(),
            my_peer_id: None,
            check_in_history: Vec::new(),
        }
    }
}
