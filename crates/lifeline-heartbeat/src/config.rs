//! Heartbeat configuration.

use std::time::Duration;

use lifeline_mesh::Status;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// A selectable check-in window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInInterval {
    pub id: &'static str,
    pub label: &'static str,
    /// 0 disarms the dead-man's switch.
    pub millis: u64,
}

impl CheckInInterval {
    /// `None` for the "off" interval.
    pub fn duration(&self) -> Option<Duration> {
        (self.millis > 0).then(|| Duration::from_millis(self.millis))
    }

    pub fn is_off(&self) -> bool {
        self.millis == 0
    }
}

const MINUTE_MS: u64 = 60 * 1000;

pub const CHECK_IN_INTERVALS: [CheckInInterval; 6] = [
    CheckInInterval { id: "15min", label: "15 minutes", millis: 15 * MINUTE_MS },
    CheckInInterval { id: "30min", label: "30 minutes", millis: 30 * MINUTE_MS },
    CheckInInterval { id: "1hr", label: "1 hour", millis: 60 * MINUTE_MS },
    CheckInInterval { id: "2hr", label: "2 hours", millis: 120 * MINUTE_MS },
    CheckInInterval { id: "4hr", label: "4 hours", millis: 240 * MINUTE_MS },
    CheckInInterval { id: "off", label: "Off", millis: 0 },
];

pub const DEFAULT_INTERVAL_ID: &str = "1hr";

pub fn interval_by_id(id: &str) -> Result<&'static CheckInInterval, ConfigError> {
    CHECK_IN_INTERVALS
        .iter()
        .find(|interval| interval.id == id)
        .ok_or_else(|| ConfigError::UnknownInterval(id.to_string()))
}

pub fn default_interval() -> &'static CheckInInterval {
    &CHECK_IN_INTERVALS[2]
}

/// Missed check-in counts that trigger each response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationThresholds {
    /// Local notification.
    pub first_miss: u32,
    /// Degraded status broadcast to peers.
    pub second_miss: u32,
    /// Webhook escalation, and every miss after it.
    pub third_miss: u32,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            first_miss: 1,
            second_miss: 2,
            third_miss: 3,
        }
    }
}

/// Per-status auto-escalation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRule {
    pub auto_escalate: bool,
    /// Misses after which an auto-escalating status escalates.
    pub escalate_after_missed: u32,
}

pub fn status_rule(status: Status) -> StatusRule {
    match status {
        Status::Green | Status::Yellow => StatusRule {
            auto_escalate: false,
            escalate_after_missed: 0,
        },
        Status::Orange => StatusRule {
            auto_escalate: true,
            escalate_after_missed: 2,
        },
        Status::Red => StatusRule {
            auto_escalate: true,
            escalate_after_missed: 0,
        },
    }
}

/// Coordinator settings. `Default` carries the stock values.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub thresholds: EscalationThresholds,
    /// Name presented to peers and in escalations.
    pub user_name: String,
    pub log_cap: usize,
    pub persisted_log_cap: usize,
    pub peer_history_cap: usize,
    pub daily_history_cap: usize,
    pub persisted_daily_cap: usize,
    pub tick_period: Duration,
    pub group_heartbeat_period: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            thresholds: EscalationThresholds::default(),
            user_name: "User".to_string(),
            log_cap: 1000,
            persisted_log_cap: 100,
            peer_history_cap: 50,
            daily_history_cap: 365,
            persisted_daily_cap: 90,
            tick_period: Duration::from_secs(1),
            group_heartbeat_period: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = name.into();
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: EscalationThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    #[must_use]
    pub fn with_log_caps(mut self, in_memory: usize, persisted: usize) -> Self {
        self.log_cap = in_memory.max(1);
        self.persisted_log_cap = persisted.min(self.log_cap);
        self
    }

    #[must_use]
    pub fn with_group_heartbeat_period(mut self, period: Duration) -> Self {
        self.group_heartbeat_period = period;
        self
    }
}
