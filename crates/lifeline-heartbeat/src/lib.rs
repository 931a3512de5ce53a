//! Lifeline Heartbeat
//!
//! The per-user side of Lifeline: status and check-ins, the dead-man's
//! switch, missed check-in escalation, and daily wellness scoring.
//!
//! # Overview
//!
//! ```text
//! DeadManTimer ──TimerEvent──▶ HeartbeatCoordinator ◀──ChannelEvent── PeerChannel
//!                                    │
//!                                    └──EscalationRequest──▶ EscalationDispatcher ──▶ webhook
//! ```
//!
//! The coordinator owns all state and never blocks: webhook delivery
//! happens on the dispatcher, whose outcome is fed back with
//! [`HeartbeatCoordinator::record_escalation_outcome`].

pub mod config;
pub mod coordinator;
pub mod daily;
pub mod error;
pub mod escalation;
pub mod notify;
pub mod snapshot;
pub mod timer;

pub use config::{
    default_interval, interval_by_id, status_rule, CheckInInterval, EscalationThresholds,
    HeartbeatConfig, StatusRule, CHECK_IN_INTERVALS, DEFAULT_INTERVAL_ID,
};
pub use coordinator::{
    capacity_for, BoundedLog, CoordinatorEvents, EscalationRecord, HeartbeatCoordinator,
    HeartbeatEntry, HeartbeatView, Peer, DEGRADED_NOTE,
};
pub use daily::{
    Answer, Category, DailyCheckIn, DailyHistory, DailyScoreEngine, HistorySummary, Question,
    Response, Score, Trend, DEFAULT_QUESTIONS,
};
pub use error::{ConfigError, DispatchError, Error, Result, ScoreError};
pub use escalation::{
    format_alert, should_escalate, urgency, DispatchOutcome, EscalationConfig,
    EscalationDispatcher, EscalationPayload, EscalationRequest, ReqwestWebhook, RetryPolicy,
    Urgency, WebhookClient,
};
pub use notify::{LogNotifier, Notification, Notifier};
pub use snapshot::Snapshot;
pub use timer::{DeadManTimer, TimerEvent, TimerReceiver};
