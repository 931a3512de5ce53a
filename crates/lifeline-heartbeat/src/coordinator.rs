//! The check-in state machine.
//!
//! [`HeartbeatCoordinator`] is the single writer for everything a node
//! knows about its user and its peers. The service loop feeds it timer
//! events, channel events and user commands one at a time; readers get
//! clones through [`HeartbeatCoordinator::view`] and
//! [`HeartbeatCoordinator::snapshot`].
//!
//! # Missed check-ins
//!
//! Every expiry increments the missed count and then takes the first
//! matching branch:
//!
//! - at exactly `first_miss`: local notification
//! - at exactly `second_miss`: degraded (orange) status broadcast
//! - otherwise, at `third_miss` and above or when the current status
//!   warrants it: escalation request
//!
//! and re-arms the timer. Only an explicit check-in resets the count.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeZone};
use lifeline_cells::{Capacity, GroupHeartbeat, GroupId, GroupRegistry};
use lifeline_coherence::CoherenceEstimator;
use lifeline_mesh::{
    now_millis, ChannelEvent, ConnectionState, MessageKind, PeerChannel, Status, WireMessage,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{default_interval, interval_by_id, CheckInInterval, HeartbeatConfig};
use crate::daily::{Answer, DailyCheckIn, DailyHistory, DailyScoreEngine, HistorySummary};
use crate::escalation::{
    format_alert, should_escalate, urgency, DispatchOutcome, EscalationConfig, EscalationPayload,
    EscalationRequest,
};
use crate::notify::{Notification, Notifier};
use crate::timer::{DeadManTimer, TimerEvent, TimerReceiver};
use crate::{Result, Snapshot};

/// Note attached to the degraded broadcast at the second miss.
pub const DEGRADED_NOTE: &str = "Missed check-in";

/// How many log entries [`HeartbeatView`] carries.
const VIEW_LOG_LEN: usize = 10;

/// One affirmed status. Never modified once logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatEntry {
    /// Unix millis.
    pub timestamp: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Newest-first log that drops its oldest entries beyond `cap`.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    cap: usize,
}

impl<T: Clone> BoundedLog<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Rebuild from entries already ordered newest first.
    pub fn from_newest_first(entries: impl IntoIterator<Item = T>, cap: usize) -> Self {
        let mut log = Self::new(cap);
        log.entries = entries.into_iter().take(log.cap).collect();
        log
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push_front(entry);
        self.entries.truncate(self.cap);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn newest(&self, limit: usize) -> Vec<T> {
        self.entries.iter().take(limit).cloned().collect()
    }
}

/// A remote node as this node sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub name: String,
    /// Unix millis of the last frame or state change.
    pub last_seen: u64,
    pub status: Status,
    /// Oldest first.
    pub status_history: VecDeque<HeartbeatEntry>,
    pub connection_state: ConnectionState,
}

impl Peer {
    fn new(id: &str, name: &str, connection_state: ConnectionState) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            last_seen: now_millis(),
            status: Status::Green,
            status_history: VecDeque::new(),
            connection_state,
        }
    }

    fn record_status(&mut self, entry: HeartbeatEntry, cap: usize) {
        self.status = entry.status;
        self.last_seen = self.last_seen.max(entry.timestamp);
        self.status_history.push_back(entry);
        while self.status_history.len() > cap {
            self.status_history.pop_front();
        }
    }
}

/// The last escalation and what became of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRecord {
    /// Unix millis the outcome was recorded.
    pub at: u64,
    pub missed_check_ins: u32,
    pub outcome: DispatchOutcome,
    /// Human-readable alert for relaying by hand when the webhook failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
}

/// Receivers the service loop drains into the coordinator.
pub struct CoordinatorEvents {
    pub timer: TimerReceiver,
    pub escalations: mpsc::UnboundedReceiver<EscalationRequest>,
}

/// Read-only copy of coordinator state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatView {
    pub local_peer_id: String,
    pub user_name: String,
    pub current_status: Status,
    pub last_check_in: Option<u64>,
    pub check_in_interval: String,
    pub check_in_timer_remaining_ms: u64,
    pub missed_check_ins: u32,
    pub is_dead_man_active: bool,
    pub peers: Vec<Peer>,
    pub escalation_config: EscalationConfig,
    pub last_escalation: Option<EscalationRecord>,
    pub log_len: usize,
    pub recent_log: Vec<HeartbeatEntry>,
    pub daily_summary: HistorySummary,
    pub latest_daily: Option<DailyCheckIn>,
}

/// Coarse capacity advertised in cell heartbeats.
pub fn capacity_for(status: Status) -> Capacity {
    match status {
        Status::Green => Capacity::FULL,
        Status::Yellow => Capacity::new(2).unwrap_or(Capacity::FULL),
        Status::Orange => Capacity::new(1).unwrap_or(Capacity::EMPTY),
        Status::Red => Capacity::EMPTY,
    }
}

pub struct HeartbeatCoordinator<C> {
    config: HeartbeatConfig,
    channel: C,
    notifier: Box<dyn Notifier>,
    notifications_allowed: bool,
    timer: DeadManTimer,
    escalations: mpsc::UnboundedSender<EscalationRequest>,

    status: Status,
    last_check_in: Option<u64>,
    interval: &'static CheckInInterval,
    missed_check_ins: u32,
    dead_man_active: bool,
    log: BoundedLog<HeartbeatEntry>,
    peers: BTreeMap<String, Peer>,
    cell_heartbeats: BTreeMap<(GroupId, String), GroupHeartbeat>,
    escalation: EscalationConfig,
    last_escalation: Option<EscalationRecord>,
    engine: DailyScoreEngine,
    daily: DailyHistory,
    dirty: bool,
}

impl<C: PeerChannel> HeartbeatCoordinator<C> {
    pub fn new(
        config: HeartbeatConfig,
        channel: C,
        notifier: Box<dyn Notifier>,
    ) -> (Self, CoordinatorEvents) {
        let (timer, timer_rx) = DeadManTimer::new(config.tick_period);
        let (escalations, escalation_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            log: BoundedLog::new(config.log_cap),
            daily: DailyHistory::new(config.daily_history_cap),
            config,
            channel,
            notifier,
            notifications_allowed: false,
            timer,
            escalations,
            status: Status::Green,
            last_check_in: None,
            interval: default_interval(),
            missed_check_ins: 0,
            dead_man_active: false,
            peers: BTreeMap::new(),
            cell_heartbeats: BTreeMap::new(),
            escalation: EscalationConfig::default(),
            last_escalation: None,
            engine: DailyScoreEngine::default(),
            dirty: false,
        };
        let events = CoordinatorEvents {
            timer: timer_rx,
            escalations: escalation_rx,
        };
        (coordinator, events)
    }

    /// Ask for notification permission and arm the timer for the current
    /// interval. Call once, after [`restore`](Self::restore).
    pub fn start(&mut self) {
        self.notifications_allowed = self.notifier.request_permission();
        self.arm_timer();
        info!(
            peer_id = %self.local_id(),
            interval = self.interval.id,
            notifications = self.notifications_allowed,
            "heartbeat started"
        );
    }

    // ----- user actions -----

    /// Record a new status and treat it as a check-in.
    pub fn set_status(&mut self, status: Status, note: Option<String>) {
        self.status = status;
        self.append_entry(note.clone());
        self.reset_and_broadcast(note);
    }

    /// Affirm the current status.
    pub fn check_in(&mut self, note: Option<String>) {
        self.append_entry(note.clone());
        self.reset_and_broadcast(note);
    }

    /// Change the check-in window and re-arm. An unknown id changes nothing.
    pub fn set_check_in_interval(&mut self, id: &str) -> Result<()> {
        self.interval = interval_by_id(id)?;
        self.arm_timer();
        self.dirty = true;
        info!(interval = id, "check-in interval changed");
        Ok(())
    }

    /// Clear the missed count and restart the countdown without logging a
    /// check-in.
    pub fn reset_dead_man(&mut self) {
        self.timer.disarm();
        self.missed_check_ins = 0;
        self.dead_man_active = false;
        self.arm_timer();
        self.dirty = true;
    }

    pub fn set_escalation_config(&mut self, config: EscalationConfig) {
        self.escalation = config;
        self.dirty = true;
    }

    pub fn submit_daily_check_in<Tz: TimeZone>(
        &mut self,
        answers: &[Answer],
        now: &DateTime<Tz>,
    ) -> Result<DailyCheckIn> {
        let record = self.engine.submit(answers, now)?;
        if self.daily.upsert(record.clone()).is_some() {
            debug!(date = %record.date, "replaced today's daily check-in");
        }
        self.dirty = true;
        Ok(record)
    }

    // ----- peers -----

    /// Track `peer_id` and start connecting to it.
    pub fn add_peer(&mut self, peer_id: &str, name: &str) {
        let peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| Peer::new(peer_id, name, ConnectionState::Connecting));
        peer.name = name.to_string();
        if peer.connection_state != ConnectionState::Connected {
            peer.connection_state = ConnectionState::Connecting;
        }

        if let Err(e) = self.channel.connect(peer_id, &self.config.user_name) {
            warn!(peer_id, error = %e, "failed to connect to peer");
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.connection_state = ConnectionState::Error;
            }
        }
    }

    /// Forget `peer_id` and tear down its connection.
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.channel.disconnect(peer_id);
        self.cell_heartbeats.retain(|(_, sender), _| sender != peer_id);
        self.peers.remove(peer_id).is_some()
    }

    /// Apply one channel event. Cell heartbeats are only kept for active
    /// cells in `cells` that have both this node and the sender as members.
    pub fn on_channel_event(&mut self, event: ChannelEvent, cells: &GroupRegistry) {
        match event {
            ChannelEvent::StateChanged { peer_id, state } => {
                debug!(peer_id = %peer_id, %state, "peer connection state");
                let peer = self.peer_entry(&peer_id);
                peer.connection_state = state;
                peer.last_seen = now_millis();
            }
            ChannelEvent::Handshake { peer_id, display_name } => {
                let peer = self.peer_entry(&peer_id);
                peer.name = display_name;
                peer.last_seen = now_millis();
            }
            ChannelEvent::Message(message) => self.on_message(message, cells),
            ChannelEvent::Error { peer_id, error } => {
                warn!(peer_id = ?peer_id, error = %error, "peer channel error");
                if let Some(peer) = peer_id.and_then(|id| self.peers.get_mut(&id)) {
                    peer.connection_state = ConnectionState::Error;
                }
            }
        }
    }

    fn on_message(&mut self, message: WireMessage, cells: &GroupRegistry) {
        let cap = self.config.peer_history_cap;
        match message.kind {
            MessageKind::Status => {
                let Some(status) = message.payload_status() else {
                    warn!(from = %message.from, "status frame without a status");
                    return;
                };
                let name = message.payload_name().map(str::to_string);
                let entry = HeartbeatEntry {
                    timestamp: message.timestamp,
                    status,
                    note: message.payload_note().map(str::to_string),
                };
                let peer = self.peer_entry(&message.from);
                if let Some(name) = name {
                    peer.name = name;
                }
                peer.record_status(entry, cap);
                trace!(peer_id = %message.from, %status, "peer status");
            }
            MessageKind::GroupHeartbeat => {
                let Some(heartbeat) = message.payload.and_then(|p| p.heartbeat) else {
                    warn!(from = %message.from, "group heartbeat frame without a heartbeat");
                    return;
                };
                if heartbeat.sender_id != message.from {
                    warn!(from = %message.from, sender = %heartbeat.sender_id, "dropping relayed cell heartbeat");
                    return;
                }
                self.peer_entry(&message.from).last_seen = now_millis();
                let shared_cell = cells.get(&heartbeat.group_id).is_some_and(|group| {
                    group.active && group.contains(&message.from) && group.contains(self.local_id())
                });
                if !shared_cell {
                    debug!(from = %message.from, cell = heartbeat.group_id.short(), "dropping heartbeat for a cell we do not share");
                    return;
                }
                self.cell_heartbeats
                    .insert((heartbeat.group_id.clone(), message.from), heartbeat);
            }
            MessageKind::Handshake | MessageKind::Ping | MessageKind::Pong => {
                trace!(from = %message.from, kind = %message.kind, "ignoring control frame");
            }
        }
    }

    fn peer_entry(&mut self, peer_id: &str) -> &mut Peer {
        self.peers
            .entry(peer_id.to_string())
            .or_insert_with(|| Peer::new(peer_id, peer_id, ConnectionState::Connecting))
    }

    /// Send this node's heartbeat to the other members of every active cell
    /// it belongs to. Returns how many frames were queued.
    pub fn emit_group_heartbeats(
        &self,
        registry: &mut GroupRegistry,
        estimator: &CoherenceEstimator,
    ) -> Result<usize> {
        let local = self.local_id().to_string();
        let capacity = capacity_for(self.status);
        let mut sent = 0;

        for group in registry.groups_for(&local).into_iter().filter(|g| g.active) {
            let heartbeat = registry.heartbeat_for(&local, &group.id, estimator, capacity)?;
            let message = WireMessage::group_heartbeat(&local, heartbeat);
            for member in group.others(&local) {
                match self.channel.send_to(member, &message) {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        debug!(peer_id = member, cell = group.id.short(), error = %e, "cell member unreachable")
                    }
                }
            }
        }
        Ok(sent)
    }

    // ----- timer -----

    pub fn on_timer_event(&mut self, event: TimerEvent) {
        if !self.timer.is_current(&event) {
            trace!(generation = event.generation(), "stale timer event");
            return;
        }
        match event {
            TimerEvent::Tick { remaining, .. } => {
                trace!(remaining_ms = remaining.as_millis() as u64, "check-in countdown");
            }
            TimerEvent::Expired { .. } => {
                self.timer.mark_expired();
                self.handle_missed_check_in();
            }
        }
    }

    pub fn handle_missed_check_in(&mut self) {
        self.missed_check_ins += 1;
        let missed = self.missed_check_ins;
        let thresholds = self.config.thresholds;
        warn!(missed, status = %self.status, "missed check-in");

        if missed == thresholds.first_miss {
            self.notify(&Notification::missed_check_in());
        } else if missed == thresholds.second_miss {
            self.broadcast(Status::Orange, Some(DEGRADED_NOTE));
        } else if missed >= thresholds.third_miss || should_escalate(self.status, missed) {
            self.request_escalation();
        }

        self.arm_timer();
        self.dirty = true;
    }

    /// Record what the dispatcher did with an escalation request.
    pub fn record_escalation_outcome(&mut self, payload: &EscalationPayload, outcome: DispatchOutcome) {
        let alert = match &outcome {
            DispatchOutcome::Failed { attempts, error } => {
                let alert = format_alert(payload);
                warn!(attempts, error = %error, missed = payload.missed_check_ins, %alert, "escalation not delivered");
                Some(alert)
            }
            other => {
                debug!(outcome = ?other, "escalation outcome");
                None
            }
        };
        self.last_escalation = Some(EscalationRecord {
            at: now_millis(),
            missed_check_ins: payload.missed_check_ins,
            outcome,
            alert,
        });
    }

    // ----- persistence -----

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            current_status: self.status,
            last_check_in: self.last_check_in,
            check_in_interval: self.interval.id.to_string(),
            personal_log: self.log.newest(self.config.persisted_log_cap),
            escalation_config: self.escalation.clone(),
            my_peer_id: Some(self.local_id().to_string()),
            check_in_history: self.daily.newest(self.config.persisted_daily_cap),
        }
    }

    /// Load persisted state. Does not arm the timer.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.status = snapshot.current_status;
        self.last_check_in = snapshot.last_check_in;
        self.interval = interval_by_id(&snapshot.check_in_interval).unwrap_or_else(|e| {
            warn!(error = %e, "stored interval unknown, using default");
            default_interval()
        });
        self.log = BoundedLog::from_newest_first(snapshot.personal_log, self.config.log_cap);
        self.escalation = snapshot.escalation_config;
        self.daily =
            DailyHistory::from_records(snapshot.check_in_history, self.config.daily_history_cap);

        if let Some(stored) = snapshot.my_peer_id {
            if stored != self.local_id() {
                warn!(stored = %stored, current = %self.local_id(), "restored snapshot belongs to another peer id");
            }
        }
        info!(entries = self.log.len(), days = self.daily.len(), "heartbeat state restored");
    }

    /// Whether state changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn export_log(&self) -> Result<String> {
        let entries: Vec<&HeartbeatEntry> = self.log.iter().collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    pub fn export_daily_history(&self) -> Result<String> {
        let records: Vec<&DailyCheckIn> = self.daily.iter().collect();
        Ok(serde_json::to_string_pretty(&records)?)
    }

    // ----- queries -----

    pub fn view(&self) -> HeartbeatView {
        HeartbeatView {
            local_peer_id: self.local_id().to_string(),
            user_name: self.config.user_name.clone(),
            current_status: self.status,
            last_check_in: self.last_check_in,
            check_in_interval: self.interval.id.to_string(),
            check_in_timer_remaining_ms: self.check_in_timer_remaining().as_millis() as u64,
            missed_check_ins: self.missed_check_ins,
            is_dead_man_active: self.dead_man_active,
            peers: self.peers.values().cloned().collect(),
            escalation_config: self.escalation.clone(),
            last_escalation: self.last_escalation.clone(),
            log_len: self.log.len(),
            recent_log: self.log.newest(VIEW_LOG_LEN),
            daily_summary: self.daily.summary(),
            latest_daily: self.daily.latest().cloned(),
        }
    }

    pub fn local_id(&self) -> &str {
        self.channel.local_id()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn last_check_in(&self) -> Option<u64> {
        self.last_check_in
    }

    pub fn interval(&self) -> &'static CheckInInterval {
        self.interval
    }

    pub fn missed_check_ins(&self) -> u32 {
        self.missed_check_ins
    }

    pub fn is_dead_man_active(&self) -> bool {
        self.dead_man_active
    }

    pub fn check_in_timer_remaining(&self) -> Duration {
        self.timer.remaining()
    }

    pub fn log(&self) -> &BoundedLog<HeartbeatEntry> {
        &self.log
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Latest heartbeat from each member of `group_id`.
    /// Stored cell heartbeats across all cells.
    pub fn cell_heartbeat_count(&self) -> usize {
        self.cell_heartbeats.len()
    }

    pub fn cell_heartbeats(&self, group_id: &GroupId) -> Vec<&GroupHeartbeat> {
        self.cell_heartbeats
            .iter()
            .filter(|((id, _), _)| id == group_id)
            .map(|(_, heartbeat)| heartbeat)
            .collect()
    }

    pub fn escalation_config(&self) -> &EscalationConfig {
        &self.escalation
    }

    pub fn last_escalation(&self) -> Option<&EscalationRecord> {
        self.last_escalation.as_ref()
    }

    pub fn daily_history(&self) -> &DailyHistory {
        &self.daily
    }

    // ----- internals -----

    fn append_entry(&mut self, note: Option<String>) {
        self.log.push(HeartbeatEntry {
            timestamp: now_millis(),
            status: self.status,
            note,
        });
    }

    fn reset_and_broadcast(&mut self, note: Option<String>) {
        self.last_check_in = Some(now_millis());
        self.missed_check_ins = 0;
        self.arm_timer();
        self.broadcast(self.status, note.as_deref());
        self.dirty = true;
    }

    fn arm_timer(&mut self) {
        match self.interval.duration() {
            Some(window) => {
                self.timer.arm(window);
                self.dead_man_active = true;
            }
            None => {
                self.timer.disarm();
                self.dead_man_active = false;
            }
        }
    }

    fn broadcast(&self, status: Status, note: Option<&str>) {
        match self.channel.broadcast_status(status, &self.config.user_name, note) {
            Ok(peers) => debug!(%status, peers, "status broadcast"),
            Err(e) => warn!(%status, error = %e, "status broadcast failed"),
        }
    }

    fn notify(&self, notification: &Notification) {
        if self.notifications_allowed {
            self.notifier.notify(notification);
        } else {
            debug!(tag = %notification.tag, "notification suppressed: no permission");
        }
    }

    fn request_escalation(&self) {
        let missed = self.missed_check_ins;
        let payload = EscalationPayload {
            user_id: self.local_id().to_string(),
            user_name: self.config.user_name.clone(),
            status: self.status,
            last_check_in: self.last_check_in,
            missed_check_ins: missed,
            timestamp: now_millis(),
            note: format!("Missed {} check-ins", missed),
        };
        warn!(urgency = %urgency(self.status, missed), missed, "escalating");

        let request = EscalationRequest {
            config: self.escalation.clone(),
            payload,
        };
        if self.escalations.send(request).is_err() {
            warn!("escalation queue closed, request dropped");
        }
    }
}
