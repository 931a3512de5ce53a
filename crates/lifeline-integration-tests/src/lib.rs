//! Shared fixtures for the scenarios under `tests/`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lifeline_cells::GroupRegistry;
use lifeline_heartbeat::{
    CoordinatorEvents, DispatchError, EscalationPayload, EscalationRequest, HeartbeatConfig,
    HeartbeatCoordinator, Notification, Notifier, WebhookClient,
};
use lifeline_mesh::{EventReceiver, LoopbackHub, MemoryChannel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Notifier that remembers what it was asked to show.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn request_permission(&self) -> bool {
        true
    }

    fn notify(&self, notification: &Notification) {
        lock(&self.sent).push(notification.clone());
    }
}

/// Webhook that fails a fixed number of times, then records deliveries.
#[derive(Clone, Default)]
pub struct ScriptedWebhook {
    failures_left: Arc<AtomicU32>,
    delivered: Arc<Mutex<Vec<(String, EscalationPayload)>>>,
}

impl ScriptedWebhook {
    pub fn failing(times: u32) -> Self {
        let webhook = Self::default();
        webhook.failures_left.store(times, Ordering::SeqCst);
        webhook
    }

    pub fn delivered(&self) -> Vec<(String, EscalationPayload)> {
        lock(&self.delivered).clone()
    }
}

impl WebhookClient for ScriptedWebhook {
    async fn post(&self, url: &str, payload: &EscalationPayload) -> Result<(), DispatchError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DispatchError::Status(503));
        }
        lock(&self.delivered).push((url.to_string(), payload.clone()));
        Ok(())
    }
}

/// A coordinator on a loopback hub plus everything needed to drive it.
pub struct TestNode {
    pub coordinator: HeartbeatCoordinator<MemoryChannel>,
    pub events: CoordinatorEvents,
    pub channel_events: EventReceiver,
    pub notifier: RecordingNotifier,
    /// Cells this node knows about; inbound cell heartbeats are checked against it.
    pub cells: GroupRegistry,
}

impl TestNode {
    /// Join `hub` as `id` and start the countdown.
    pub fn join(hub: &LoopbackHub, id: &str, name: &str) -> Self {
        let (channel, channel_events) = hub.join(id, name);
        let notifier = RecordingNotifier::default();
        let (mut coordinator, events) = HeartbeatCoordinator::new(
            HeartbeatConfig::default().with_user_name(name),
            channel,
            Box::new(notifier.clone()),
        );
        coordinator.start();
        Self {
            coordinator,
            events,
            channel_events,
            notifier,
            cells: GroupRegistry::new(),
        }
    }

    /// Feed every queued channel and timer event to the coordinator.
    pub fn pump(&mut self) {
        while let Ok(event) = self.channel_events.try_recv() {
            self.coordinator.on_channel_event(event, &self.cells);
        }
        while let Ok(event) = self.events.timer.try_recv() {
            self.coordinator.on_timer_event(event);
        }
    }

    pub fn escalations(&mut self) -> Vec<EscalationRequest> {
        let mut out = Vec::new();
        while let Ok(request) = self.events.escalations.try_recv() {
            out.push(request);
        }
        out
    }
}
