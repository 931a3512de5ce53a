//! External escalation: the webhook fired when a user stops checking in.
//!
//! The coordinator decides *when* to escalate and hands an
//! [`EscalationRequest`] to the service loop, which runs the
//! [`EscalationDispatcher`] on its own task. The dispatcher retries with
//! exponential backoff and reports a [`DispatchOutcome`] back to the
//! coordinator; it never fails the caller.

use std::future::Future;
use std::time::Duration;

use lifeline_mesh::Status;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::status_rule;
use crate::DispatchError;

/// Where and whether to escalate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub include_location: bool,
}

impl EscalationConfig {
    /// The webhook to call, if escalation is enabled and one is set.
    pub fn target(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// JSON body of the webhook POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationPayload {
    pub user_id: String,
    pub user_name: String,
    pub status: Status,
    /// Unix millis; `null` if the user never checked in.
    pub last_check_in: Option<u64>,
    pub missed_check_ins: u32,
    pub timestamp: u64,
    pub note: String,
}

/// Work item from the coordinator to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationRequest {
    pub config: EscalationConfig,
    pub payload: EscalationPayload,
}

/// Whether the status alone warrants escalation at this miss count.
///
/// Red qualifies at any miss, orange after its own threshold. Green and
/// yellow never auto-escalate; they only reach the webhook through the
/// third-miss threshold. The coordinator asks only on misses that match
/// neither the notification nor the degraded-broadcast threshold.
pub fn should_escalate(status: Status, missed: u32) -> bool {
    let rule = status_rule(status);
    rule.auto_escalate && missed >= rule.escalate_after_missed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        };
        f.write_str(s)
    }
}

pub fn urgency(status: Status, missed: u32) -> Urgency {
    match (status, missed) {
        (Status::Red, _) => Urgency::Critical,
        (Status::Orange, n) if n >= 2 => Urgency::High,
        (_, n) if n >= 3 => Urgency::High,
        (_, 2) => Urgency::Medium,
        _ => Urgency::Low,
    }
}

fn status_meaning(status: Status) -> (&'static str, &'static str) {
    match status {
        Status::Green => ("Safe", "Safe, grounded"),
        Status::Yellow => ("Caution", "Caution, stressed"),
        Status::Orange => ("Need Support", "Need support"),
        Status::Red => ("SOS", "SOS / Emergency"),
    }
}

/// Plain-text alert for humans (SMS bridges, chat relays, logs).
pub fn format_alert(payload: &EscalationPayload) -> String {
    let (label, meaning) = status_meaning(payload.status);
    let last = payload
        .last_check_in
        .map(format_millis)
        .unwrap_or_else(|| "Never".to_string());

    let mut text = format!(
        "LIFELINE ESCALATION ALERT\n\nUser: {}\nStatus: {} ({})\nLast Check-In: {}\nMissed Check-Ins: {}\nTimestamp: {}\n",
        payload.user_name,
        label,
        meaning,
        last,
        payload.missed_check_ins,
        format_millis(payload.timestamp),
    );
    if !payload.note.is_empty() {
        text.push_str(&format!("Note: {}\n", payload.note));
    }
    text.push_str("\nThis is an automated alert. The user may need support or intervention.");
    text
}

fn format_millis(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Outbound HTTP seam.
pub trait WebhookClient: Send + Sync + 'static {
    fn post(
        &self,
        url: &str,
        payload: &EscalationPayload,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// [`WebhookClient`] backed by reqwest.
#[derive(Clone)]
pub struct ReqwestWebhook {
    client: reqwest::Client,
}

impl ReqwestWebhook {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lifeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DispatchError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl WebhookClient for ReqwestWebhook {
    async fn post(&self, url: &str, payload: &EscalationPayload) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DispatchError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// What happened to one escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Escalation disabled or no webhook configured.
    Skipped,
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: String },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }
}

pub struct EscalationDispatcher<W> {
    client: W,
    policy: RetryPolicy,
}

impl<W: WebhookClient> EscalationDispatcher<W> {
    pub fn new(client: W, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &W {
        &self.client
    }

    pub async fn trigger(
        &self,
        config: &EscalationConfig,
        payload: &EscalationPayload,
    ) -> DispatchOutcome {
        let Some(url) = config.target() else {
            debug!(error = %DispatchError::Disabled, "escalation skipped");
            return DispatchOutcome::Skipped;
        };

        let level = urgency(payload.status, payload.missed_check_ins);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.client.post(url, payload).await {
                Ok(()) => {
                    info!(
                        urgency = %level,
                        missed = payload.missed_check_ins,
                        attempts = attempt,
                        "escalation delivered"
                    );
                    return DispatchOutcome::Delivered { attempts: attempt };
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "escalation webhook failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(urgency = %level, attempts = attempt, error = %e, "escalation failed");
                    return DispatchOutcome::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Fails the first `failures` calls, then succeeds.
    #[derive(Clone, Default)]
    struct FlakyWebhook {
        failures: u32,
        calls: Arc<AtomicU32>,
        bodies: Arc<Mutex<Vec<(String, EscalationPayload)>>>,
    }

    impl WebhookClient for FlakyWebhook {
        async fn post(&self, url: &str, payload: &EscalationPayload) -> Result<(), DispatchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.bodies.lock().unwrap().push((url.to_string(), payload.clone()));
            if n <= self.failures {
                Err(DispatchError::Status(503))
            } else {
                Ok(())
            }
        }
    }

    fn payload(status: Status, missed: u32) -> EscalationPayload {
        EscalationPayload {
            user_id: "ll-1".into(),
            user_name: "Sam".into(),
            status,
            last_check_in: Some(1_700_000_000_000),
            missed_check_ins: missed,
            timestamp: 1_700_000_360_000,
            note: format!("Missed {} check-ins", missed),
        }
    }

    fn enabled() -> EscalationConfig {
        EscalationConfig {
            enabled: true,
            webhook_url: Some("https://example.invalid/hook".into()),
            include_location: false,
        }
    }

    #[test]
    fn predicate_by_status() {
        assert!(should_escalate(Status::Red, 0));
        assert!(should_escalate(Status::Red, 1));
        assert!(!should_escalate(Status::Orange, 1));
        assert!(should_escalate(Status::Orange, 2));
        assert!(!should_escalate(Status::Green, 10));
        assert!(!should_escalate(Status::Yellow, 10));
    }

    #[test]
    fn urgency_levels() {
        assert_eq!(urgency(Status::Red, 0), Urgency::Critical);
        assert_eq!(urgency(Status::Orange, 2), Urgency::High);
        assert_eq!(urgency(Status::Green, 3), Urgency::High);
        assert_eq!(urgency(Status::Yellow, 2), Urgency::Medium);
        assert_eq!(urgency(Status::Green, 1), Urgency::Low);
    }

    #[test]
    fn payload_has_exactly_the_webhook_fields() {
        let json = serde_json::to_value(payload(Status::Green, 3)).unwrap();
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["lastCheckIn", "missedCheckIns", "note", "status", "timestamp", "userId", "userName"]
        );

        let mut never = payload(Status::Green, 3);
        never.last_check_in = None;
        assert!(serde_json::to_value(never).unwrap()["lastCheckIn"].is_null());
    }

    #[test]
    fn target_requires_enabled_and_url() {
        assert_eq!(enabled().target(), Some("https://example.invalid/hook"));
        assert_eq!(EscalationConfig { enabled: false, ..enabled() }.target(), None);
        assert_eq!(EscalationConfig { webhook_url: Some("  ".into()), ..enabled() }.target(), None);
        assert_eq!(EscalationConfig { webhook_url: None, ..enabled() }.target(), None);
    }

    #[test]
    fn alert_text() {
        let mut p = payload(Status::Red, 4);
        let text = format_alert(&p);
        assert!(text.contains("User: Sam"));
        assert!(text.contains("Status: SOS (SOS / Emergency)"));
        assert!(text.contains("Missed Check-Ins: 4"));
        assert!(text.contains("2023-11-14"));

        p.last_check_in = None;
        p.note.clear();
        let text = format_alert(&p);
        assert!(text.contains("Last Check-In: Never"));
        assert!(!text.contains("Note:"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
        assert_eq!(policy.backoff(40), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_config_never_calls_out() {
        let hook = FlakyWebhook::default();
        let dispatcher = EscalationDispatcher::new(hook.clone(), RetryPolicy::default());
        let outcome = dispatcher
            .trigger(&EscalationConfig::default(), &payload(Status::Red, 1))
            .await;
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_delivered() {
        let hook = FlakyWebhook { failures: 2, ..FlakyWebhook::default() };
        let dispatcher = EscalationDispatcher::new(hook.clone(), RetryPolicy::default());

        let started = tokio::time::Instant::now();
        let outcome = dispatcher.trigger(&enabled(), &payload(Status::Green, 3)).await;

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 3 });
        assert_eq!(hook.calls.load(Ordering::SeqCst), 3);
        // 500ms + 1s of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(1500));

        let bodies = hook.bodies.lock().unwrap();
        assert_eq!(bodies[0].0, "https://example.invalid/hook");
        assert_eq!(bodies[0].1.note, "Missed 3 check-ins");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_out_backoff_between_attempts() {
        let hook = FlakyWebhook { failures: 1, ..FlakyWebhook::default() };
        let dispatcher = EscalationDispatcher::new(hook.clone(), RetryPolicy::default());
        let config = enabled();
        let body = payload(Status::Red, 1);
        let mut task = tokio_test::task::spawn(dispatcher.trigger(&config, &body));

        tokio_test::assert_pending!(task.poll());
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(499)).await;
        tokio_test::assert_pending!(task.poll());
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        let outcome = tokio_test::assert_ready!(task.poll());
        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let hook = FlakyWebhook { failures: u32::MAX, ..FlakyWebhook::default() };
        let dispatcher = EscalationDispatcher::new(hook.clone(), RetryPolicy::default());
        let outcome = dispatcher.trigger(&enabled(), &payload(Status::Orange, 3)).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Failed {
                attempts: 3,
                error: "webhook returned status 503".into()
            }
        );
        assert_eq!(hook.calls.load(Ordering::SeqCst), 3);
    }
}
