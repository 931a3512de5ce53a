//! Missed check-ins end to end: notification, degraded broadcast, then a
//! webhook call through the dispatcher.

use std::time::Duration;

use lifeline_heartbeat::{
    DispatchOutcome, EscalationConfig, EscalationDispatcher, RetryPolicy, DEGRADED_NOTE,
};
use lifeline_integration_tests::{ScriptedWebhook, TestNode};
use lifeline_mesh::{LoopbackHub, Status};

const WINDOW: Duration = Duration::from_secs(15 * 60);
const HOOK: &str = "https://hooks.example.invalid/lifeline";

async fn let_window_lapse(node: &mut TestNode) {
    tokio::time::sleep(node.coordinator.check_in_timer_remaining() + Duration::from_secs(1)).await;
    node.pump();
}

fn escalation_on() -> EscalationConfig {
    EscalationConfig {
        enabled: true,
        webhook_url: Some(HOOK.into()),
        include_location: false,
    }
}

#[tokio::test(start_paused = true)]
async fn full_ladder_reaches_the_webhook() {
    let hub = LoopbackHub::new();
    let mut alice = TestNode::join(&hub, "alice", "Alice");
    let mut bob = TestNode::join(&hub, "bob", "Bob");
    alice.coordinator.add_peer("bob", "Bob");
    alice.coordinator.set_check_in_interval("15min").unwrap();
    alice.coordinator.set_escalation_config(escalation_on());
    alice.coordinator.check_in(Some("leaving for a hike".into()));
    alice.pump();
    bob.pump();

    let webhook = ScriptedWebhook::failing(1);
    let dispatcher = EscalationDispatcher::new(webhook.clone(), RetryPolicy::default());

    // First miss: local reminder only.
    let_window_lapse(&mut alice).await;
    bob.pump();
    assert_eq!(alice.notifier.sent().len(), 1);
    assert_eq!(bob.coordinator.peer("alice").unwrap().status, Status::Green);
    assert!(alice.escalations().is_empty());

    // Second miss: peers see a degraded status.
    let_window_lapse(&mut alice).await;
    bob.pump();
    let seen = bob.coordinator.peer("alice").unwrap();
    assert_eq!(seen.status, Status::Orange);
    assert_eq!(seen.status_history.back().unwrap().note.as_deref(), Some(DEGRADED_NOTE));
    assert!(alice.escalations().is_empty());

    // Third miss: escalation goes out and survives one webhook failure.
    let_window_lapse(&mut alice).await;
    let mut requests = alice.escalations();
    assert_eq!(requests.len(), 1);
    let request = requests.remove(0);

    let outcome = dispatcher.trigger(&request.config, &request.payload).await;
    assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 2 });
    alice.coordinator.record_escalation_outcome(&request.payload, outcome);

    let delivered = webhook.delivered();
    assert_eq!(delivered.len(), 1);
    let (url, payload) = &delivered[0];
    assert_eq!(url, HOOK);
    assert_eq!(payload.user_id, "alice");
    assert_eq!(payload.user_name, "Alice");
    assert_eq!(payload.missed_check_ins, 3);
    assert_eq!(payload.note, "Missed 3 check-ins");
    assert_eq!(payload.last_check_in, alice.coordinator.last_check_in());

    let view = alice.coordinator.view();
    assert_eq!(view.missed_check_ins, 3);
    assert!(view.last_escalation.unwrap().outcome.is_delivered());
}

#[tokio::test(start_paused = true)]
async fn disabled_escalation_is_skipped_not_sent() {
    let hub = LoopbackHub::new();
    let mut alice = TestNode::join(&hub, "alice", "Alice");
    alice.coordinator.set_check_in_interval("15min").unwrap();

    for _ in 0..3 {
        let_window_lapse(&mut alice).await;
    }
    let request = alice.escalations().pop().expect("third miss escalates");
    assert!(!request.config.enabled);

    let webhook = ScriptedWebhook::default();
    let dispatcher = EscalationDispatcher::new(webhook.clone(), RetryPolicy::default());
    assert_eq!(
        dispatcher.trigger(&request.config, &request.payload).await,
        DispatchOutcome::Skipped
    );
    assert!(webhook.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn webhook_outage_is_recorded_as_failure() {
    let hub = LoopbackHub::new();
    let mut alice = TestNode::join(&hub, "alice", "Alice");
    alice.coordinator.set_check_in_interval("15min").unwrap();
    alice.coordinator.set_escalation_config(escalation_on());
    alice.coordinator.set_status(Status::Red, Some("need help".into()));

    // Even at red the webhook waits for the third miss.
    let_window_lapse(&mut alice).await;
    assert!(alice.escalations().is_empty());
    let_window_lapse(&mut alice).await;
    assert!(alice.escalations().is_empty());
    let_window_lapse(&mut alice).await;
    let request = alice.escalations().pop().expect("third miss escalates");
    assert_eq!(request.payload.status, Status::Red);

    let dispatcher = EscalationDispatcher::new(ScriptedWebhook::failing(10), RetryPolicy::default());
    let outcome = dispatcher.trigger(&request.config, &request.payload).await;
    assert!(matches!(outcome, DispatchOutcome::Failed { attempts: 3, .. }));

    alice.coordinator.record_escalation_outcome(&request.payload, outcome);
    let record = alice.coordinator.last_escalation().unwrap();
    assert_eq!(record.missed_check_ins, 3);
    assert!(!record.outcome.is_delivered());
    assert!(record.alert.as_deref().is_some_and(|text| text.contains("SOS")));

    // The countdown keeps going after a failed escalation.
    assert!(alice.coordinator.is_dead_man_active());
    let remaining = alice.coordinator.check_in_timer_remaining();
    assert!(remaining <= WINDOW && remaining > WINDOW - Duration::from_secs(5));
}
