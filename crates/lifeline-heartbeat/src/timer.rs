//! Dead-man's switch scheduler.
//!
//! One clock source drives both the once-a-second countdown tick and the
//! deadline. Each arming owns a single task; re-arming or disarming aborts
//! it, so two deadlines can never be pending at once. Every event carries
//! the generation it was armed under, and the owner drops events from an
//! older generation that were already queued when the timer was re-armed.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant};

/// Events emitted by a [`DeadManTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Countdown refresh; `remaining` strictly decreases within one generation.
    Tick { generation: u64, remaining: Duration },
    /// The deadline passed without a check-in. Sent once per generation.
    Expired { generation: u64 },
}

impl TimerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            TimerEvent::Tick { generation, .. } | TimerEvent::Expired { generation } => *generation,
        }
    }
}

pub type TimerReceiver = mpsc::UnboundedReceiver<TimerEvent>;

pub struct DeadManTimer {
    events: mpsc::UnboundedSender<TimerEvent>,
    tick_period: Duration,
    generation: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl DeadManTimer {
    pub fn new(tick_period: Duration) -> (Self, TimerReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let timer = Self {
            events,
            tick_period: tick_period.max(Duration::from_millis(1)),
            generation: 0,
            deadline: None,
            task: None,
        };
        (timer, rx)
    }

    /// Cancel any pending deadline and start a new one `interval` from now.
    /// Returns the new generation.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(&mut self, interval: Duration) -> u64 {
        self.disarm();

        let deadline = Instant::now() + interval;
        self.deadline = Some(deadline);
        self.task = Some(tokio::spawn(run(
            self.events.clone(),
            self.generation,
            deadline,
            self.tick_period,
        )));
        self.generation
    }

    /// Cancel the pending deadline, if any. Events already queued become stale.
    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.deadline = None;
        self.generation += 1;
    }

    /// Record that the current generation's deadline fired.
    pub fn mark_expired(&mut self) {
        self.deadline = None;
        self.task = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_current(&self, event: &TimerEvent) -> bool {
        event.generation() == self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time left before expiry; zero when disarmed.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

impl Drop for DeadManTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    events: mpsc::UnboundedSender<TimerEvent>,
    generation: u64,
    deadline: Instant,
    tick_period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + tick_period, tick_period);
    let expiry = sleep_until(deadline);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;

            _ = &mut expiry => {
                let _ = events.send(TimerEvent::Expired { generation });
                return;
            }
            _ = ticker.tick() => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    continue;
                }
                if events.send(TimerEvent::Tick { generation, remaining }).is_err() {
                    return;
                }
            }
        }
    }
}
