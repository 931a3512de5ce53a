//! Local notification seam.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Notifications with the same tag replace each other.
    pub tag: String,
}

impl Notification {
    pub fn missed_check_in() -> Self {
        Self {
            title: "Check-In Reminder".to_string(),
            body: "You missed a check-in. Please confirm you're safe.".to_string(),
            tag: "heartbeat-checkin".to_string(),
        }
    }
}

/// Host notification facility.
pub trait Notifier: Send + Sync {
    /// Ask for permission to notify. Called once at startup.
    fn request_permission(&self) -> bool;

    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log. Always granted.
#[derive(Debug, Default)]
pub struct LogNotifier {
    granted: AtomicBool,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Notifier for LogNotifier {
    fn request_permission(&self) -> bool {
        self.granted.store(true, Ordering::Release);
        true
    }

    fn notify(&self, notification: &Notification) {
        if !self.granted.load(Ordering::Acquire) {
            warn!(tag = %notification.tag, "notification dropped: permission not granted");
            return;
        }
        info!(tag = %notification.tag, title = %notification.title, "{}", notification.body);
    }
}
