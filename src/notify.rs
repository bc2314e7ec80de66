//! Outbound alarm notifications.
//!
//! Delivery (mail, SMS, paging) lives outside this crate; the supervisor only
//! hands a channel identity, a priority and a cause to a [`Notifier`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use strum_macros::{Display, EnumString};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, channel: &str, priority: Priority, cause: &str);
}

/// Writes notifications to the log. Used when no dispatcher is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, channel: &str, priority: Priority, cause: &str) {
        match priority {
            Priority::Critical | Priority::High => {
                error!(channel, %priority, cause, "alarm notification")
            }
            Priority::Normal => warn!(channel, %priority, cause, "notification"),
            Priority::Low => info!(channel, %priority, cause, "notification"),
        }
    }
}

/// A notification as delivered to a [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub channel: String,
    pub priority: Priority,
    pub cause: String,
}

/// Keeps every notification in memory, for inspection in tests and by the
/// presentation layer.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, channel: &str, priority: Priority, cause: &str) {
        self.sent.lock().push(Notification {
            channel: channel.to_string(),
            priority,
            cause: cause.to_string(),
        });
    }
}
