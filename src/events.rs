//! Fan-out of supervisor events to whoever is listening, typically a display.
//!
//! The core never calls into presentation code. It publishes [`HvEvent`]s and
//! consumers pull them from their own receiver. A consumer that stops reading
//! loses new events once its backlog is full; publishing never blocks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::channel::{ChannelId, HvChannel, TripKind};

/// Events held for one subscriber before new ones are dropped.
pub const EVENT_BACKLOG: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub enum HvEvent {
    /// Fresh readings for a channel.
    ChannelUpdated(Box<HvChannel>),
    ChannelTripped {
        channel: ChannelId,
        kind: TripKind,
        at: DateTime<Utc>,
    },
    InterlockChanged {
        safe: bool,
        value: Option<f64>,
    },
    EmergencyShutdown {
        cause: String,
        at: DateTime<Utc>,
    },
    HeartbeatChanged {
        established: bool,
    },
    ModuleDisconnected {
        module: String,
    },
}

/// Cloneable publisher; all clones share the same subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<HvEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<HvEvent> {
        let (tx, rx) = bounded(EVENT_BACKLOG);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send to every live subscriber. Dropped receivers are pruned.
    pub fn publish(&self, event: HvEvent) {
        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!("subscriber backlog full, event dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
