//! Interlock on an external safety parameter, e.g. the cryostat fill level.
//!
//! Missing or stale data counts as unsafe. The first unsafe evaluation while
//! armed kills all HV and disarms the monitor; re-arming takes a restart.

use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    config::InterlockConfig,
    error::Result,
    events::{EventBus, HvEvent},
    notify::{Notifier, Priority},
    shutdown::EmergencyShutdown,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Read side of the telemetry store.
pub trait TelemetrySource: Send + Sync {
    /// Most recent sample of `parameter` no older than `window`.
    fn latest(&self, parameter: &str, window: Duration) -> Result<Option<Sample>>;
}

/// Latest-value store kept in memory. Feed it from whatever reads the sensor.
#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetry {
    samples: Arc<RwLock<HashMap<String, Sample>>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, parameter: &str, value: f64) {
        self.record_at(parameter, value, Utc::now());
    }

    pub fn record_at(&self, parameter: &str, value: f64, timestamp: DateTime<Utc>) {
        self.samples
            .write()
            .insert(parameter.to_string(), Sample { timestamp, value });
    }
}

impl TelemetrySource for MemoryTelemetry {
    fn latest(&self, parameter: &str, window: Duration) -> Result<Option<Sample>> {
        // A window too large to represent accepts any sample.
        let oldest = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));
        Ok(self
            .samples
            .read()
            .get(parameter)
            .filter(|sample| oldest.is_none_or(|oldest| sample.timestamp >= oldest))
            .copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterlockState {
    /// True when safe.
    pub lock_state: bool,
    pub last_value: Option<f64>,
    pub armed: bool,
    pub last_evaluated: Option<DateTime<Utc>>,
}

pub struct InterlockMonitor {
    config: InterlockConfig,
    source: Arc<dyn TelemetrySource>,
    shutdown: Arc<dyn EmergencyShutdown>,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    state: Mutex<InterlockState>,
}

impl InterlockMonitor {
    pub fn new(
        config: InterlockConfig,
        source: Arc<dyn TelemetrySource>,
        shutdown: Arc<dyn EmergencyShutdown>,
        notifier: Arc<dyn Notifier>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            source,
            shutdown,
            notifier,
            events,
            state: Mutex::new(InterlockState {
                lock_state: false,
                last_value: None,
                armed: true,
                last_evaluated: None,
            }),
        }
    }

    pub fn state(&self) -> InterlockState {
        self.state.lock().clone()
    }

    /// One evaluation. Returns the lock state, true when safe.
    pub fn evaluate(&self) -> bool {
        let sample = match self
            .source
            .latest(&self.config.parameter, self.config.max_staleness())
        {
            Ok(sample) => sample,
            Err(e) => {
                warn!(parameter = %self.config.parameter, error = %e, "telemetry read failed");
                None
            }
        };
        // NaN compares false, so it is unsafe too.
        let safe = sample.is_some_and(|s| s.value >= self.config.threshold);
        let value = sample.map(|s| s.value);

        let (changed, fire) = {
            let mut state = self.state.lock();
            let changed = state.lock_state != safe || state.last_evaluated.is_none();
            state.lock_state = safe;
            state.last_value = value;
            state.last_evaluated = Some(Utc::now());
            let fire = !safe && state.armed;
            if fire {
                state.armed = false;
            }
            (changed, fire)
        };

        if changed {
            if safe {
                info!(parameter = %self.config.parameter, ?value, "interlock safe");
            } else {
                error!(
                    parameter = %self.config.parameter,
                    ?value,
                    threshold = self.config.threshold,
                    "interlock unsafe"
                );
            }
            self.events.publish(HvEvent::InterlockChanged { safe, value });
        }
        if fire {
            let cause = match value {
                Some(v) => format!(
                    "interlock: {} = {v} below {}",
                    self.config.parameter, self.config.threshold
                ),
                None => format!("interlock: no recent {} data", self.config.parameter),
            };
            self.notifier
                .notify(&self.config.parameter, Priority::Critical, &cause);
            if let Err(e) = self.shutdown.kill_all_hv(&cause) {
                error!(error = %e, "interlock shutdown incomplete");
            }
        }
        safe
    }

    /// Evaluate every configured interval on a background thread.
    pub fn spawn(self: Arc<Self>) -> InterlockHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = self.config.interval();
        let monitor = self.clone();
        let thread = thread::spawn(move || {
            loop {
                monitor.evaluate();
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        InterlockHandle {
            monitor: self,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }
}

pub struct InterlockHandle {
    monitor: Arc<InterlockMonitor>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InterlockHandle {
    pub fn state(&self) -> InterlockState {
        self.monitor.state()
    }

    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for InterlockHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
