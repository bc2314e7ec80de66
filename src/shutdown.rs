//! The set of connected modules and the shared "kill all HV" action.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::{
    channel::HvChannel,
    config::{ModuleConfig, PollingConfig, ShutdownConfig, SupervisorConfig},
    error::{Error, Result},
    events::{EventBus, HvEvent},
    module::HvModule,
    notify::{Notifier, Priority},
    poller::PollingWorker,
};

/// Entry point shared by the interlock, the heartbeat and operators.
pub trait EmergencyShutdown: Send + Sync {
    /// Ramp every channel of every connected module to zero. Safe to call again.
    fn kill_all_hv(&self, cause: &str) -> Result<()>;
}

/// Owns every connected module together with its poller.
pub struct Supervisor {
    workers: Mutex<Vec<PollingWorker>>,
    polling: PollingConfig,
    shutdown: ShutdownConfig,
    events: EventBus,
    notifier: Arc<dyn Notifier>,
}

impl Supervisor {
    pub fn new(
        polling: PollingConfig,
        shutdown: ShutdownConfig,
        events: EventBus,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            polling,
            shutdown,
            events,
            notifier,
        }
    }

    /// Build a supervisor and connect every configured module. Modules that
    /// fail to connect are returned alongside; the others are polled.
    pub fn from_config(
        config: &SupervisorConfig,
        events: EventBus,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, Vec<(String, Error)>) {
        let supervisor = Self::new(
            config.polling.clone(),
            config.shutdown.clone(),
            events,
            notifier,
        );
        let failures = supervisor.connect_all(&config.modules);
        (supervisor, failures)
    }

    pub fn connect_all(&self, modules: &[ModuleConfig]) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for config in modules {
            match HvModule::open(
                config,
                &self.polling,
                self.events.clone(),
                self.notifier.clone(),
            ) {
                Ok(module) => self.add_module(Arc::new(module)),
                Err(e) => {
                    warn!(
                        module = %config.name,
                        port = %config.port,
                        error = %e,
                        "module connection failed"
                    );
                    failures.push((config.name.clone(), e));
                }
            }
        }
        failures
    }

    /// Start polling a connected module.
    pub fn add_module(&self, module: Arc<HvModule>) {
        let worker = PollingWorker::spawn(module, self.polling.clone());
        self.workers.lock().push(worker);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn module(&self, name: &str) -> Option<Arc<HvModule>> {
        self.workers
            .lock()
            .iter()
            .find(|w| w.module().name() == name)
            .map(|w| w.module().clone())
    }

    pub fn modules(&self) -> Vec<Arc<HvModule>> {
        self.workers
            .lock()
            .iter()
            .map(|w| w.module().clone())
            .collect()
    }

    /// Read-only copy of every channel, grouped by module.
    pub fn snapshot(&self) -> Vec<(String, Vec<HvChannel>)> {
        self.modules()
            .iter()
            .map(|m| (m.name().to_string(), m.snapshot()))
            .collect()
    }

    /// Stop polling a module and drop it.
    pub fn disconnect(&self, name: &str) -> Result<()> {
        let mut workers = self.workers.lock();
        let position = workers
            .iter()
            .position(|w| w.module().name() == name)
            .ok_or_else(|| Error::NotConnected(name.to_string()))?;
        let mut worker = workers.remove(position);
        drop(workers);
        let stopped = worker.stop();
        worker.module().disconnect();
        stopped
    }

    /// Run `action` on the worker polling `module`, holding the worker list
    /// only for that call. `None` when the module was removed meanwhile.
    fn with_worker<T>(
        &self,
        module: &Arc<HvModule>,
        action: impl FnOnce(&mut PollingWorker) -> T,
    ) -> Option<T> {
        self.workers
            .lock()
            .iter_mut()
            .find(|w| Arc::ptr_eq(w.module(), module))
            .map(action)
    }
}

impl EmergencyShutdown for Supervisor {
    fn kill_all_hv(&self, cause: &str) -> Result<()> {
        error!(cause, "emergency shutdown of all HV");
        let mut first_error = None;
        for module in self.modules() {
            if !module.is_connected() {
                continue;
            }
            // Quiesce the poller so the ramp commands are not held up.
            if let Some(Err(e)) = self.with_worker(&module, PollingWorker::stop) {
                warn!(module = %module.name(), error = %e, "poller did not go idle");
            }
            match module.ramp_all_to_zero(self.shutdown.max_ramp_rate) {
                Ok(()) => info!(module = %module.name(), "all channels ramping to zero"),
                Err(e) => {
                    error!(module = %module.name(), error = %e, "shutdown incomplete");
                    self.notifier.notify(
                        module.name(),
                        Priority::Critical,
                        &format!("emergency shutdown incomplete: {e}"),
                    );
                    first_error.get_or_insert(e);
                }
            }
            if let Some(Err(e)) = self.with_worker(&module, PollingWorker::restart) {
                warn!(module = %module.name(), error = %e, "poller restart failed");
            }
        }

        self.notifier
            .notify("all", Priority::Critical, &format!("emergency shutdown: {cause}"));
        self.events.publish(HvEvent::EmergencyShutdown {
            cause: cause.to_string(),
            at: Utc::now(),
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
