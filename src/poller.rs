//! Background polling of one module.
//!
//! Every cycle reads voltage and current of each channel; every Nth cycle also
//! reads limits, set-points, ramp rate, trip current, status and auto-start.
//! Stopping is cooperative: the worker checks for a stop request before every
//! read, and [`PollingWorker::stop`] returns only once the line is idle, so the
//! caller may issue exclusive commands right after.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use tracing::{debug, info, warn};

use crate::{
    config::PollingConfig,
    error::{Error, Result},
    module::{CycleOutcome, HvModule},
};

pub struct PollingWorker {
    module: Arc<HvModule>,
    config: PollingConfig,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PollingWorker {
    pub fn spawn(module: Arc<HvModule>, config: PollingConfig) -> Self {
        let mut worker = Self {
            module,
            config,
            stop_tx: None,
            thread: None,
        };
        worker.start();
        worker
    }

    fn start(&mut self) {
        let (stop_tx, stop_rx) = bounded(1);
        let module = self.module.clone();
        let config = self.config.clone();
        let name = format!("poll-{}", module.name());
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || run(&module, &config, &stop_rx));
        match spawned {
            Ok(handle) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
                info!(module = %self.module.name(), "polling started");
            }
            Err(e) => warn!(module = %self.module.name(), error = %e, "could not start poller"),
        }
    }

    pub fn module(&self) -> &Arc<HvModule> {
        &self.module
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the worker to stop, join it, then wait for the line to go idle.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(module = %self.module.name(), "poller panicked");
            }
            info!(module = %self.module.name(), "polling stopped");
        }
        if self.module.wait_idle(self.config.occupancy_wait()) {
            Ok(())
        } else {
            Err(Error::OccupancyTimeout(self.module.name().to_string()))
        }
    }

    /// Start a fresh worker, stopping the current one first.
    pub fn restart(&mut self) -> Result<()> {
        self.stop()?;
        if self.module.is_connected() {
            self.start();
        }
        Ok(())
    }
}

impl Drop for PollingWorker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

fn run(module: &HvModule, config: &PollingConfig, stop_rx: &Receiver<()>) {
    let full_every = u64::from(config.full_refresh_every.max(1));
    let interval = config.interval();
    let mut cycle: u64 = 0;
    loop {
        let full = cycle % full_every == 0;
        match module.poll_cycle(full, &|| stop_requested(stop_rx)) {
            CycleOutcome::Stopped => break,
            // Retry the same kind of cycle once the writer is done.
            CycleOutcome::Skipped => {
                debug!(module = %module.name(), "poll cycle yielded to a command")
            }
            CycleOutcome::Completed => cycle += 1,
        }
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(module = %module.name(), cycles = cycle, "poller exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        codec::CharEchoCodec,
        events::{EventBus, HvEvent},
        module::ModuleOptions,
        notify::LogNotifier,
        sim::SimulatedCharEcho,
    };

    fn module() -> (Arc<HvModule>, crate::sim::SimHandle, EventBus) {
        let device = SimulatedCharEcho::new(2);
        let handle = device.handle();
        let events = EventBus::new();
        let module = HvModule::new(
            "hv",
            "sim",
            Box::new(CharEchoCodec::new(device)),
            ModuleOptions {
                channels: 2,
                ..Default::default()
            },
            events.clone(),
            Arc::new(LogNotifier),
        )
        .unwrap();
        (Arc::new(module), handle, events)
    }

    fn config() -> PollingConfig {
        PollingConfig {
            interval_ms: 5,
            full_refresh_every: 5,
            occupancy_wait_ms: 1000,
        }
    }

    #[test]
    fn worker_publishes_updates_and_stops() {
        let (module, _, events) = module();
        let updates = events.subscribe();
        let mut worker = PollingWorker::spawn(module.clone(), config());
        let first = updates.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, HvEvent::ChannelUpdated(_)));

        worker.stop().unwrap();
        assert!(!worker.is_running());
        assert!(!module.is_occupied());
    }

    #[test]
    fn full_refresh_runs_on_first_cycle() {
        let (module, _, _) = module();
        let mut worker = PollingWorker::spawn(module.clone(), config());
        thread::sleep(Duration::from_millis(100));
        worker.stop().unwrap();
        let channel = module.channel(1).unwrap();
        assert_eq!(channel.voltage_limit(), Some(4000.0));
        assert_eq!(channel.auto_start(), Some(false));
    }

    #[test]
    fn commands_interleave_with_polling() {
        let (module, sim, _) = module();
        let mut worker = PollingWorker::spawn(module.clone(), config());
        for volts in [100.0, 200.0, 300.0] {
            module.set_voltage(0, volts).unwrap();
        }
        worker.stop().unwrap();
        assert_eq!(sim.channel(0).unwrap().set_point, 300.0);
        assert_eq!(sim.garbled(), 0);
    }

    #[test]
    fn restart_spawns_a_new_worker() {
        let (module, _, _) = module();
        let mut worker = PollingWorker::spawn(module, config());
        worker.restart().unwrap();
        assert!(worker.is_running());
        worker.stop().unwrap();
    }
}
