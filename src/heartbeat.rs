//! Heartbeat client: proves to the watchdog process that the supervisor is alive.
//!
//! Each beat sends the wall-clock Unix timestamp as text, e.g. `1699999999.123`,
//! and expects the exact same bytes back within the timeout. While the link is
//! down the client retries every `timeout + 1` seconds.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::HeartbeatConfig,
    error::{Error, Result},
    events::{EventBus, HvEvent},
    shutdown::EmergencyShutdown,
};

/// Pause added to the timeout before a retry.
const RETRY_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatState {
    pub connection_established: bool,
    pub last_sent: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

/// Current time in the heartbeat text format.
pub fn timestamp_payload(now: DateTime<Utc>) -> String {
    format!("{}.{:03}", now.timestamp(), now.timestamp_subsec_millis())
}

pub struct HeartbeatClient {
    config: HeartbeatConfig,
    stream: Option<TcpStream>,
    state: Arc<Mutex<HeartbeatState>>,
    events: EventBus,
    shutdown: Option<Arc<dyn EmergencyShutdown>>,
    lost_since: Option<Instant>,
    escalated: bool,
}

impl HeartbeatClient {
    pub fn new(config: HeartbeatConfig, events: EventBus) -> Self {
        Self {
            config,
            stream: None,
            state: Arc::new(Mutex::new(HeartbeatState {
                connection_established: false,
                last_sent: None,
                last_success: None,
            })),
            events,
            shutdown: None,
            lost_since: None,
            escalated: false,
        }
    }

    /// Kill all HV once the link has been down for the configured time.
    pub fn with_shutdown(mut self, shutdown: Arc<dyn EmergencyShutdown>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> HeartbeatState {
        self.state.lock().clone()
    }

    pub fn is_established(&self) -> bool {
        self.state.lock().connection_established
    }

    /// Wait before the next beat: the update interval while healthy, otherwise
    /// the retry delay.
    pub fn next_delay(&self) -> Duration {
        if self.is_established() {
            self.config.update_interval()
        } else {
            self.config.timeout() + RETRY_GRACE
        }
    }

    /// Send the current timestamp and check the echo.
    pub fn beat(&mut self) -> bool {
        self.beat_with_payload(&timestamp_payload(Utc::now()))
    }

    pub fn beat_with_payload(&mut self, payload: &str) -> bool {
        self.state.lock().last_sent = Some(payload.to_string());
        let result = self.exchange(payload);
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "heartbeat failed");
                // Whatever is left in the stream is out of step now.
                self.stream = None;
                false
            }
        };
        self.set_established(ok);
        self.check_loss();
        ok
    }

    fn exchange(&mut self, payload: &str) -> Result<()> {
        if self.stream.is_none() {
            self.stream = Some(self.connect()?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::NotConnected(self.config.address.clone()));
        };
        stream.write_all(payload.as_bytes())?;
        stream.flush()?;
        let mut echo = vec![0u8; payload.len()];
        stream.read_exact(&mut echo)?;
        if echo != payload.as_bytes() {
            return Err(Error::EchoMismatch {
                sent: payload.to_string(),
                received: String::from_utf8_lossy(&echo).into_owned(),
            });
        }
        Ok(())
    }

    fn connect(&self) -> Result<TcpStream> {
        let address: SocketAddr = self
            .config
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::NotConnected(self.config.address.clone()))?;
        let timeout = self.config.timeout();
        let stream = TcpStream::connect_timeout(&address, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn set_established(&mut self, established: bool) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.connection_established != established;
            state.connection_established = established;
            if established {
                state.last_success = Some(Utc::now());
            }
            changed
        };
        if changed {
            if established {
                info!(address = %self.config.address, "heartbeat established");
            } else {
                warn!(address = %self.config.address, "heartbeat lost");
            }
            self.events.publish(HvEvent::HeartbeatChanged { established });
        }
    }

    /// Escalate a prolonged outage to an emergency shutdown, once per outage.
    fn check_loss(&mut self) {
        if self.is_established() {
            self.lost_since = None;
            self.escalated = false;
            return;
        }
        let since = *self.lost_since.get_or_insert_with(Instant::now);
        let (Some(limit), Some(shutdown)) = (self.config.shutdown_after(), &self.shutdown) else {
            return;
        };
        if !self.escalated && since.elapsed() >= limit {
            self.escalated = true;
            error!(address = %self.config.address, "heartbeat down too long");
            if let Err(e) = shutdown.kill_all_hv("heartbeat to watchdog lost") {
                error!(error = %e, "heartbeat shutdown incomplete");
            }
        }
    }

    /// Beat on a background thread until the handle is stopped.
    pub fn spawn(mut self) -> HeartbeatHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let state = self.state.clone();
        let thread = thread::spawn(move || {
            loop {
                self.beat();
                match stop_rx.recv_timeout(self.next_delay()) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        HeartbeatHandle {
            state,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }
}

pub struct HeartbeatHandle {
    state: Arc<Mutex<HeartbeatState>>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn state(&self) -> HeartbeatState {
        self.state.lock().clone()
    }

    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
