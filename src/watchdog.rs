//! Watchdog server: the independent process on the other end of the heartbeat.
//!
//! It echoes every payload back verbatim and remembers when it last heard from
//! the supervisor. A separate checker raises one alarm per outage when the last
//! payload is older than the allowed staleness; the alarm re-arms as soon as
//! payloads arrive again.

use std::{
    io::{ErrorKind, Read, Write},
    net::{IpAddr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::{ConfigError, WatchdogConfig},
    error::Result,
    notify::{Notifier, Priority},
};

/// Granularity of the stop checks in blocking loops.
const POLL_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogState {
    pub last_received_time: Option<DateTime<Utc>>,
    pub alarm_sent: bool,
    pub peer: Option<SocketAddr>,
}

/// Staleness bookkeeping, independent of the network side.
#[derive(Debug)]
pub struct Watchdog {
    max_staleness: Duration,
    /// Staleness is measured from here until the first payload arrives.
    reference: Instant,
    last_received: Option<Instant>,
    last_received_time: Option<DateTime<Utc>>,
    alarm_sent: bool,
    peer: Option<SocketAddr>,
}

/// What a staleness check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Alive,
    /// Stale, and the alarm has just been raised.
    Alarm,
    /// Stale, alarm already raised for this outage.
    StillStale,
}

impl Watchdog {
    pub fn new(max_staleness: Duration, started: Instant) -> Self {
        Self {
            max_staleness,
            reference: started,
            last_received: None,
            last_received_time: None,
            alarm_sent: false,
            peer: None,
        }
    }

    pub fn record_receive(&mut self, at: Instant) {
        self.last_received = Some(at);
        self.last_received_time = Some(Utc::now());
        if self.alarm_sent {
            info!("supervisor heartbeat resumed");
            self.alarm_sent = false;
        }
    }

    pub fn check(&mut self, now: Instant) -> Check {
        let since = self.last_received.unwrap_or(self.reference);
        if now.saturating_duration_since(since) <= self.max_staleness {
            return Check::Alive;
        }
        if self.alarm_sent {
            Check::StillStale
        } else {
            self.alarm_sent = true;
            Check::Alarm
        }
    }

    pub fn state(&self) -> WatchdogState {
        WatchdogState {
            last_received_time: self.last_received_time,
            alarm_sent: self.alarm_sent,
            peer: self.peer,
        }
    }
}

pub struct WatchdogServer {
    config: WatchdogConfig,
    allow: Vec<IpAddr>,
    watchdog: Arc<Mutex<Watchdog>>,
    notifier: Arc<dyn Notifier>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl WatchdogServer {
    pub fn new(config: WatchdogConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        config.validate()?;
        let allow = config
            .allow
            .iter()
            .map(|a| {
                a.parse::<IpAddr>()
                    .map_err(|_| ConfigError::ValidationError(format!("bad allow-list entry {a}")))
            })
            .collect::<core::result::Result<Vec<_>, _>>()?;
        // Staleness counts from the end of the startup delay.
        let started = Instant::now() + config.startup_delay();
        Ok(Self {
            watchdog: Arc::new(Mutex::new(Watchdog::new(config.max_staleness(), started))),
            config,
            allow,
            notifier,
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            local_addr: None,
        })
    }

    pub fn state(&self) -> WatchdogState {
        self.watchdog.lock().state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and start the accept loop and the staleness checker.
    pub fn start(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        self.local_addr = Some(local);
        self.running.store(true, Ordering::SeqCst);
        info!(address = %local, "watchdog listening");

        let running = self.running.clone();
        let watchdog = self.watchdog.clone();
        let allow = self.allow.clone();
        let delay = self.config.startup_delay();
        self.threads.push(thread::spawn(move || {
            sleep_while(&running, delay);
            accept_loop(&listener, &running, &watchdog, &allow);
        }));

        let running = self.running.clone();
        let watchdog = self.watchdog.clone();
        let notifier = self.notifier.clone();
        let interval = self.config.check_interval();
        let max_staleness = self.config.max_staleness();
        self.threads.push(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                let check = watchdog.lock().check(Instant::now());
                if check == Check::Alarm {
                    error!(?max_staleness, "supervisor heartbeat stale");
                    notifier.notify(
                        "hv-supervisor",
                        Priority::Critical,
                        &format!("no heartbeat for more than {}s", max_staleness.as_secs()),
                    );
                }
                sleep_while(&running, interval);
            }
        }));
        Ok(local)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    /// Block until the server stops.
    pub fn wait(&mut self) {
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchdogServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_while(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(POLL_STEP.min(deadline - now));
    }
}

fn accept_loop(
    listener: &TcpListener,
    running: &AtomicBool,
    watchdog: &Mutex<Watchdog>,
    allow: &[IpAddr],
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !allow.contains(&peer.ip()) {
                    warn!(%peer, "rejected heartbeat connection");
                    continue;
                }
                info!(%peer, "heartbeat connection accepted");
                watchdog.lock().peer = Some(peer);
                if let Err(e) = serve(stream, running, watchdog) {
                    debug!(%peer, error = %e, "heartbeat connection ended");
                }
                watchdog.lock().peer = None;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_STEP),
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(POLL_STEP);
            }
        }
    }
}

/// Echo everything back until the peer hangs up or the server stops.
fn serve(
    mut stream: TcpStream,
    running: &AtomicBool,
    watchdog: &Mutex<Watchdog>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_STEP))?;
    let mut buf = [0u8; 256];
    while running.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                stream.write_all(&buf[..n])?;
                watchdog.lock().record_receive(Instant::now());
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::HeartbeatConfig, events::EventBus, heartbeat::HeartbeatClient,
        notify::RecordingNotifier,
    };

    #[test]
    fn alarm_latches_until_liveness_resumes() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_secs(60), start);
        assert_eq!(watchdog.check(start + Duration::from_secs(30)), Check::Alive);
        assert_eq!(watchdog.check(start + Duration::from_secs(61)), Check::Alarm);
        assert_eq!(watchdog.check(start + Duration::from_secs(90)), Check::StillStale);
        assert!(watchdog.state().alarm_sent);

        watchdog.record_receive(start + Duration::from_secs(100));
        assert!(!watchdog.state().alarm_sent);
        assert_eq!(watchdog.check(start + Duration::from_secs(120)), Check::Alive);
        assert_eq!(watchdog.check(start + Duration::from_secs(161)), Check::Alarm);
    }

    fn config(max_staleness_s: u64, allow: Vec<String>) -> WatchdogConfig {
        WatchdogConfig {
            bind: "127.0.0.1:0".into(),
            allow,
            startup_delay_s: 0,
            max_staleness_s,
            check_interval_s: 1,
            ..Default::default()
        }
    }

    #[test]
    fn heartbeat_round_trip_over_loopback() {
        let notifier = RecordingNotifier::new();
        let mut server =
            WatchdogServer::new(config(60, vec!["127.0.0.1".into()]), Arc::new(notifier.clone()))
                .unwrap();
        let address = server.start().unwrap();

        let mut client = HeartbeatClient::new(
            HeartbeatConfig {
                address: address.to_string(),
                update_interval_s: 10,
                timeout_s: 2,
                shutdown_after_s: None,
            },
            EventBus::new(),
        );
        assert!(client.beat_with_payload("1699999999.123"));
        assert!(client.beat());
        assert!(server.state().last_received_time.is_some());
        assert!(notifier.sent().is_empty());
        server.stop();
    }

    #[test]
    fn stale_server_alarms_once() {
        let notifier = RecordingNotifier::new();
        let mut server =
            WatchdogServer::new(config(1, vec!["127.0.0.1".into()]), Arc::new(notifier.clone()))
                .unwrap();
        server.start().unwrap();
        thread::sleep(Duration::from_millis(3500));
        server.stop();
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(notifier.sent()[0].priority, Priority::Critical);
        assert!(server.state().alarm_sent);
    }

    #[test]
    fn peers_outside_the_allow_list_are_refused() {
        let notifier = RecordingNotifier::new();
        let mut server =
            WatchdogServer::new(config(60, vec!["10.0.0.1".into()]), Arc::new(notifier.clone()))
                .unwrap();
        let address = server.start().unwrap();

        let mut client = HeartbeatClient::new(
            HeartbeatConfig {
                address: address.to_string(),
                update_interval_s: 10,
                timeout_s: 2,
                shutdown_after_s: None,
            },
            EventBus::new(),
        );
        assert!(!client.beat());
        assert!(server.state().last_received_time.is_none());
        server.stop();
    }

    #[test]
    fn bad_allow_list_is_rejected() {
        let notifier = Arc::new(RecordingNotifier::new());
        assert!(WatchdogServer::new(config(60, vec!["not-an-ip".into()]), notifier).is_err());
    }
}
