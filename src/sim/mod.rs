//! Simulated HV modules speaking both wire protocols.
//!
//! A simulated device implements [embedded_io::Read] & [embedded_io::Write], so
//! it plugs into a codec exactly where a serial port would. The device physics
//! are held behind a [`SimHandle`], which tests keep to advance time and inject
//! faults while the codec owns the device.

pub mod char_echo;
pub mod scpi;

pub use char_echo::SimulatedCharEcho;
pub use scpi::SimulatedScpi;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::debug;

use crate::register::Polarity;

/// Load seen by every simulated output, in ohms.
const LOAD_OHMS: f64 = 1.0e9;

#[derive(Debug, Clone)]
pub struct SimChannel {
    /// Output magnitude in volts.
    pub voltage: f64,
    pub set_point: f64,
    pub ramp_rate: f64,
    pub voltage_limit: f64,
    pub current_limit: f64,
    pub trip_current: f64,
    pub hv_on: bool,
    /// Where the output is heading.
    pub target: Option<f64>,
    pub tripped: bool,
    pub emergency_off: bool,
    pub inhibit: bool,
    pub polarity: Polarity,
    pub auto_start: bool,
}

impl SimChannel {
    fn new(hv_on: bool) -> Self {
        Self {
            voltage: 0.0,
            set_point: 0.0,
            ramp_rate: 50.0,
            voltage_limit: 4000.0,
            current_limit: 3.0e-3,
            trip_current: 1.0e-3,
            hv_on,
            target: None,
            tripped: false,
            emergency_off: false,
            inhibit: false,
            polarity: Polarity::Positive,
            auto_start: false,
        }
    }

    /// Output voltage with the polarity sign applied.
    pub fn signed_voltage(&self) -> f64 {
        self.polarity.apply(self.voltage)
    }

    pub fn current(&self) -> f64 {
        self.voltage / LOAD_OHMS
    }

    fn advance(&mut self, dt: Duration) {
        let Some(target) = self.target else {
            return;
        };
        let step = self.ramp_rate * dt.as_secs_f64();
        if (target - self.voltage).abs() <= step {
            self.voltage = target;
            self.target = None;
        } else if target > self.voltage {
            self.voltage += step;
        } else {
            self.voltage -= step;
        }
    }

    fn trip(&mut self, drops_enable: bool) {
        self.tripped = true;
        self.voltage = 0.0;
        self.target = None;
        if drops_enable {
            self.hv_on = false;
        }
    }
}

#[derive(Debug)]
pub struct SimState {
    pub channels: Vec<SimChannel>,
    /// Simulated time since creation.
    pub elapsed: Duration,
    /// Trip every energized channel this often.
    pub trip_period: Option<Duration>,
    /// When the periodic trip last fired.
    pub last_trip: Duration,
    /// Stop answering, e.g. a cable pulled mid-session.
    pub silent: bool,
    /// Commands that could not be parsed.
    pub garbled: usize,
    /// Every complete command line received.
    pub log: Vec<String>,
    /// A trip also clears HV enable (family B behaviour).
    trip_drops_enable: bool,
}

impl SimState {
    fn channel_mut(&mut self, index: usize) -> Option<&mut SimChannel> {
        self.channels.get_mut(index)
    }
}

/// Test-side control of a simulated device.
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn new(channels: usize, hv_on: bool, trip_drops_enable: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                channels: vec![SimChannel::new(hv_on); channels],
                elapsed: Duration::ZERO,
                trip_period: None,
                last_trip: Duration::ZERO,
                silent: false,
                garbled: 0,
                log: Vec::new(),
                trip_drops_enable,
            })),
        }
    }

    /// Advance simulated time, moving every ramping output toward its target.
    pub fn tick(&self, dt: Duration) {
        let mut state = self.state.lock();
        state.elapsed += dt;
        for channel in state.channels.iter_mut() {
            channel.advance(dt);
        }
        if let Some(period) = state.trip_period {
            if state.elapsed - state.last_trip >= period {
                state.last_trip = state.elapsed;
                let drops = state.trip_drops_enable;
                for channel in state.channels.iter_mut().filter(|c| c.voltage > 0.0) {
                    channel.trip(drops);
                }
                debug!(elapsed = ?state.elapsed, "simulated periodic trip");
            }
        }
    }

    /// Trip one channel now.
    pub fn trip(&self, channel: usize) {
        let mut state = self.state.lock();
        let drops = state.trip_drops_enable;
        if let Some(channel) = state.channel_mut(channel) {
            channel.trip(drops);
        }
    }

    /// Trip every energized channel each `period` of simulated time.
    pub fn set_periodic_trip(&self, period: Option<Duration>) {
        let mut state = self.state.lock();
        state.trip_period = period;
        state.last_trip = state.elapsed;
    }

    pub fn set_inhibit(&self, channel: usize, inhibit: bool) {
        if let Some(channel) = self.state.lock().channel_mut(channel) {
            channel.inhibit = inhibit;
            if inhibit {
                channel.voltage = 0.0;
                channel.target = None;
            }
        }
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    pub fn channel(&self, channel: usize) -> Option<SimChannel> {
        self.state.lock().channels.get(channel).cloned()
    }

    pub fn garbled(&self) -> usize {
        self.state.lock().garbled
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Nothing to read: the device is silent.
    #[error("simulated device timed out")]
    Timeout,
}

impl embedded_io::Error for SimError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::TimedOut
    }
}

/// Byte queue the device answers into.
#[derive(Debug, Default)]
struct Outbox(VecDeque<u8>);

impl Outbox {
    fn push(&mut self, bytes: &[u8]) {
        self.0.extend(bytes);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SimError> {
        if self.0.is_empty() {
            return Err(SimError::Timeout);
        }
        let count = buf.len().min(self.0.len());
        for (slot, byte) in buf.iter_mut().zip(self.0.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

/// Format a value for the family B wire, e.g. 500 V as `0.5E3V`.
pub fn format_scaled(value: f64, scale: i32, unit: &str) -> String {
    let scaled = value / 10f64.powi(scale);
    let rounded = (scaled * 1.0e6).round() / 1.0e6;
    format!("{rounded}E{scale}{unit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_physics() {
        let handle = SimHandle::new(1, true, false);
        {
            let mut state = handle.state.lock();
            let channel = &mut state.channels[0];
            channel.ramp_rate = 10.0;
            channel.target = Some(1000.0);
        }
        handle.tick(Duration::from_secs(50));
        assert_eq!(handle.channel(0).unwrap().voltage, 500.0);
        handle.tick(Duration::from_secs(50));
        let channel = handle.channel(0).unwrap();
        assert_eq!(channel.voltage, 1000.0);
        assert_eq!(channel.target, None);
    }

    #[test]
    fn periodic_trip_reference_moves_forward() {
        let handle = SimHandle::new(1, true, false);
        handle.state.lock().channels[0].voltage = 100.0;
        handle.set_periodic_trip(Some(Duration::from_secs(10)));

        handle.tick(Duration::from_secs(10));
        assert!(handle.channel(0).unwrap().tripped);
        assert_eq!(handle.state.lock().last_trip, Duration::from_secs(10));

        // Re-energize and clear; the next trip is one full period later.
        {
            let mut state = handle.state.lock();
            state.channels[0].tripped = false;
            state.channels[0].voltage = 100.0;
        }
        handle.tick(Duration::from_secs(5));
        assert!(!handle.channel(0).unwrap().tripped);
        handle.tick(Duration::from_secs(5));
        assert!(handle.channel(0).unwrap().tripped);
        assert_eq!(handle.state.lock().last_trip, Duration::from_secs(20));
        assert_eq!(handle.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn timeout_is_a_std_error() {
        fn boxed(err: SimError) -> Box<dyn std::error::Error> {
            Box::new(err)
        }
        let err = boxed(SimError::Timeout);
        assert_eq!(err.to_string(), "simulated device timed out");
    }

    #[test]
    fn scaled_values() {
        assert_eq!(format_scaled(500.0, 3, "V"), "0.5E3V");
        assert_eq!(format_scaled(1000.0, 3, "V"), "1E3V");
        assert_eq!(format_scaled(2.5e-6, -6, "A"), "2.5E-6A");
        assert_eq!(format_scaled(-1200.0, 3, "V"), "-1.2E3V");
    }
}
