//! One HV module: a serial line, its codec and its channels.
//!
//! All traffic on the line is serialized by the module's occupancy flag. Writers
//! follow a fixed order: pause the poller, wait for the line to be free, occupy
//! it, exchange, release, resume the poller. The poller yields to any writer by
//! checking the pause counter before every single read.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    channel::{Field, HvChannel, TripKind},
    codec::{CharEchoCodec, DeviceInfo, HvCodec, ScpiCodec, StatusReport},
    config::{ModuleConfig, PollingConfig},
    error::{Error, Result},
    events::{EventBus, HvEvent},
    notify::{Notifier, Priority},
    register::{ChannelStatus, Family, Polarity},
    transport::{SerialConfig, SerialTransport},
};

/// Exclusive-access flag for one serial line.
#[derive(Debug, Default)]
pub struct Occupancy {
    busy: Mutex<bool>,
    freed: Condvar,
}

/// Holds the line; released on drop.
pub struct OccupancyGuard<'a> {
    occupancy: &'a Occupancy,
}

impl Occupancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `bound` for the line to be free, then occupy it.
    pub fn acquire(&self, bound: Duration) -> Option<OccupancyGuard<'_>> {
        let deadline = Instant::now() + bound;
        let mut busy = self.busy.lock();
        while *busy {
            if self.freed.wait_until(&mut busy, deadline).timed_out() && *busy {
                return None;
            }
        }
        *busy = true;
        Some(OccupancyGuard { occupancy: self })
    }

    /// Wait up to `bound` for the line to be free without occupying it.
    pub fn wait_clear(&self, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        let mut busy = self.busy.lock();
        while *busy {
            if self.freed.wait_until(&mut busy, deadline).timed_out() {
                return !*busy;
            }
        }
        true
    }

    pub fn is_occupied(&self) -> bool {
        *self.busy.lock()
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.freed.notify_all();
    }
}

impl Drop for OccupancyGuard<'_> {
    fn drop(&mut self) {
        self.occupancy.release();
    }
}

/// Keeps the poller paused while alive.
struct PauseGuard<'a>(&'a AtomicUsize);

impl<'a> PauseGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct ModuleOptions {
    pub channels: u8,
    pub min_trip_interval: Duration,
    /// Bound on waiting for the line before giving up with `OccupancyTimeout`.
    pub occupancy_wait: Duration,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            channels: 1,
            min_trip_interval: Duration::from_secs(300),
            occupancy_wait: Duration::from_secs(10),
        }
    }
}

/// A poll read, one exchange each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollRead {
    Voltage,
    Current,
    VoltageLimit,
    CurrentLimit,
    SetVoltage,
    RampRate,
    TripCurrent,
    Status,
    AutoStart,
}

const FAST_READS: &[PollRead] = &[PollRead::Voltage, PollRead::Current];

const FULL_READS: &[PollRead] = &[
    PollRead::Voltage,
    PollRead::Current,
    PollRead::VoltageLimit,
    PollRead::CurrentLimit,
    PollRead::SetVoltage,
    PollRead::RampRate,
    PollRead::TripCurrent,
    PollRead::Status,
    PollRead::AutoStart,
];

enum Reading {
    Value(f64),
    Status(StatusReport),
    AutoStart(Option<bool>),
}

impl PollRead {
    fn run(self, codec: &mut dyn HvCodec, channel: u8) -> Result<Reading> {
        Ok(match self {
            PollRead::Voltage => Reading::Value(codec.read_voltage(channel)?),
            PollRead::Current => Reading::Value(codec.read_current(channel)?),
            PollRead::VoltageLimit => Reading::Value(codec.get_voltage_limit(channel)?),
            PollRead::CurrentLimit => Reading::Value(codec.get_current_limit(channel)?),
            PollRead::SetVoltage => Reading::Value(codec.get_set_voltage(channel)?),
            PollRead::RampRate => Reading::Value(codec.get_ramp_rate(channel)?),
            PollRead::TripCurrent => Reading::Value(codec.get_trip_current(channel)?),
            PollRead::Status => Reading::Status(codec.read_status(channel)?),
            PollRead::AutoStart => Reading::AutoStart(codec.get_auto_start(channel)?),
        })
    }

    fn field(self) -> Option<Field> {
        match self {
            PollRead::Voltage => Some(Field::MeasuredVoltage),
            PollRead::Current => Some(Field::MeasuredCurrent),
            PollRead::VoltageLimit => Some(Field::VoltageLimit),
            PollRead::CurrentLimit => Some(Field::CurrentLimit),
            PollRead::SetVoltage => Some(Field::SetVoltage),
            PollRead::RampRate => Some(Field::RampRate),
            PollRead::TripCurrent => Some(Field::TripCurrent),
            PollRead::Status => Some(Field::Status),
            PollRead::AutoStart => Some(Field::AutoStart),
        }
    }
}

/// How a poll cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// A writer asked for the line; the rest of the cycle was dropped.
    Skipped,
    Stopped,
}

pub struct HvModule {
    name: String,
    port: String,
    family: Family,
    info: DeviceInfo,
    codec: Mutex<Box<dyn HvCodec>>,
    occupancy: Occupancy,
    commands_blocked: AtomicUsize,
    channels: RwLock<Vec<HvChannel>>,
    auto_ramp: AtomicBool,
    connected: AtomicBool,
    occupancy_wait: Duration,
    events: EventBus,
    notifier: Arc<dyn Notifier>,
}

impl HvModule {
    /// Wrap an already connected codec and read the device identity.
    pub fn new(
        name: &str,
        port: &str,
        mut codec: Box<dyn HvCodec>,
        options: ModuleOptions,
        events: EventBus,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let family = codec.family();
        let info = codec.identify()?;
        info!(
            module = name,
            %family,
            serial = %info.serial_number,
            firmware = %info.firmware,
            "module connected"
        );
        let channels = (0..options.channels)
            .map(|i| HvChannel::new(name, i, options.min_trip_interval))
            .collect();
        Ok(Self {
            name: name.to_string(),
            port: port.to_string(),
            family,
            info,
            codec: Mutex::new(codec),
            occupancy: Occupancy::new(),
            commands_blocked: AtomicUsize::new(0),
            channels: RwLock::new(channels),
            auto_ramp: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            occupancy_wait: options.occupancy_wait,
            events,
            notifier,
        })
    }

    /// Open the configured serial port, pick the codec for the family, and do a
    /// first full read of every channel.
    pub fn open(
        config: &ModuleConfig,
        polling: &PollingConfig,
        events: EventBus,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let transport = SerialTransport::open(&SerialConfig::from(config))?;
        transport.clear()?;
        let codec: Box<dyn HvCodec> = match config.family {
            Family::FamilyA => Box::new(CharEchoCodec::new(transport)),
            Family::FamilyB => Box::new(ScpiCodec::new(transport)),
        };
        let options = ModuleOptions {
            channels: config.channels,
            min_trip_interval: config.min_trip_interval(),
            occupancy_wait: polling.occupancy_wait(),
        };
        let module = Self::new(&config.name, &config.port, codec, options, events, notifier)?;
        module.refresh_full();
        Ok(module)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn channel_count(&self) -> u8 {
        self.channels.read().len() as u8
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_occupied(&self) -> bool {
        self.occupancy.is_occupied()
    }

    /// True while a writer wants the line.
    pub fn commands_blocked(&self) -> bool {
        self.commands_blocked.load(Ordering::SeqCst) > 0
    }

    pub fn auto_ramp_enabled(&self) -> bool {
        self.auto_ramp.load(Ordering::SeqCst)
    }

    /// Allow set-point writes to ramp energized channels again after a shutdown.
    pub fn enable_auto_ramp(&self) {
        self.auto_ramp.store(true, Ordering::SeqCst);
        info!(module = %self.name, "automatic ramping re-enabled");
    }

    pub fn disable_auto_ramp(&self) {
        self.auto_ramp.store(false, Ordering::SeqCst);
    }

    /// Wait up to `bound` until no exchange is in flight.
    pub fn wait_idle(&self, bound: Duration) -> bool {
        self.occupancy.wait_clear(bound)
    }

    /// Copy of one channel's state.
    pub fn channel(&self, index: u8) -> Result<HvChannel> {
        self.channels
            .read()
            .get(index as usize)
            .cloned()
            .ok_or(Error::InvalidChannel(index))
    }

    /// Copy of every channel's state.
    pub fn snapshot(&self) -> Vec<HvChannel> {
        self.channels.read().clone()
    }

    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            for channel in self.channels.write().iter_mut() {
                channel.invalidate_all();
            }
            info!(module = %self.name, "module disconnected");
            self.events.publish(HvEvent::ModuleDisconnected {
                module: self.name.clone(),
            });
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected(self.name.clone()))
        }
    }

    fn update_channel<T>(&self, index: u8, update: impl FnOnce(&mut HvChannel) -> T) -> Result<T> {
        let mut channels = self.channels.write();
        let channel = channels
            .get_mut(index as usize)
            .ok_or(Error::InvalidChannel(index))?;
        Ok(update(channel))
    }

    /// Run a command with the line held exclusively.
    fn exclusive<T>(
        &self,
        operation: &str,
        exchange: impl FnOnce(&mut dyn HvCodec) -> Result<T>,
    ) -> Result<T> {
        self.ensure_connected()?;
        let _pause = PauseGuard::new(&self.commands_blocked);
        let _line = self
            .occupancy
            .acquire(self.occupancy_wait)
            .ok_or_else(|| Error::OccupancyTimeout(self.name.clone()))?;
        let mut codec = self.codec.lock();
        let result = exchange(codec.as_mut());
        if let Err(e) = &result {
            warn!(module = %self.name, operation, error = %e, "command failed");
            self.resync(codec.as_mut(), e);
        }
        result
    }

    /// Run one poll read unless a writer is waiting. `None` means skipped.
    fn shared<T>(&self, exchange: impl FnOnce(&mut dyn HvCodec) -> Result<T>) -> Option<Result<T>> {
        if self.commands_blocked() {
            return None;
        }
        let _line = self.occupancy.acquire(self.occupancy_wait)?;
        let mut codec = self.codec.lock();
        let result = exchange(codec.as_mut());
        if let Err(e) = &result {
            self.resync(codec.as_mut(), e);
        }
        Some(result)
    }

    /// After a link or framing error, drop any late reply so the next exchange
    /// starts on a clean line. Called with the line still held.
    fn resync(&self, codec: &mut dyn HvCodec, error: &Error) {
        if !error.is_communication() {
            return;
        }
        let dropped = codec.discard_input();
        if dropped > 0 {
            debug!(module = %self.name, dropped, "discarded stale input");
        }
    }

    /// Write a new set-point. On an energized channel this starts a ramp.
    pub fn set_voltage(&self, index: u8, volts: f64) -> Result<()> {
        let current = self.channel(index)?;
        if !volts.is_finite() {
            return Err(Error::Rejected(format!("set-point {volts} is not a number")));
        }
        if let Some(limit) = current.voltage_limit() {
            if volts.abs() > limit.abs() {
                return Err(Error::Rejected(format!(
                    "set-point {volts} V exceeds the {limit} V limit of {}",
                    current.id()
                )));
            }
        }
        let energized = current.hv_on();
        // An unknown status may hide an energized channel.
        if (energized || !current.status_known()) && !self.auto_ramp_enabled() {
            return Err(Error::Rejected(format!(
                "automatic ramping on {} is inhibited after an emergency shutdown",
                self.name
            )));
        }
        let family = self.family;
        let reported = self.exclusive("set voltage", |codec| {
            codec.set_voltage(index, volts)?;
            if energized && family == Family::FamilyA {
                codec.start_ramp(index)
            } else {
                Ok(None)
            }
        })?;
        debug!(module = %self.name, channel = index, volts, "set-point written");
        self.update_channel(index, |channel| {
            channel.command_set_voltage(volts);
            if reported.is_some() {
                channel.command_start_ramp(reported);
            }
        })
    }

    pub fn set_ramp_rate(&self, index: u8, volts_per_second: f64) -> Result<()> {
        self.channel(index)?;
        if !(volts_per_second > 0.0) || !volts_per_second.is_finite() {
            return Err(Error::Rejected(format!(
                "ramp rate {volts_per_second} V/s must be positive"
            )));
        }
        self.exclusive("set ramp rate", |codec| {
            codec.set_ramp_rate(index, volts_per_second)
        })?;
        self.update_channel(index, |channel| channel.command_set_ramp_rate(volts_per_second))
    }

    /// Ask the device to move toward the loaded set-point.
    pub fn start_ramp(&self, index: u8) -> Result<ChannelStatus> {
        self.channel(index)?.check_can_enable()?;
        let reported = self.exclusive("start ramp", |codec| codec.start_ramp(index))?;
        self.update_channel(index, |channel| {
            channel.command_turn_on();
            if reported.is_some() {
                channel.command_start_ramp(reported);
            }
            channel.status()
        })
    }

    /// Energize a channel and ramp to its set-point.
    pub fn turn_on(&self, index: u8) -> Result<ChannelStatus> {
        let current = self.channel(index)?;
        current.check_can_enable()?;
        let family = self.family;
        let set_point = current.set_voltage();
        let reported = self.exclusive("turn on", |codec| match family {
            // No remote enable: reload the set-point and start the ramp.
            Family::FamilyA => {
                if let Some(volts) = set_point {
                    codec.set_voltage(index, volts)?;
                }
                codec.start_ramp(index)
            }
            Family::FamilyB => codec.set_hv(index, true).map(|_| None),
        })?;
        info!(module = %self.name, channel = index, "turn on");
        self.update_channel(index, |channel| {
            channel.command_turn_on();
            if reported.is_some() {
                channel.command_start_ramp(reported);
            }
            channel.status()
        })
    }

    /// Ramp a channel down to zero and de-energize it.
    pub fn turn_off(&self, index: u8) -> Result<ChannelStatus> {
        self.channel(index)?;
        self.exclusive("turn off", |codec| codec.set_hv(index, false))?;
        info!(module = %self.name, channel = index, "turn off");
        self.update_channel(index, |channel| {
            channel.command_turn_off();
            channel.status()
        })
    }

    /// Immediate zeroing without a ramp. The channel stays locked out until
    /// [`HvModule::clear_trip`].
    pub fn emergency_off(&self, index: u8) -> Result<()> {
        let id = self.channel(index)?.id().to_string();
        self.exclusive("emergency off", |codec| codec.emergency_off(index))?;
        self.update_channel(index, HvChannel::command_emergency_off)?;
        self.notifier
            .notify(&id, Priority::High, "channel emergency off commanded");
        Ok(())
    }

    /// Acknowledge a trip or emergency-off on the device and locally.
    pub fn clear_trip(&self, index: u8) -> Result<()> {
        self.channel(index)?;
        self.exclusive("clear trip", |codec| codec.clear_events(index))?;
        self.update_channel(index, HvChannel::command_clear_events)
    }

    /// Change output polarity. Only allowed with HV off and the output near zero.
    pub fn set_polarity(&self, index: u8, polarity: Polarity) -> Result<()> {
        if let Err(e) = self.channel(index)?.check_polarity_change() {
            warn!(module = %self.name, channel = index, error = %e, "polarity change refused");
            return Err(e);
        }
        self.exclusive("set polarity", |codec| codec.set_polarity(index, polarity))?;
        self.update_channel(index, |channel| channel.command_set_polarity(polarity))
    }

    /// Bring every channel to zero at `max_rate` V/s, stopping automatic ramping.
    /// Every channel is attempted; the first failure is returned.
    pub fn ramp_all_to_zero(&self, max_rate: f64) -> Result<()> {
        self.disable_auto_ramp();
        let mut first_error = None;
        for index in 0..self.channel_count() {
            let result = self
                .set_ramp_rate(index, max_rate)
                .and_then(|_| self.turn_off(index));
            if let Err(e) = result {
                warn!(module = %self.name, channel = index, error = %e, "ramp to zero failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One poll pass over every channel. `stop` is checked before every read.
    pub fn poll_cycle(&self, full: bool, stop: &dyn Fn() -> bool) -> CycleOutcome {
        if !self.is_connected() {
            return CycleOutcome::Stopped;
        }
        let reads = if full { FULL_READS } else { FAST_READS };
        for index in 0..self.channel_count() {
            for &read in reads {
                if stop() {
                    return CycleOutcome::Stopped;
                }
                let Some(result) = self.shared(|codec| read.run(codec, index)) else {
                    return CycleOutcome::Skipped;
                };
                self.apply_reading(index, read, result);
            }
            if let Ok(channel) = self.channel(index) {
                self.events
                    .publish(HvEvent::ChannelUpdated(Box::new(channel)));
            }
        }
        CycleOutcome::Completed
    }

    /// Read everything once, without a stop condition.
    pub fn refresh_full(&self) -> CycleOutcome {
        self.poll_cycle(true, &|| false)
    }

    fn apply_reading(&self, index: u8, read: PollRead, result: Result<Reading>) {
        let mut channels = self.channels.write();
        let Some(channel) = channels.get_mut(index as usize) else {
            return;
        };
        let reading = match result {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    module = %self.name,
                    channel = index,
                    read = ?read,
                    error = %e,
                    "poll read failed"
                );
                if let Some(field) = read.field() {
                    channel.invalidate(field);
                }
                return;
            }
        };
        let mut trip = None;
        match (read, reading) {
            (PollRead::Voltage, Reading::Value(v)) => channel.observe_voltage(v),
            (PollRead::Current, Reading::Value(v)) => channel.observe_current(v),
            (PollRead::VoltageLimit, Reading::Value(v)) => channel.observe_voltage_limit(v),
            (PollRead::CurrentLimit, Reading::Value(v)) => channel.observe_current_limit(v),
            (PollRead::SetVoltage, Reading::Value(v)) => channel.observe_set_voltage(v),
            (PollRead::RampRate, Reading::Value(v)) => channel.observe_ramp_rate(v),
            (PollRead::TripCurrent, Reading::Value(v)) => channel.observe_trip_current(v),
            (PollRead::Status, Reading::Status(report)) => {
                let now = Utc::now();
                trip = channel
                    .observe_status(&report, now)
                    .map(|kind| (channel.id().clone(), kind, now));
            }
            (PollRead::AutoStart, Reading::AutoStart(flag)) => channel.observe_auto_start(flag),
            _ => {}
        }
        drop(channels);

        if let Some((id, kind, at)) = trip {
            let (priority, cause) = match kind {
                TripKind::Isolated => (Priority::High, "channel tripped"),
                TripKind::Frequent => (Priority::Critical, "channel tripping frequently"),
            };
            self.notifier.notify(&id.to_string(), priority, cause);
            self.events.publish(HvEvent::ChannelTripped {
                channel: id,
                kind,
                at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use embedded_io::{Read as _, Write as _};

    use crate::{
        notify::RecordingNotifier,
        sim::{SimError, SimHandle, SimulatedCharEcho, SimulatedScpi},
    };

    /// Family A device whose next reply, once armed, arrives only after the
    /// codec's read has already timed out.
    struct LateReply {
        device: SimulatedCharEcho,
        armed: Arc<AtomicBool>,
        echo: VecDeque<u8>,
        late: VecDeque<u8>,
        stalled: bool,
    }

    impl LateReply {
        fn new(device: SimulatedCharEcho) -> (Self, Arc<AtomicBool>) {
            let armed = Arc::new(AtomicBool::new(false));
            let device = Self {
                device,
                armed: armed.clone(),
                echo: VecDeque::new(),
                late: VecDeque::new(),
                stalled: false,
            };
            (device, armed)
        }
    }

    impl embedded_io::ErrorType for LateReply {
        type Error = SimError;
    }

    impl embedded_io::Write for LateReply {
        fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, SimError> {
            let written = self.device.write(buf)?;
            if buf.contains(&b'\n') && self.armed.swap(false, Ordering::SeqCst) {
                let mut byte = [0u8; 1];
                while let Ok(1) = self.device.read(&mut byte) {
                    if self.echo.is_empty() {
                        self.echo.push_back(byte[0]);
                    } else {
                        self.late.push_back(byte[0]);
                    }
                }
                self.stalled = true;
            }
            Ok(written)
        }

        fn flush(&mut self) -> core::result::Result<(), SimError> {
            self.device.flush()
        }
    }

    impl embedded_io::Read for LateReply {
        fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, SimError> {
            if let Some(byte) = self.echo.pop_front() {
                buf[0] = byte;
                return Ok(1);
            }
            if self.stalled {
                self.stalled = false;
                return Err(SimError::Timeout);
            }
            if !self.late.is_empty() {
                let count = buf.len().min(self.late.len());
                for (slot, byte) in buf.iter_mut().zip(self.late.drain(..count)) {
                    *slot = byte;
                }
                return Ok(count);
            }
            self.device.read(buf)
        }
    }

    fn family_a(channels: u8) -> (HvModule, SimHandle, RecordingNotifier) {
        let device = SimulatedCharEcho::new(channels);
        let handle = device.handle();
        let notifier = RecordingNotifier::new();
        let module = HvModule::new(
            "hv-a",
            "sim",
            Box::new(CharEchoCodec::new(device)),
            ModuleOptions {
                channels,
                ..Default::default()
            },
            EventBus::new(),
            Arc::new(notifier.clone()),
        )
        .unwrap();
        (module, handle, notifier)
    }

    fn family_b(channels: u8) -> (HvModule, SimHandle) {
        let device = SimulatedScpi::new(channels);
        let handle = device.handle();
        let module = HvModule::new(
            "hv-b",
            "sim",
            Box::new(ScpiCodec::new(device)),
            ModuleOptions {
                channels,
                ..Default::default()
            },
            EventBus::new(),
            Arc::new(RecordingNotifier::new()),
        )
        .unwrap();
        (module, handle)
    }

    #[test]
    fn occupancy_acquire_times_out_while_held() {
        let occupancy = Occupancy::new();
        let guard = occupancy.acquire(Duration::from_millis(10)).unwrap();
        assert!(occupancy.is_occupied());
        assert!(occupancy.acquire(Duration::from_millis(20)).is_none());
        assert!(!occupancy.wait_clear(Duration::from_millis(20)));
        drop(guard);
        assert!(!occupancy.is_occupied());
        assert!(occupancy.wait_clear(Duration::ZERO));
    }

    #[test]
    fn occupancy_wakes_waiter_on_release() {
        let occupancy = Arc::new(Occupancy::new());
        let guard_holder = occupancy.clone();
        let (tx, rx) = crossbeam_channel::bounded(0);
        let holder = std::thread::spawn(move || {
            let _guard = guard_holder.acquire(Duration::from_secs(1)).unwrap();
            tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
        });
        rx.recv().unwrap();
        assert!(occupancy.acquire(Duration::from_secs(2)).is_some());
        holder.join().unwrap();
    }

    #[test]
    fn identity_is_read_on_connect() {
        let (module, _, _) = family_a(2);
        assert_eq!(module.family(), Family::FamilyA);
        assert_eq!(module.port(), "sim");
        assert_eq!(module.info().voltage_rating, Some(4000.0));
        assert_eq!(module.channel_count(), 2);
    }

    #[test]
    fn family_a_ramp_up_and_settle() {
        let (module, sim, _) = family_a(1);
        module.refresh_full();
        module.set_ramp_rate(0, 10.0).unwrap();
        module.set_voltage(0, 1000.0).unwrap();
        assert_eq!(module.start_ramp(0).unwrap(), ChannelStatus::RampUp);

        sim.tick(Duration::from_secs(50));
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        assert!((channel.measured_voltage().unwrap() - 500.0).abs() <= 10.0);
        assert_eq!(channel.status(), ChannelStatus::RampUp);

        sim.tick(Duration::from_secs(50));
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        assert_eq!(channel.measured_voltage(), Some(1000.0));
        assert_eq!(channel.status(), ChannelStatus::On);
    }

    #[test]
    fn trip_latches_and_notifies() {
        let (module, sim, notifier) = family_a(1);
        module.set_voltage(0, 500.0).unwrap();
        module.start_ramp(0).unwrap();
        sim.tick(Duration::from_secs(1000));
        module.refresh_full();
        sim.trip(0);
        module.refresh_full();
        assert!(module.channel(0).unwrap().tripped());
        assert_eq!(notifier.sent().len(), 1);

        // The status read acknowledged the trip on the device, but not locally.
        for _ in 0..3 {
            module.refresh_full();
            assert!(module.channel(0).unwrap().tripped());
        }
        assert!(matches!(module.turn_on(0), Err(Error::Rejected(_))));
        module.clear_trip(0).unwrap();
        assert!(!module.channel(0).unwrap().tripped());
    }

    #[test]
    fn family_b_polarity_requires_off() {
        let (module, sim) = family_b(1);
        module.refresh_full();
        module.set_polarity(0, Polarity::Negative).unwrap();
        assert_eq!(module.channel(0).unwrap().polarity(), Polarity::Negative);

        module.set_voltage(0, 500.0).unwrap();
        module.turn_on(0).unwrap();
        sim.tick(Duration::from_secs(1000));
        module.refresh_full();
        assert!(matches!(
            module.set_polarity(0, Polarity::Positive),
            Err(Error::Rejected(_))
        ));
    }

    #[test]
    fn family_b_emergency_off_locks_out() {
        let (module, sim) = family_b(1);
        module.set_voltage(0, 800.0).unwrap();
        module.turn_on(0).unwrap();
        sim.tick(Duration::from_secs(1000));
        module.refresh_full();
        module.emergency_off(0).unwrap();
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        assert!(channel.emergency_off());
        assert_eq!(channel.measured_voltage(), Some(0.0));
        assert!(matches!(module.turn_on(0), Err(Error::Rejected(_))));

        module.clear_trip(0).unwrap();
        module.refresh_full();
        assert!(!module.channel(0).unwrap().emergency_off());
        assert!(module.turn_on(0).is_ok());
    }

    #[test]
    fn family_a_emergency_off_is_unsupported() {
        let (module, _, _) = family_a(1);
        assert!(matches!(
            module.emergency_off(0),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn auto_ramp_inhibit_blocks_energized_set_points() {
        let (module, sim) = family_b(1);
        module.set_voltage(0, 300.0).unwrap();
        module.turn_on(0).unwrap();
        sim.tick(Duration::from_secs(1000));
        module.refresh_full();
        module.disable_auto_ramp();
        assert!(matches!(
            module.set_voltage(0, 400.0),
            Err(Error::Rejected(_))
        ));
        module.enable_auto_ramp();
        assert!(module.set_voltage(0, 400.0).is_ok());
    }

    #[test]
    fn failed_reads_invalidate() {
        let (module, sim, _) = family_a(1);
        module.refresh_full();
        assert!(module.channel(0).unwrap().measured_voltage().is_some());
        sim.set_silent(true);
        module.poll_cycle(false, &|| false);
        assert_eq!(module.channel(0).unwrap().measured_voltage(), None);
    }

    #[test]
    fn late_reply_is_dropped_before_the_next_exchange() {
        let device = SimulatedCharEcho::new(1);
        let sim = device.handle();
        let (device, armed) = LateReply::new(device);
        let module = HvModule::new(
            "hv-a",
            "sim",
            Box::new(CharEchoCodec::new(device)),
            ModuleOptions {
                channels: 1,
                ..Default::default()
            },
            EventBus::new(),
            Arc::new(RecordingNotifier::new()),
        )
        .unwrap();

        armed.store(true, Ordering::SeqCst);
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        assert_eq!(channel.measured_voltage(), None);
        assert!(channel.measured_current().is_some());
        assert!(channel.voltage_limit().is_some());
        assert!(channel.status_known());

        module.refresh_full();
        assert_eq!(module.channel(0).unwrap().measured_voltage(), Some(0.0));
        module.set_voltage(0, 250.0).unwrap();
        assert_eq!(module.channel(0).unwrap().set_voltage(), Some(250.0));
        assert_eq!(sim.garbled(), 0);
    }

    #[test]
    fn unreadable_status_forgets_polarity() {
        let (module, sim) = family_b(1);
        module.refresh_full();
        assert!(module.channel(0).unwrap().status_known());
        module.disable_auto_ramp();
        assert!(module.set_voltage(0, 100.0).is_ok());

        sim.set_silent(true);
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        assert!(!channel.status_known());
        assert_eq!(channel.polarity(), Polarity::Unknown);
        assert!(matches!(
            module.set_polarity(0, Polarity::Negative),
            Err(Error::Rejected(_))
        ));
        assert!(matches!(
            module.set_voltage(0, 200.0),
            Err(Error::Rejected(_))
        ));

        sim.set_silent(false);
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        assert!(channel.status_known());
        assert_eq!(channel.polarity(), Polarity::Positive);
        assert!(module.set_polarity(0, Polarity::Negative).is_ok());
    }

    #[test]
    fn family_b_trip_latches_until_event_clear() {
        let (module, sim) = family_b(1);
        module.set_voltage(0, 800.0).unwrap();
        module.turn_on(0).unwrap();
        sim.tick(Duration::from_secs(1000));
        module.refresh_full();
        assert_eq!(module.channel(0).unwrap().status(), ChannelStatus::On);

        sim.trip(0);
        assert!(!sim.channel(0).unwrap().hv_on);
        for _ in 0..3 {
            module.refresh_full();
            let channel = module.channel(0).unwrap();
            assert!(channel.tripped());
            assert_eq!(channel.status(), ChannelStatus::Tripped);
        }
        assert!(matches!(module.turn_on(0), Err(Error::Rejected(_))));

        module.clear_trip(0).unwrap();
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        assert!(!channel.tripped());
        assert!(!sim.channel(0).unwrap().tripped);

        module.turn_on(0).unwrap();
        sim.tick(Duration::from_secs(1000));
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        assert_eq!(channel.measured_voltage(), Some(800.0));
        assert_eq!(channel.status(), ChannelStatus::On);
    }

    #[test]
    fn blocked_commands_skip_the_cycle() {
        let (module, _, _) = family_a(1);
        let _pause = PauseGuard::new(&module.commands_blocked);
        assert_eq!(module.poll_cycle(true, &|| false), CycleOutcome::Skipped);
    }

    #[test]
    fn stop_is_honored_before_reads() {
        let (module, _, _) = family_a(2);
        assert_eq!(module.poll_cycle(true, &|| true), CycleOutcome::Stopped);
    }

    #[test]
    fn disconnected_module_refuses_commands() {
        let (module, _, _) = family_a(1);
        module.disconnect();
        assert!(matches!(
            module.set_voltage(0, 10.0),
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(module.channel(7), Err(Error::InvalidChannel(7))));
    }
}
