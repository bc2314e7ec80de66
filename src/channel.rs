//! Per-channel state and the ramp/trip state machine.
//!
//! A channel never talks to the wire itself. The owning module performs the
//! exchange and feeds the results in here, so every transition rule lives in
//! one place for both families.
//!
//! Measured and configured values are `Option`s: a failed read marks the value
//! unknown instead of leaving the previous reading in place.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use tracing::{info, warn};

use crate::{
    codec::StatusReport,
    error::{Error, Result},
    register::{ChannelStatus, Polarity},
};

/// Output within this many volts of its target counts as arrived.
pub const SETTLED_TOLERANCE_V: f64 = 0.5;

/// Polarity may only change while the output is below this fraction of the voltage limit.
pub const POLARITY_CHANGE_FRACTION: f64 = 0.002;

/// Trip timestamps kept per channel.
const TRIP_HISTORY: usize = 32;

/// Identity of a channel for logs and notifications, e.g. `hv-top/0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelId {
    pub module: String,
    pub index: u8,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.index)
    }
}

/// How a trip relates to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum TripKind {
    /// First trip, or the previous one was long enough ago.
    Isolated,
    /// Tripped again within the minimum trip interval.
    Frequent,
}

/// Trip-rate bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct TripLog {
    timestamps: Vec<DateTime<Utc>>,
    #[serde(skip)]
    min_interval: Duration,
}

impl TripLog {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            timestamps: Vec::new(),
            min_interval,
        }
    }

    /// Record a trip at `now` and classify it against the previous one.
    pub fn record(&mut self, now: DateTime<Utc>) -> TripKind {
        let kind = match self.timestamps.last() {
            Some(previous) => {
                let since = (now - *previous).to_std().unwrap_or(Duration::ZERO);
                if since < self.min_interval {
                    TripKind::Frequent
                } else {
                    TripKind::Isolated
                }
            }
            None => TripKind::Isolated,
        };
        if self.timestamps.len() == TRIP_HISTORY {
            self.timestamps.remove(0);
        }
        self.timestamps.push(now);
        kind
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

/// Values read back from the device, each of which can go stale on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum Field {
    MeasuredVoltage,
    MeasuredCurrent,
    VoltageLimit,
    CurrentLimit,
    SetVoltage,
    RampRate,
    TripCurrent,
    AutoStart,
    /// Polarity, enable and inhibit flags from the status read. Latched trip
    /// and emergency-off are kept.
    Status,
}

/// Ramp direction needed to go from `measured` to `target`.
pub fn ramp_direction(measured: f64, target: f64) -> ChannelStatus {
    let (measured, target) = (measured.abs(), target.abs());
    if (target - measured).abs() <= SETTLED_TOLERANCE_V {
        ChannelStatus::On
    } else if target > measured {
        ChannelStatus::RampUp
    } else {
        ChannelStatus::RampDown
    }
}

/// One HV channel. Owned by its module, which it refers back to by name only.
#[derive(Debug, Clone, Serialize)]
pub struct HvChannel {
    id: ChannelId,
    measured_voltage: Option<f64>,
    measured_current: Option<f64>,
    voltage_limit: Option<f64>,
    current_limit: Option<f64>,
    set_voltage: Option<f64>,
    ramp_rate: Option<f64>,
    trip_current_limit: Option<f64>,
    auto_start: Option<bool>,
    status: ChannelStatus,
    /// False until a status read succeeds, and again after one fails.
    status_known: bool,
    polarity: Polarity,
    hv_on: bool,
    tripped: bool,
    hardware_inhibit: bool,
    emergency_off: bool,
    manual_control: bool,
    device_error: bool,
    /// Where the output is heading while ramping.
    ramp_target: Option<f64>,
    /// A turn-off is in progress; arriving at zero de-energizes the channel.
    turning_off: bool,
    /// Set when a turn-off completes, cleared by the next turn-on.
    disabled: bool,
    trips: TripLog,
}

impl HvChannel {
    pub fn new(module: &str, index: u8, min_trip_interval: Duration) -> Self {
        Self {
            id: ChannelId {
                module: module.to_string(),
                index,
            },
            measured_voltage: None,
            measured_current: None,
            voltage_limit: None,
            current_limit: None,
            set_voltage: None,
            ramp_rate: None,
            trip_current_limit: None,
            auto_start: None,
            status: ChannelStatus::Off,
            status_known: false,
            polarity: Polarity::Unknown,
            hv_on: false,
            tripped: false,
            hardware_inhibit: false,
            emergency_off: false,
            manual_control: false,
            device_error: false,
            ramp_target: None,
            turning_off: false,
            disabled: false,
            trips: TripLog::new(min_trip_interval),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn index(&self) -> u8 {
        self.id.index
    }

    pub fn measured_voltage(&self) -> Option<f64> {
        self.measured_voltage
    }

    pub fn measured_current(&self) -> Option<f64> {
        self.measured_current
    }

    pub fn voltage_limit(&self) -> Option<f64> {
        self.voltage_limit
    }

    pub fn current_limit(&self) -> Option<f64> {
        self.current_limit
    }

    pub fn set_voltage(&self) -> Option<f64> {
        self.set_voltage
    }

    pub fn ramp_rate(&self) -> Option<f64> {
        self.ramp_rate
    }

    pub fn trip_current_limit(&self) -> Option<f64> {
        self.trip_current_limit
    }

    pub fn auto_start(&self) -> Option<bool> {
        self.auto_start
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// Whether the status flags reflect the latest status read.
    pub fn status_known(&self) -> bool {
        self.status_known
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn hv_on(&self) -> bool {
        self.hv_on
    }

    pub fn tripped(&self) -> bool {
        self.tripped
    }

    pub fn hardware_inhibit(&self) -> bool {
        self.hardware_inhibit
    }

    pub fn emergency_off(&self) -> bool {
        self.emergency_off
    }

    pub fn manual_control(&self) -> bool {
        self.manual_control
    }

    pub fn device_error(&self) -> bool {
        self.device_error
    }

    pub fn ramp_target(&self) -> Option<f64> {
        self.ramp_target
    }

    pub fn trips(&self) -> &TripLog {
        &self.trips
    }

    /// Start moving toward `target`, or settle if already there.
    fn begin_ramp(&mut self, target: f64) {
        // Without a valid reading only the target is known; the next reading fixes the direction.
        let measured = self.measured_voltage.unwrap_or(0.0);
        match ramp_direction(measured, target) {
            ChannelStatus::On if self.measured_voltage.is_some() => self.settle(),
            ChannelStatus::On => {
                self.ramp_target = Some(target);
                self.status = ChannelStatus::RampUp;
            }
            direction => {
                self.ramp_target = Some(target);
                self.status = direction;
            }
        }
    }

    /// Arrived at the ramp target.
    fn settle(&mut self) {
        self.ramp_target = None;
        if self.turning_off {
            self.turning_off = false;
            self.disabled = true;
            self.hv_on = false;
            self.status = ChannelStatus::Off;
            info!(channel = %self.id, "channel de-energized");
        } else if self.hv_on {
            self.status = ChannelStatus::On;
        } else {
            self.status = ChannelStatus::Off;
        }
    }

    /// A new set-point was accepted by the device. Ramps if HV is enabled.
    pub fn command_set_voltage(&mut self, volts: f64) {
        self.set_voltage = Some(volts);
        if self.hv_on && !self.turning_off && !self.tripped && !self.emergency_off {
            self.begin_ramp(volts);
        }
    }

    /// The device accepted a ramp start and may have named the direction.
    pub fn command_start_ramp(&mut self, reported: Option<ChannelStatus>) {
        let target = self.set_voltage.unwrap_or(0.0);
        match reported {
            Some(status) if status.is_ramping() => {
                self.ramp_target = Some(target);
                self.status = status;
            }
            Some(ChannelStatus::On) => self.settle(),
            _ => self.begin_ramp(target),
        }
    }

    /// Refuse to energize a channel with a latched trip or emergency-off.
    pub fn check_can_enable(&self) -> Result<()> {
        if self.tripped {
            return Err(Error::Rejected(format!(
                "channel {} is tripped; clear the trip first",
                self.id
            )));
        }
        if self.emergency_off {
            return Err(Error::Rejected(format!(
                "channel {} is in emergency off; clear it first",
                self.id
            )));
        }
        Ok(())
    }

    /// HV enable accepted by the device: ramp toward the set-point.
    pub fn command_turn_on(&mut self) {
        self.disabled = false;
        self.turning_off = false;
        self.hv_on = true;
        self.begin_ramp(self.set_voltage.unwrap_or(0.0));
    }

    /// Turn-off accepted: ramp to zero regardless of the set-point.
    pub fn command_turn_off(&mut self) {
        if self.tripped {
            return;
        }
        self.turning_off = true;
        self.begin_ramp(0.0);
    }

    /// Immediate zeroing outside the ramp state machine.
    pub fn command_emergency_off(&mut self) {
        self.emergency_off = true;
        self.hv_on = false;
        self.ramp_target = None;
        self.turning_off = false;
        self.disabled = true;
        self.measured_voltage = Some(0.0);
        if !self.tripped {
            self.status = ChannelStatus::Off;
        }
        warn!(channel = %self.id, "emergency off");
    }

    /// Trip and emergency-off flags were acknowledged on the device.
    pub fn command_clear_events(&mut self) {
        if self.tripped || self.emergency_off {
            info!(channel = %self.id, "trip/emergency flags cleared");
        }
        self.tripped = false;
        self.emergency_off = false;
        if self.status == ChannelStatus::Tripped {
            self.status = if self.hv_on && !self.disabled {
                ChannelStatus::On
            } else {
                ChannelStatus::Off
            };
        }
    }

    pub fn command_set_ramp_rate(&mut self, volts_per_second: f64) {
        self.ramp_rate = Some(volts_per_second);
    }

    pub fn command_set_polarity(&mut self, polarity: Polarity) {
        self.polarity = polarity;
    }

    /// Polarity may change only with HV off and the output near zero.
    pub fn check_polarity_change(&self) -> Result<()> {
        if !self.status_known {
            return Err(Error::Rejected(format!(
                "channel {} status unknown",
                self.id
            )));
        }
        if self.hv_on || self.status.is_ramping() {
            return Err(Error::Rejected(format!(
                "channel {} must be off to change polarity",
                self.id
            )));
        }
        let (Some(measured), Some(limit)) = (self.measured_voltage, self.voltage_limit) else {
            return Err(Error::Rejected(format!(
                "channel {} output voltage unknown",
                self.id
            )));
        };
        if measured.abs() > POLARITY_CHANGE_FRACTION * limit.abs() {
            return Err(Error::Rejected(format!(
                "channel {} output {measured} V is not near zero",
                self.id
            )));
        }
        Ok(())
    }

    pub fn observe_voltage(&mut self, volts: f64) {
        self.measured_voltage = Some(volts);
        if let Some(target) = self.ramp_target {
            match ramp_direction(volts, target) {
                ChannelStatus::On => self.settle(),
                direction => self.status = direction,
            }
        }
    }

    pub fn observe_current(&mut self, amps: f64) {
        self.measured_current = Some(amps);
    }

    pub fn observe_voltage_limit(&mut self, volts: f64) {
        self.voltage_limit = Some(volts);
    }

    pub fn observe_current_limit(&mut self, amps: f64) {
        self.current_limit = Some(amps);
    }

    pub fn observe_set_voltage(&mut self, volts: f64) {
        self.set_voltage = Some(volts);
    }

    pub fn observe_ramp_rate(&mut self, volts_per_second: f64) {
        self.ramp_rate = Some(volts_per_second);
    }

    pub fn observe_trip_current(&mut self, amps: f64) {
        self.trip_current_limit = Some(amps);
    }

    pub fn observe_auto_start(&mut self, auto_start: Option<bool>) {
        self.auto_start = auto_start;
    }

    /// Apply a decoded status reply. Returns the trip classification when this
    /// report is the one that enters `Tripped`.
    pub fn observe_status(
        &mut self,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Option<TripKind> {
        self.status_known = true;
        self.polarity = report.polarity;
        self.hardware_inhibit = report.inhibit;
        self.manual_control = report.manual;
        self.device_error = report.error;

        if report.tripped {
            if self.tripped {
                return None;
            }
            self.tripped = true;
            self.hv_on = false;
            self.ramp_target = None;
            self.turning_off = false;
            self.status = ChannelStatus::Tripped;
            let kind = self.trips.record(now);
            warn!(channel = %self.id, kind = %kind, "channel tripped");
            return Some(kind);
        }
        if self.tripped {
            // Latched until an explicit clear.
            return None;
        }

        if report.emergency_off && !self.emergency_off {
            self.command_emergency_off();
        }
        self.hv_on = report.hv_on && !self.disabled && !self.emergency_off;

        if let Some(reported) = report.reported {
            if reported.is_ramping() {
                if self.ramp_target.is_none() {
                    self.ramp_target = Some(self.set_voltage.unwrap_or(0.0));
                }
                self.status = reported;
            } else if self.ramp_target.is_none() || self.measured_voltage.is_some_and(|u| {
                ramp_direction(u, self.ramp_target.unwrap_or(u)) == ChannelStatus::On
            }) {
                self.ramp_target = None;
                self.status = if self.hv_on { reported } else { ChannelStatus::Off };
            }
        } else if report.ramping {
            let target = self.ramp_target.unwrap_or(if report.hv_on {
                self.set_voltage.unwrap_or(0.0)
            } else {
                0.0
            });
            self.ramp_target = Some(target);
            self.status = match self.measured_voltage.map(|u| ramp_direction(u, target)) {
                Some(ChannelStatus::On) | None => self.status_if_unknown_direction(target),
                Some(direction) => direction,
            };
        } else if self.ramp_target.is_some() && self.turning_off && !report.hv_on {
            self.settle();
        } else if !self.status.is_ramping() || !report.hv_on {
            self.ramp_target = None;
            self.status = if self.hv_on {
                ChannelStatus::On
            } else {
                ChannelStatus::Off
            };
        }
        None
    }

    fn status_if_unknown_direction(&self, target: f64) -> ChannelStatus {
        if self.status.is_ramping() {
            self.status
        } else if target.abs() > 0.0 {
            ChannelStatus::RampUp
        } else {
            ChannelStatus::RampDown
        }
    }

    /// Mark one value unknown after a failed read.
    pub fn invalidate(&mut self, field: Field) {
        match field {
            Field::MeasuredVoltage => self.measured_voltage = None,
            Field::MeasuredCurrent => self.measured_current = None,
            Field::VoltageLimit => self.voltage_limit = None,
            Field::CurrentLimit => self.current_limit = None,
            Field::SetVoltage => self.set_voltage = None,
            Field::RampRate => self.ramp_rate = None,
            Field::TripCurrent => self.trip_current_limit = None,
            Field::AutoStart => self.auto_start = None,
            Field::Status => {
                self.status_known = false;
                self.polarity = Polarity::Unknown;
            }
        }
    }

    /// Forget every device-read value, e.g. once the module is disconnected.
    pub fn invalidate_all(&mut self) {
        for field in Field::iter() {
            self.invalidate(field);
        }
    }
}
