//! Simulated family A module: per-character echo, CR-terminated replies.

use std::time::Duration;

use super::{Outbox, SimError, SimHandle, SimState};
use crate::{codec::char_echo::format_mantissa_exponent, register::ModuleStatusByte};

pub struct SimulatedCharEcho {
    handle: SimHandle,
    line: Vec<u8>,
    outbox: Outbox,
}

impl SimulatedCharEcho {
    /// A module with `channels` outputs, HV switch on, all at zero.
    pub fn new(channels: u8) -> Self {
        Self {
            handle: SimHandle::new(channels as usize, true, false),
            line: Vec::new(),
            outbox: Outbox::default(),
        }
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    fn receive(&mut self, byte: u8) {
        let mut state = self.handle.state.lock();
        if state.silent {
            return;
        }
        self.outbox.push(&[byte]);
        self.line.push(byte);
        if !self.line.ends_with(b"\r\n") {
            return;
        }
        let command = String::from_utf8_lossy(&self.line[..self.line.len() - 2]).into_owned();
        self.line.clear();
        let reply = answer(&mut state, &command);
        state.log.push(command);
        self.outbox.push(reply.as_bytes());
        self.outbox.push(b"\r");
    }
}

/// Split `D1=1000` into (`D`, 1, Some("1000")).
fn parse(command: &str) -> Option<(char, usize, Option<&str>)> {
    let mut chars = command.chars();
    let letter = chars.next()?;
    let rest = chars.as_str();
    let (address, value) = match rest.split_once('=') {
        Some((address, value)) => (address, Some(value)),
        None => (rest, None),
    };
    let address: usize = address.parse().ok()?;
    Some((letter, address, value))
}

fn answer(state: &mut SimState, command: &str) -> String {
    if command == "#" {
        return "484216;3.14;4000V;3mA".to_string();
    }
    let Some((letter, address, value)) = parse(command) else {
        state.garbled += 1;
        return "????".to_string();
    };
    let Some(channel) = address
        .checked_sub(1)
        .and_then(|index| state.channels.get_mut(index))
    else {
        return "?WCN".to_string();
    };

    match (letter, value) {
        ('U', None) => format!("{:+06.0}", channel.signed_voltage()),
        ('I', None) => format_mantissa_exponent(channel.current()),
        ('M', None) => format!("{:.0}", channel.voltage_limit),
        ('N', None) => format_mantissa_exponent(channel.current_limit),
        ('D', None) => format!("{:.0}", channel.set_point),
        ('V', None) => format!("{:.0}", channel.ramp_rate),
        ('L', None) => format_mantissa_exponent(channel.trip_current),
        ('A', None) => if channel.auto_start { "8" } else { "0" }.to_string(),
        ('S', None) => {
            let token = if channel.tripped {
                // Reading the status acknowledges the trip.
                channel.tripped = false;
                "TRP"
            } else if channel.inhibit {
                "INH"
            } else if !channel.hv_on {
                "OFF"
            } else {
                ramp_token(channel.target, channel.voltage)
            };
            format!("S{address}={token}")
        }
        ('T', None) => {
            let bits = ModuleStatusByte::new()
                .with_positive(channel.polarity == crate::register::Polarity::Positive)
                .with_hv_switch_off(!channel.hv_on)
                .with_inhibit(channel.inhibit);
            u8::from(bits).to_string()
        }
        ('G', None) => {
            if channel.tripped {
                return format!("S{address}=TRP");
            }
            if (channel.set_point - channel.voltage).abs() > 0.0 && channel.hv_on {
                channel.target = Some(channel.set_point);
            }
            format!("S{address}={}", ramp_token(channel.target, channel.voltage))
        }
        ('D', Some(value)) => match value.parse::<f64>() {
            Ok(volts) if volts > channel.voltage_limit => {
                format!("? UMAX={:.0}", channel.voltage_limit)
            }
            Ok(volts) => {
                channel.set_point = volts;
                String::new()
            }
            Err(_) => "????".to_string(),
        },
        ('V', Some(value)) => match value.parse::<f64>() {
            Ok(rate) if rate > 0.0 => {
                channel.ramp_rate = rate;
                String::new()
            }
            _ => "????".to_string(),
        },
        _ => {
            state.garbled += 1;
            "????".to_string()
        }
    }
}

fn ramp_token(target: Option<f64>, voltage: f64) -> &'static str {
    match target {
        Some(target) if target > voltage => "L2H",
        Some(_) => "H2L",
        None => "ON",
    }
}

impl embedded_io::ErrorType for SimulatedCharEcho {
    type Error = SimError;
}

impl embedded_io::Write for SimulatedCharEcho {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        for &byte in buf {
            self.receive(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl embedded_io::Read for SimulatedCharEcho {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.outbox.read(buf)
    }
}

/// Handy for tests that step a ramp: ticks `total` in `step` increments.
pub fn tick_in_steps(handle: &SimHandle, total: Duration, step: Duration) {
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        let dt = step.min(total - elapsed);
        handle.tick(dt);
        elapsed += dt;
    }
}
