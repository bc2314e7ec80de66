//! Simulated family B module: whole-line echo, CR-LF replies, `(@n)` addressing.

use super::{Outbox, SimChannel, SimError, SimHandle, SimState, format_scaled};
use crate::{
    channel::POLARITY_CHANGE_FRACTION,
    register::{ChannelStatusWord, EventStatusWord, Polarity},
};

pub struct SimulatedScpi {
    handle: SimHandle,
    line: Vec<u8>,
    outbox: Outbox,
}

impl SimulatedScpi {
    /// A module with `channels` outputs, all off.
    pub fn new(channels: u8) -> Self {
        Self {
            handle: SimHandle::new(channels as usize, false, true),
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
        self.line.push(byte);
        if byte != b'\n' {
            return;
        }
        let command = String::from_utf8_lossy(&self.line)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.line.clear();
        self.outbox.push(command.as_bytes());
        self.outbox.push(b"\r\n");
        if let Some(reply) = answer(&mut state, &command) {
            self.outbox.push(reply.as_bytes());
            self.outbox.push(b"\r\n");
        }
        state.log.push(command);
    }
}

/// Split `:VOLT 500,(@0)` into (`:VOLT 500`, Some(0)).
fn split_address(command: &str) -> (&str, Option<usize>) {
    match command.find("(@") {
        Some(position) => {
            let channel = command[position + 2..].trim_end_matches(')').parse().ok();
            let body = command[..position].trim_end_matches([',', ' ']);
            (body, channel)
        }
        None => (command, None),
    }
}

fn status_word(channel: &SimChannel) -> u32 {
    ChannelStatusWord::new()
        .with_positive(channel.polarity == Polarity::Positive)
        .with_on(channel.hv_on)
        .with_ramping(channel.target.is_some())
        .with_emergency_off(channel.emergency_off)
        .with_external_inhibit(channel.inhibit)
        .with_trip(channel.tripped)
        .with_constant_voltage(channel.hv_on && channel.target.is_none())
        .into()
}

fn event_word(channel: &SimChannel) -> u32 {
    EventStatusWord::new()
        .with_emergency_off(channel.emergency_off)
        .with_external_inhibit(channel.inhibit)
        .with_trip(channel.tripped)
        .into()
}

/// Answer a line. Set commands answer nothing.
fn answer(state: &mut SimState, command: &str) -> Option<String> {
    match command {
        "*IDN?" => return Some("CryoSim,HVB 4040,5200010,1.02".to_string()),
        "*OPC?" => return Some("1".to_string()),
        _ => {}
    }
    let (body, address) = split_address(command);
    let Some(channel) = address.and_then(|index| state.channels.get_mut(index)) else {
        state.garbled += 1;
        return Some("?".to_string());
    };
    let (verb, argument) = match body.split_once(' ') {
        Some((verb, argument)) => (verb, Some(argument.trim())),
        None => (body, None),
    };

    let reply = match (verb, argument) {
        ("MEAS:VOLT?", None) => format_scaled(channel.signed_voltage(), 3, "V"),
        ("MEAS:CURR?", None) => format_scaled(channel.current(), -6, "A"),
        ("READ:VOLT:LIM?", None) => format_scaled(channel.voltage_limit, 3, "V"),
        ("READ:CURR:LIM?", None) => format_scaled(channel.current_limit, -6, "A"),
        ("READ:VOLT?", None) => format_scaled(channel.set_point, 3, "V"),
        ("READ:CURR?", None) => format_scaled(channel.trip_current, -6, "A"),
        (":CONF:RAMP:VOLT:UP?", None) => format!("{}V/s", channel.ramp_rate),
        (":READ:CHAN:STAT?", None) => status_word(channel).to_string(),
        (":READ:CHAN:EV:STAT?", None) => event_word(channel).to_string(),
        (":CONF:OUTP:POL?", None) => channel.polarity.to_string(),
        (":VOLT", Some("ON")) => {
            if !channel.emergency_off && !channel.tripped && !channel.inhibit {
                channel.hv_on = true;
                channel.target = Some(channel.set_point);
            }
            return None;
        }
        (":VOLT", Some("OFF")) => {
            channel.hv_on = false;
            channel.target = Some(0.0);
            return None;
        }
        (":VOLT", Some("EMCY OFF")) => {
            channel.emergency_off = true;
            channel.hv_on = false;
            channel.voltage = 0.0;
            channel.target = None;
            return None;
        }
        (":VOLT", Some(value)) => {
            if let Ok(volts) = value.parse::<f64>() {
                if volts <= channel.voltage_limit {
                    channel.set_point = volts;
                    if channel.hv_on {
                        channel.target = Some(volts);
                    }
                }
            }
            return None;
        }
        (":CONF:RAMP:VOLT:UP" | ":CONF:RAMP:VOLT:DOWN", Some(value)) => {
            if let Ok(rate) = value.parse::<f64>() {
                channel.ramp_rate = rate;
            }
            return None;
        }
        (":CONF:OUTP:POL", Some(value)) => {
            let near_zero =
                channel.voltage <= POLARITY_CHANGE_FRACTION * channel.voltage_limit;
            if let Ok(polarity) = value.parse::<Polarity>() {
                // Refused silently while energized; the read-back shows it.
                if !channel.hv_on && near_zero && polarity != Polarity::Unknown {
                    channel.polarity = polarity;
                }
            }
            return None;
        }
        (":EV", Some("CLEAR")) => {
            channel.tripped = false;
            channel.emergency_off = false;
            return None;
        }
        _ => {
            state.garbled += 1;
            "?".to_string()
        }
    };
    Some(reply)
}

impl embedded_io::ErrorType for SimulatedScpi {
    type Error = SimError;
}

impl embedded_io::Write for SimulatedScpi {
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

impl embedded_io::Read for SimulatedScpi {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.outbox.read(buf)
    }
}
