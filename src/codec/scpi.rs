//! Family B codec: SCPI-like lines addressed with a `(@n)` channel suffix.
//!
//! The device echoes the whole command line once, then answers queries with one
//! CR-LF terminated line. Set commands carry no answer, so each one is confirmed
//! with `*OPC?`.
//!
//! Measured values carry their scale and unit: volts as `<kV>E3V`, amps as
//! `<µA>E-6A`, ramp rates as `<V/s>V/s`.

use embedded_io::{Read, Write};
use tracing::{debug, trace};

use super::{DeviceInfo, HvCodec, StatusReport, discard_pending, parse_with_unit, read_line};
use crate::{
    error::{Error, Result},
    register::{ChannelStatus, ChannelStatusWord, EventStatusWord, Family, Polarity},
};

/// You can create a family B codec using any interface which implements
/// [embedded_io::Read] & [embedded_io::Write].
pub struct ScpiCodec<S: Read + Write> {
    interface: S,
}

impl<S: Read + Write> ScpiCodec<S> {
    pub fn new(interface: S) -> Self {
        Self { interface }
    }

    /// Send one line and check its echo.
    fn send_line(&mut self, command: &str) -> Result<()> {
        trace!(command, "family B exchange");
        self.interface
            .write_all(command.as_bytes())
            .map_err(Error::serial)?;
        self.interface.write_all(b"\r\n").map_err(Error::serial)?;
        self.interface.flush().map_err(Error::serial)?;

        let echo = read_line(&mut self.interface, b'\n')?;
        if echo != command {
            return Err(Error::EchoMismatch {
                sent: command.to_string(),
                received: echo,
            });
        }
        Ok(())
    }

    /// Send a query and return its answer line.
    pub fn query(&mut self, command: &str) -> Result<String> {
        self.send_line(command)?;
        let reply = read_line(&mut self.interface, b'\n')?;
        if reply.starts_with('?') {
            debug!(command, reply = %reply, "family B device error");
            return Err(Error::DeviceRejected(reply));
        }
        Ok(reply)
    }

    /// Send a set command and wait for operation complete.
    pub fn command(&mut self, command: &str) -> Result<()> {
        self.send_line(command)?;
        let complete = self.query("*OPC?")?;
        if complete.trim() == "1" {
            Ok(())
        } else {
            Err(Error::InvalidResponse(complete))
        }
    }

    fn query_value(&mut self, command: &str) -> Result<f64> {
        let reply = self.query(command)?;
        parse_with_unit(&reply)
    }

    fn query_word(&mut self, command: &str) -> Result<u32> {
        let reply = self.query(command)?;
        reply
            .trim()
            .parse()
            .map_err(|_| Error::InvalidResponse(reply.clone()))
    }

    pub fn get_channel_status(&mut self, channel: u8) -> Result<ChannelStatusWord> {
        let raw = self.query_word(&format!(":READ:CHAN:STAT? (@{channel})"))?;
        Ok(ChannelStatusWord::from(raw))
    }

    pub fn get_event_status(&mut self, channel: u8) -> Result<EventStatusWord> {
        let raw = self.query_word(&format!(":READ:CHAN:EV:STAT? (@{channel})"))?;
        Ok(EventStatusWord::from(raw))
    }

    pub fn get_polarity(&mut self, channel: u8) -> Result<Polarity> {
        let reply = self.query(&format!(":CONF:OUTP:POL? (@{channel})"))?;
        reply
            .trim()
            .parse::<Polarity>()
            .map_err(|_| Error::InvalidResponse(reply.clone()))
    }

    pub fn operation_complete(&mut self) -> Result<bool> {
        Ok(self.query("*OPC?")?.trim() == "1")
    }
}

impl<S: Read + Write + Send> HvCodec for ScpiCodec<S> {
    fn family(&self) -> Family {
        Family::FamilyB
    }

    fn identify(&mut self) -> Result<DeviceInfo> {
        let reply = self.query("*IDN?")?;
        let fields: Vec<&str> = reply.split(',').map(str::trim).collect();
        let [manufacturer, model, serial, firmware] = fields.as_slice() else {
            return Err(Error::InvalidResponse(reply.clone()));
        };
        Ok(DeviceInfo {
            model: format!("{manufacturer} {model}"),
            serial_number: serial.to_string(),
            firmware: firmware.to_string(),
            voltage_rating: None,
            current_rating: None,
        })
    }

    fn read_voltage(&mut self, channel: u8) -> Result<f64> {
        self.query_value(&format!("MEAS:VOLT? (@{channel})"))
    }

    fn read_current(&mut self, channel: u8) -> Result<f64> {
        self.query_value(&format!("MEAS:CURR? (@{channel})"))
    }

    fn get_voltage_limit(&mut self, channel: u8) -> Result<f64> {
        self.query_value(&format!("READ:VOLT:LIM? (@{channel})"))
    }

    fn get_current_limit(&mut self, channel: u8) -> Result<f64> {
        self.query_value(&format!("READ:CURR:LIM? (@{channel})"))
    }

    fn get_set_voltage(&mut self, channel: u8) -> Result<f64> {
        self.query_value(&format!("READ:VOLT? (@{channel})"))
    }

    /// The device starts ramping toward a new set-point by itself while HV is on.
    fn set_voltage(&mut self, channel: u8, volts: f64) -> Result<()> {
        self.command(&format!(":VOLT {},(@{channel})", volts.abs()))
    }

    fn get_ramp_rate(&mut self, channel: u8) -> Result<f64> {
        self.query_value(&format!(":CONF:RAMP:VOLT:UP? (@{channel})"))
    }

    /// Sets the up and down ramp rates together.
    fn set_ramp_rate(&mut self, channel: u8, volts_per_second: f64) -> Result<()> {
        let rate = volts_per_second.abs();
        self.command(&format!(":CONF:RAMP:VOLT:UP {rate},(@{channel})"))?;
        self.command(&format!(":CONF:RAMP:VOLT:DOWN {rate},(@{channel})"))
    }

    fn get_trip_current(&mut self, channel: u8) -> Result<f64> {
        self.query_value(&format!("READ:CURR? (@{channel})"))
    }

    fn read_status(&mut self, channel: u8) -> Result<StatusReport> {
        let status = self.get_channel_status(channel)?;
        let events = self.get_event_status(channel)?;
        let tripped = status.trip() || events.trip();
        Ok(StatusReport {
            reported: tripped.then_some(ChannelStatus::Tripped),
            hv_on: status.on(),
            ramping: status.ramping(),
            polarity: if status.positive() {
                Polarity::Positive
            } else {
                Polarity::Negative
            },
            tripped,
            inhibit: status.external_inhibit() || events.external_inhibit(),
            emergency_off: status.emergency_off() || events.emergency_off(),
            manual: false,
            error: status.input_error()
                || status.current_limit_exceeded()
                || status.voltage_limit_exceeded(),
        })
    }

    fn get_auto_start(&mut self, _channel: u8) -> Result<Option<bool>> {
        Ok(None)
    }

    /// Ramping follows from enabling the output; the device does not name a direction.
    fn start_ramp(&mut self, channel: u8) -> Result<Option<ChannelStatus>> {
        self.set_hv(channel, true)?;
        Ok(None)
    }

    fn set_hv(&mut self, channel: u8, on: bool) -> Result<()> {
        let state = if on { "ON" } else { "OFF" };
        self.command(&format!(":VOLT {state},(@{channel})"))
    }

    fn emergency_off(&mut self, channel: u8) -> Result<()> {
        self.command(&format!(":VOLT EMCY OFF,(@{channel})"))
    }

    fn clear_events(&mut self, channel: u8) -> Result<()> {
        self.command(&format!(":EV CLEAR,(@{channel})"))
    }

    /// The device silently ignores a polarity change it refuses, so the setting
    /// is read back.
    fn set_polarity(&mut self, channel: u8, polarity: Polarity) -> Result<()> {
        if polarity == Polarity::Unknown {
            return Err(Error::Rejected("polarity must be positive or negative".into()));
        }
        self.command(&format!(":CONF:OUTP:POL {polarity},(@{channel})"))?;
        let applied = self.get_polarity(channel)?;
        if applied != polarity {
            return Err(Error::Rejected(format!(
                "device kept polarity {applied} on channel {channel}"
            )));
        }
        Ok(())
    }

    fn discard_input(&mut self) -> usize {
        discard_pending(&mut self.interface)
    }
}
